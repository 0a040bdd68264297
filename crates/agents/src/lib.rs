//! `agents` crate — the agent port, the in-process registry and built-in
//! agent implementations.
//!
//! Every agent the engine can dispatch to implements [`Agent`]. The engine
//! itself only talks to an [`AgentPort`], which [`AgentRegistry`] provides.

pub mod echo;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::AgentError;
pub use registry::{AgentRegistration, AgentRegistry};
pub use traits::{Agent, AgentPort, InvocationContext};
