//! `db` crate — pure persistence layer.
//!
//! Provides a connection pool, typed row structs, repository functions for
//! every table, and the fast-state cache that fronts the execution store.
//! No business logic lives here.

pub mod cache;
pub mod error;
pub mod models;
pub mod pool;
pub mod repository;
pub mod storage;

pub use cache::{CacheError, StateCache, TtlCache};
pub use error::DbError;
pub use pool::DbPool;
pub use repository::Page;
pub use storage::Storage;
