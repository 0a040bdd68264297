//! `EchoAgent` — returns its input unchanged.
//!
//! Registered by the CLI so workflows can be exercised end to end without any
//! external agent service.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Agent, AgentError, InvocationContext};

pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn handle(&self, input: Value, _ctx: &InvocationContext) -> Result<Value, AgentError> {
        Ok(input)
    }
}
