//! `MockAgent` — a test double for [`Agent`].
//!
//! Useful in unit and integration tests where a real agent implementation is
//! either unavailable or irrelevant.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Agent, AgentError, InvocationContext};

type ComputeFn = dyn Fn(&Value) -> Result<Value, AgentError> + Send + Sync;

/// Behaviour injected into `MockAgent` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Derive the output from the input.
    Compute(Arc<ComputeFn>),
    /// Fail with the given error on every call.
    Fail(AgentError),
    /// Fail with a transient error for the first `failures` calls, then
    /// return `value`.
    Flaky { failures: usize, value: Value },
}

/// A mock agent that records every call it receives and returns a
/// programmer-specified result.
pub struct MockAgent {
    /// Label used in test assertions and error messages.
    pub name: String,
    /// What the agent will do when `handle` is called.
    pub behaviour: MockBehaviour,
    /// Sleep before answering; lets tests shape completion order.
    pub delay: Option<Duration>,
    /// All inputs seen by this agent (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockAgent {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock whose output is computed from its input.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, AgentError> + Send + Sync + 'static,
    {
        Self::with_behaviour(name, MockBehaviour::Compute(Arc::new(f)))
    }

    /// Create a mock that always fails with a transient `Failed` error.
    pub fn failing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Fail(AgentError::Failed(msg.into())))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Fail(AgentError::Fatal(msg.into())))
    }

    /// Create a mock that fails `failures` times before succeeding.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::Flaky { failures, value })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times this agent has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Inputs received so far, in call order.
    pub fn inputs(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn handle(&self, input: Value, _ctx: &InvocationContext) -> Result<Value, AgentError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(input.clone());
            calls.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::Compute(f) => f(&input),
            MockBehaviour::Fail(err) => Err(err.clone()),
            MockBehaviour::Flaky { failures, value } => {
                if call_index <= *failures {
                    Err(AgentError::Failed(format!(
                        "{} transient failure #{call_index}",
                        self.name
                    )))
                } else {
                    Ok(value.clone())
                }
            }
        }
    }
}
