//! In-process agent registry.
//!
//! Maps agent ids to handlers plus the registration metadata (capability
//! tags and opaque routing config) that callers supplied. The registry is
//! also the default [`AgentPort`]: it looks up the handler and enforces the
//! per-call timeout.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{Agent, AgentError, AgentPort, InvocationContext};

/// Metadata supplied when registering an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    /// Capability tags, e.g. `summarize`, `search`.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Opaque routing configuration; stored and reported, never interpreted.
    #[serde(default)]
    pub routing: Value,
}

impl AgentRegistration {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            routing: Value::Null,
        }
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }
}

struct RegisteredAgent {
    registration: AgentRegistration,
    handler: Arc<dyn Agent>,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, RegisteredAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an agent. Returns the previous registration if
    /// the id was already taken.
    pub fn register_agent(
        &self,
        registration: AgentRegistration,
        handler: Arc<dyn Agent>,
    ) -> Option<AgentRegistration> {
        info!(agent_id = %registration.id, capabilities = ?registration.capabilities, "agent registered");
        self.agents
            .insert(
                registration.id.clone(),
                RegisteredAgent {
                    registration,
                    handler,
                },
            )
            .map(|previous| previous.registration)
    }

    pub fn deregister(&self, agent_id: &str) -> bool {
        self.agents.remove(agent_id).is_some()
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.get(agent_id).map(|a| a.registration.clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// All registrations, sorted by id.
    pub fn list(&self) -> Vec<AgentRegistration> {
        let mut all: Vec<AgentRegistration> = self
            .agents
            .iter()
            .map(|entry| entry.registration.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Registrations advertising the given capability tag, sorted by id.
    pub fn find_by_capability(&self, tag: &str) -> Vec<AgentRegistration> {
        self.list()
            .into_iter()
            .filter(|r| r.capabilities.contains(tag))
            .collect()
    }
}

#[async_trait]
impl AgentPort for AgentRegistry {
    async fn invoke(
        &self,
        agent_id: &str,
        input: Value,
        timeout: Duration,
        ctx: &InvocationContext,
    ) -> Result<Value, AgentError> {
        // Clone the handler out so no map guard is held across the await.
        let handler = self
            .agents
            .get(agent_id)
            .map(|a| Arc::clone(&a.handler))
            .ok_or_else(|| AgentError::NotFound(agent_id.to_owned()))?;

        debug!(agent_id, step_id = %ctx.step_id, attempt = ctx.attempt, "invoking agent");

        match tokio::time::timeout(timeout, handler.handle(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(timeout)),
        }
    }
}
