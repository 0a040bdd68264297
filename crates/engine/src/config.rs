//! Engine tuning knobs. Every field has a default so partial TOML sections
//! deserialize cleanly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on agent calls in flight across all executions.
    /// `None` means unbounded.
    pub max_concurrent_steps: Option<usize>,
    /// Per-call timeout for steps that do not set their own.
    pub default_step_timeout_ms: u64,
    /// Lifetime of fast-state cache entries.
    pub cache_ttl_secs: u64,
    /// How many handoff generations may chain off a declared step.
    pub max_handoff_depth: u32,
    /// Page size used when a list request gives none.
    pub default_list_limit: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: None,
            default_step_timeout_ms: 120_000,
            cache_ttl_secs: 300,
            max_handoff_depth: 3,
            default_list_limit: 20,
        }
    }
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
