//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like
//! in memory. They are serialised to/from the JSON `definition` column of
//! the `workflow_versions` table.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name → expression map used for input, output and handoff data mappings.
pub type Mapping = BTreeMap<String, String>;

/// Longest delay a retry backoff may produce.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff policy for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `2` means up to three attempts.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_factor: default_backoff_factor(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn retries(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay_ms: initial_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Delay before retrying after `attempts` attempts have been made:
    /// `initial_delay * backoff_factor^(attempts - 1)`, capped.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay_ms as f64 * factor.powi(exponent);
        Duration::from_millis(millis as u64).min(MAX_BACKOFF)
    }
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// A single unit of work in the workflow graph, bound to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique identifier within this workflow (referenced by `depends_on`).
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Agent that executes the step.
    pub agent_id: String,
    /// Step-local input name → source expression.
    #[serde(default)]
    pub input_mapping: Mapping,
    /// Output namespace key → expression over this step's output.
    #[serde(default)]
    pub output_mapping: Mapping,
    /// Fixed input; mapped inputs are merged over it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_input: Option<Value>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Per-call timeout; the engine default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Agent tried once after retries are exhausted.
    #[serde(default)]
    pub fallback_agent_id: Option<String>,
    /// Run condition; when it evaluates false the step is skipped.
    #[serde(default)]
    pub condition: Option<String>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_id: agent_id.into(),
            input_mapping: Mapping::new(),
            output_mapping: Mapping::new(),
            static_input: None,
            depends_on: BTreeSet::new(),
            timeout_ms: None,
            retry_policy: RetryPolicy::default(),
            fallback_agent_id: None,
            condition: None,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.input_mapping.insert(name.into(), expr.into());
        self
    }

    pub fn output(mut self, key: impl Into<String>, expr: impl Into<String>) -> Self {
        self.output_mapping.insert(key.into(), expr.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn fallback(mut self, agent_id: impl Into<String>) -> Self {
        self.fallback_agent_id = Some(agent_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Effective timeout given the engine default.
    pub fn effective_timeout(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(default_ms))
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// One published revision of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Top-level fields every execution input must carry.
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Steps in insertion order; this order breaks dispatch ties.
    pub steps: Vec<StepDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Caller-supplied content of a new workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub required_inputs: Vec<String>,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDraft {
    /// Convenience constructor for tests and the CLI.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            steps,
            ..Self::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required_inputs.push(field.into());
        self
    }
}

/// Partial update; unset fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub required_inputs: Option<Vec<String>>,
    #[serde(default)]
    pub steps: Option<Vec<StepDefinition>>,
}

impl WorkflowPatch {
    /// The draft that results from applying this patch to `current`.
    pub fn apply(self, current: &WorkflowDefinition) -> WorkflowDraft {
        WorkflowDraft {
            name: self.name.unwrap_or_else(|| current.name.clone()),
            description: self.description.unwrap_or_else(|| current.description.clone()),
            tags: self.tags.unwrap_or_else(|| current.tags.clone()),
            metadata: self.metadata.unwrap_or_else(|| current.metadata.clone()),
            required_inputs: self
                .required_inputs
                .unwrap_or_else(|| current.required_inputs.clone()),
            steps: self.steps.unwrap_or_else(|| current.steps.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Handoffs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffType {
    /// Handoffs of one source run one after another.
    Sequential,
    /// Handoffs of one source run side by side.
    Parallel,
    /// Fires only when at least one trigger condition is declared and all hold.
    Conditional,
}

/// A condition-gated transfer from one agent to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffDefinition {
    pub id: Uuid,
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub handoff_type: HandoffType,
    #[serde(default)]
    pub data_mapping: Mapping,
    #[serde(default)]
    pub trigger_conditions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied content of a new handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffDraft {
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub handoff_type: HandoffType,
    #[serde(default)]
    pub data_mapping: Mapping,
    #[serde(default)]
    pub trigger_conditions: Vec<String>,
}

impl HandoffDraft {
    pub fn new(
        source_agent_id: impl Into<String>,
        target_agent_id: impl Into<String>,
        handoff_type: HandoffType,
    ) -> Self {
        Self {
            source_agent_id: source_agent_id.into(),
            target_agent_id: target_agent_id.into(),
            handoff_type,
            data_mapping: Mapping::new(),
            trigger_conditions: Vec::new(),
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.trigger_conditions.push(condition.into());
        self
    }

    pub fn map(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.data_mapping.insert(name.into(), expr.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_factor: 2.0,
            initial_delay_ms: 100,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(40), MAX_BACKOFF);
    }

    #[test]
    fn step_definition_defaults_from_minimal_json() {
        let step: StepDefinition =
            serde_json::from_value(serde_json::json!({ "id": "a", "agent_id": "echo" })).unwrap();
        assert!(step.depends_on.is_empty());
        assert_eq!(step.retry_policy, RetryPolicy::default());
        assert_eq!(step.effective_timeout(5_000), Duration::from_secs(5));
    }

    #[test]
    fn patch_only_replaces_given_fields() {
        let now = Utc::now();
        let current = WorkflowDefinition {
            id: Uuid::new_v4(),
            name: "old".into(),
            description: "keep me".into(),
            version: 3,
            tags: BTreeSet::new(),
            metadata: Map::new(),
            required_inputs: vec![],
            steps: vec![StepDefinition::new("a", "echo")],
            created_at: now,
            updated_at: now,
        };
        let draft = WorkflowPatch {
            name: Some("new".into()),
            ..WorkflowPatch::default()
        }
        .apply(&current);

        assert_eq!(draft.name, "new");
        assert_eq!(draft.description, "keep me");
        assert_eq!(draft.steps, current.steps);
    }
}
