//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Domain types live in the `engine` crate and travel through the
//! `definition` / `snapshot` JSON columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// workflows / workflow_versions
// ---------------------------------------------------------------------------

/// Catalog status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Deleted,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active"  => Ok(Self::Active),
            "deleted" => Ok(Self::Deleted),
            other     => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// A workflow catalog row joined with the definition of its latest revision.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRecord {
    pub seq: i64,
    pub id: String,
    pub latest_version: i64,
    pub status: String,
    /// Full JSON definition of the latest revision.
    pub definition: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Catalog columns written on create and on every new revision.
#[derive(Debug, Clone)]
pub struct NewWorkflowVersion<'a> {
    pub id: &'a str,
    pub version: i64,
    pub name: &'a str,
    pub description: &'a str,
    /// JSON array of tag strings.
    pub tags: String,
    /// Full JSON definition of this revision.
    pub definition: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable revision of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowVersionRow {
    pub workflow_id: String,
    pub version: i64,
    pub definition: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// A persisted execution. `snapshot` holds the full serialized execution
/// state; the other columns exist for filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: String,
    pub workflow_id: String,
    pub workflow_version: i64,
    pub status: String,
    pub priority: i64,
    pub snapshot: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// An execution row plus its insertion sequence, for cursor pagination.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionListRow {
    pub seq: i64,
    #[sqlx(flatten)]
    pub row: ExecutionRow,
}

// ---------------------------------------------------------------------------
// handoffs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HandoffRow {
    pub seq: i64,
    pub id: String,
    pub source_agent_id: String,
    pub target_agent_id: String,
    /// Full JSON handoff definition.
    pub definition: String,
    pub created_at: DateTime<Utc>,
}
