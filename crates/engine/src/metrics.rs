//! Execution metrics, computed from persisted execution rows.
//!
//! Read-only and off the hot path: nothing here touches the scheduler.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use db::{models::ExecutionRow, repository::executions as exec_repo, DbPool};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{execution::ExecutionStatus, EngineError};

/// Named look-back window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[default]
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
    #[serde(rename = "all")]
    All,
}

impl TimeRange {
    /// Start of the window ending at `now`; `None` for `all`.
    pub fn since(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let span = match self {
            Self::LastHour => Duration::hours(1),
            Self::LastDay => Duration::hours(24),
            Self::LastWeek => Duration::days(7),
            Self::LastMonth => Duration::days(30),
            Self::All => return None,
        };
        Some(now - span)
    }
}

impl FromStr for TimeRange {
    type Err = EngineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::LastHour),
            "24h" => Ok(Self::LastDay),
            "7d" => Ok(Self::LastWeek),
            "30d" => Ok(Self::LastMonth),
            "all" => Ok(Self::All),
            other => Err(EngineError::InvalidInput(format!(
                "unknown time range '{other}' (expected 1h, 24h, 7d, 30d or all)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionMetrics {
    pub range: TimeRange,
    pub workflow_id: Option<Uuid>,
    pub execution_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub cancelled_count: u64,
    /// Completed / finished, in `0.0..=1.0`; `0.0` when nothing finished.
    pub success_rate: f64,
    /// Mean wall time of finished executions that actually started.
    pub average_duration_ms: Option<f64>,
}

/// Fold rows into metrics. Rows with an unknown status only count towards
/// `execution_count`.
pub fn aggregate(rows: &[ExecutionRow], range: TimeRange, workflow_id: Option<Uuid>) -> ExecutionMetrics {
    let mut metrics = ExecutionMetrics {
        range,
        workflow_id,
        execution_count: rows.len() as u64,
        ..ExecutionMetrics::default()
    };

    let mut total_ms = 0.0;
    let mut timed = 0u64;
    for row in rows {
        match row.status.parse::<ExecutionStatus>() {
            Ok(ExecutionStatus::Completed) => metrics.completed_count += 1,
            Ok(ExecutionStatus::Failed) => metrics.failed_count += 1,
            Ok(ExecutionStatus::Cancelled) => metrics.cancelled_count += 1,
            _ => continue,
        }
        if let (Some(start), Some(end)) = (row.started_at, row.finished_at) {
            total_ms += (end - start).num_milliseconds().max(0) as f64;
            timed += 1;
        }
    }

    let finished = metrics.completed_count + metrics.failed_count + metrics.cancelled_count;
    if finished > 0 {
        metrics.success_rate = metrics.completed_count as f64 / finished as f64;
    }
    if timed > 0 {
        metrics.average_duration_ms = Some(total_ms / timed as f64);
    }
    metrics
}

/// Load the rows for `range` and aggregate them.
pub async fn collect(
    pool: &DbPool,
    range: TimeRange,
    workflow_id: Option<Uuid>,
) -> Result<ExecutionMetrics, EngineError> {
    let since = range.since(Utc::now());
    let workflow = workflow_id.map(|id| id.to_string());
    let rows = exec_repo::list_executions_since(pool, since, workflow.as_deref()).await?;
    Ok(aggregate(&rows, range, workflow_id))
}
