//! Route handlers, one module per resource.
//!
//! Handlers take extractor results as `Result<_, Rejection>` so malformed
//! paths, queries and bodies surface through the common error envelope.

pub mod agents;
pub mod executions;
pub mod handoffs;
pub mod metrics;
pub mod workflows;

use serde::Deserialize;

/// Cursor pagination parameters shared by every list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}
