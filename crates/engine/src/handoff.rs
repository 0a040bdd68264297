//! Handoff resolver and catalog.
//!
//! After a step succeeds, every handoff whose `source_agent_id` matches the
//! agent that produced the output is evaluated. A handoff fires when all of
//! its trigger conditions hold; its `data_mapping` (with `output` bound to
//! the step's output) becomes the input of a dynamic step that runs the
//! target agent.
//!
//! Resolution never aborts an execution: malformed conditions count as
//! false and unresolvable mappings drop the handoff, both with a warning.

use std::collections::HashSet;

use chrono::Utc;
use db::{models::HandoffRow, repository::handoffs as handoff_repo, DbPool, Page};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    condition,
    execution::StepOrigin,
    mapping::MappingContext,
    models::{HandoffDefinition, HandoffDraft, HandoffType, RetryPolicy, StepDefinition},
    EngineError,
};

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// A handoff whose conditions held, with its mapped input.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredHandoff {
    pub handoff: HandoffDefinition,
    pub input: Value,
}

/// Evaluate `handoffs` against a succeeded step's output.
///
/// `ctx` must have `output` bound to that step's output. Handoffs are
/// returned in catalog order.
pub fn resolve_handoffs(handoffs: &[HandoffDefinition], ctx: &MappingContext<'_>) -> Vec<FiredHandoff> {
    handoffs
        .iter()
        .filter(|h| {
            if h.handoff_type == HandoffType::Conditional && h.trigger_conditions.is_empty() {
                return false;
            }
            h.trigger_conditions.iter().all(|c| condition::holds(c, ctx))
        })
        .filter_map(|h| {
            let input = if h.data_mapping.is_empty() {
                ctx.current.cloned().unwrap_or(Value::Null)
            } else {
                match ctx.resolve_mapping(&h.data_mapping) {
                    Ok(mapped) => Value::Object(mapped),
                    Err(e) => {
                        warn!(handoff_id = %h.id, error = %e, "handoff data mapping failed; skipping");
                        return None;
                    }
                }
            };
            Some(FiredHandoff { handoff: h.clone(), input })
        })
        .collect()
}

/// Turn fired handoffs into dynamic steps hanging off `source`.
///
/// Parallel and conditional handoffs depend only on the source step;
/// sequential ones are chained behind each other in the order given.
/// Dynamic steps inherit the source timeout and never retry.
pub fn plan_dynamic_steps(
    source: &StepDefinition,
    source_depth: u32,
    fired: Vec<FiredHandoff>,
    taken_ids: &HashSet<String>,
) -> Vec<(StepDefinition, StepOrigin)> {
    let mut taken: HashSet<String> = taken_ids.clone();
    let mut previous_sequential: Option<String> = None;
    let mut planned = Vec::with_capacity(fired.len());

    for FiredHandoff { handoff, input } in fired {
        let id = unique_step_id(&source.id, &handoff.target_agent_id, &mut taken);
        let upstream = match handoff.handoff_type {
            HandoffType::Sequential => previous_sequential
                .replace(id.clone())
                .unwrap_or_else(|| source.id.clone()),
            HandoffType::Parallel | HandoffType::Conditional => source.id.clone(),
        };

        let mut step = StepDefinition::new(id, handoff.target_agent_id.clone()).depends_on([upstream]);
        step.name = format!("handoff {} -> {}", source.id, handoff.target_agent_id);
        step.static_input = Some(input);
        step.timeout_ms = source.timeout_ms;
        step.retry_policy = RetryPolicy::default();

        let origin = StepOrigin::Handoff {
            handoff_id: handoff.id,
            source_step: source.id.clone(),
            depth: source_depth + 1,
        };
        planned.push((step, origin));
    }
    planned
}

// Step ids travel through mapping paths, so no '.' or whitespace.
fn unique_step_id(source: &str, target_agent: &str, taken: &mut HashSet<String>) -> String {
    let target: String = target_agent
        .chars()
        .map(|c| if c == '.' || c.is_whitespace() { '_' } else { c })
        .collect();
    let base = format!("{source}->{target}");
    let mut candidate = base.clone();
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = format!("{base}#{n}");
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Durable catalog of handoff definitions.
#[derive(Clone)]
pub struct HandoffCatalog {
    pool: DbPool,
}

impl HandoffCatalog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Validate and persist a new handoff.
    #[instrument(skip(self, draft), fields(source = %draft.source_agent_id, target = %draft.target_agent_id))]
    pub async fn register(&self, draft: HandoffDraft) -> Result<HandoffDefinition, EngineError> {
        validate_draft(&draft)?;

        let definition = HandoffDefinition {
            id: Uuid::new_v4(),
            source_agent_id: draft.source_agent_id,
            target_agent_id: draft.target_agent_id,
            handoff_type: draft.handoff_type,
            data_mapping: draft.data_mapping,
            trigger_conditions: draft.trigger_conditions,
            created_at: Utc::now(),
        };

        handoff_repo::insert_handoff(
            &self.pool,
            &definition.id.to_string(),
            &definition.source_agent_id,
            &definition.target_agent_id,
            &serde_json::to_string(&definition)?,
            definition.created_at,
        )
        .await?;

        info!("handoff '{}' registered", definition.id);
        Ok(definition)
    }

    pub async fn get(&self, id: Uuid) -> Result<HandoffDefinition, EngineError> {
        match handoff_repo::get_handoff(&self.pool, &id.to_string()).await {
            Ok(row) => decode(&row),
            Err(db::DbError::NotFound) => Err(EngineError::not_found("handoff", id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(
        &self,
        source_agent_id: Option<&str>,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<Page<HandoffDefinition>, EngineError> {
        let page = handoff_repo::list_handoffs(&self.pool, source_agent_id, cursor, limit).await?;
        let items = page.items.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, next_cursor: page.next_cursor })
    }

    /// Every handoff for `agent_id`, in registration order.
    pub async fn for_source(&self, agent_id: &str) -> Result<Vec<HandoffDefinition>, EngineError> {
        handoff_repo::handoffs_for_source(&self.pool, agent_id)
            .await?
            .iter()
            .map(decode)
            .collect()
    }
}

fn decode(row: &HandoffRow) -> Result<HandoffDefinition, EngineError> {
    Ok(serde_json::from_str(&row.definition)?)
}

fn validate_draft(draft: &HandoffDraft) -> Result<(), EngineError> {
    if draft.source_agent_id.trim().is_empty() || draft.target_agent_id.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "handoff needs both source_agent_id and target_agent_id".into(),
        ));
    }
    if draft.handoff_type == HandoffType::Conditional && draft.trigger_conditions.is_empty() {
        return Err(EngineError::InvalidInput(
            "conditional handoff needs at least one trigger condition".into(),
        ));
    }
    for expr in &draft.trigger_conditions {
        condition::validate(expr)
            .map_err(|e| EngineError::InvalidInput(format!("trigger condition: {e}")))?;
    }
    Ok(())
}
