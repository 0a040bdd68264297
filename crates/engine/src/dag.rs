//! DAG validation — run this before persisting or executing a workflow.
//!
//! Rules enforced:
//! 1. There is at least one step and every step ID is non-empty, unique
//!    and free of `.` and whitespace (IDs appear inside mapping paths).
//! 2. Every `depends_on` entry references a step in the same workflow.
//! 3. The dependency graph must be acyclic (topological sort must succeed).
//!
//! Returns a topologically-sorted list of step IDs on success. Ties are
//! broken by insertion order so the result is deterministic.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::{EngineError, models::StepDefinition};

/// Validate the step graph and return step IDs in topological execution order.
///
/// # Errors
/// - [`EngineError::InvalidInput`] for an empty step list or a malformed ID.
/// - [`EngineError::DuplicateStepId`] if two steps share an ID.
/// - [`EngineError::InvalidReference`] if a dependency names a missing step.
/// - [`EngineError::CyclicDependency`] if the graph is not acyclic.
pub fn validate_steps(steps: &[StepDefinition]) -> Result<Vec<String>, EngineError> {
    if steps.is_empty() {
        return Err(EngineError::InvalidInput(
            "workflow must contain at least one step".into(),
        ));
    }

    // -----------------------------------------------------------------------
    // 1. Ensure step IDs are well-formed and unique
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in steps {
        if step.id.is_empty()
            || step.id.contains('.')
            || step.id.chars().any(char::is_whitespace)
        {
            return Err(EngineError::InvalidInput(format!(
                "invalid step ID '{}': must be non-empty without '.' or whitespace",
                step.id
            )));
        }
        if step.agent_id.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "step '{}' has no agent_id",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(EngineError::DuplicateStepId(step.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate dependency references
    // -----------------------------------------------------------------------
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    for step in steps {
        for dep in &step.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(EngineError::InvalidReference {
                    step_id: step.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm, lowest insertion index first)
    // -----------------------------------------------------------------------
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut in_degree: Vec<usize> = vec![0; steps.len()];

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            dependents[index[dep.as_str()]].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(steps.len());

    while let Some(i) = ready.pop_first() {
        sorted.push(steps[i].id.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    // Anything left with a non-zero in-degree sits on (or behind) a cycle.
    if sorted.len() != steps.len() {
        let stuck = steps
            .iter()
            .zip(&in_degree)
            .filter(|(_, &d)| d > 0)
            .map(|(s, _)| s.id.clone())
            .collect();
        return Err(EngineError::CyclicDependency(stuck));
    }

    Ok(sorted)
}
