//! Mapping expressions.
//!
//! A mapping expression is a dotted reference into the execution context:
//!
//! | expression                     | resolves to                           |
//! |--------------------------------|---------------------------------------|
//! | `input[.path]`                 | the workflow input snapshot           |
//! | `steps.<step_id>[.path]`       | a prior step's output                 |
//! | `outputs.<key>[.path]`         | the execution's output namespace      |
//! | `output[.path]`                | the output of the step being mapped   |
//! | `const:<json>`                 | a JSON literal                        |
//!
//! Numeric path segments index arrays.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{EngineError, models::{Mapping, StepDefinition}};

/// Read-only view of everything a mapping expression may reference.
#[derive(Debug, Clone, Copy)]
pub struct MappingContext<'a> {
    pub input: &'a Value,
    pub steps: &'a BTreeMap<String, Value>,
    pub outputs: &'a Map<String, Value>,
    /// Output of the step currently being mapped, if any.
    pub current: Option<&'a Value>,
}

impl<'a> MappingContext<'a> {
    pub fn new(
        input: &'a Value,
        steps: &'a BTreeMap<String, Value>,
        outputs: &'a Map<String, Value>,
    ) -> Self {
        Self { input, steps, outputs, current: None }
    }

    /// Same context with `output` bound to `current`.
    pub fn with_current(self, current: &'a Value) -> Self {
        Self { current: Some(current), ..self }
    }

    /// Look up a reference. `None` when anything along the path is missing.
    pub fn lookup(&self, expr: &str) -> Option<&'a Value> {
        let mut segments = expr.trim().split('.');
        let (root, rest): (&'a Value, Vec<&str>) = match segments.next()? {
            "input" => (self.input, segments.collect()),
            "output" => (self.current?, segments.collect()),
            "steps" => {
                let id = segments.next()?;
                (self.steps.get(id)?, segments.collect())
            }
            "outputs" => {
                let key = segments.next()?;
                (self.outputs.get(key)?, segments.collect())
            }
            _ => return None,
        };
        lookup_path(root, &rest)
    }

    /// Resolve an expression to an owned value.
    ///
    /// # Errors
    /// [`EngineError::Mapping`] when the reference cannot be resolved or a
    /// `const:` literal is not valid JSON.
    pub fn resolve(&self, expr: &str) -> Result<Value, EngineError> {
        if let Some(literal) = expr.trim().strip_prefix("const:") {
            return serde_json::from_str(literal.trim()).map_err(|e| {
                EngineError::Mapping(format!("invalid literal in '{expr}': {e}"))
            });
        }
        self.lookup(expr)
            .cloned()
            .ok_or_else(|| EngineError::Mapping(format!("unresolved reference '{expr}'")))
    }

    /// Resolve every entry of a mapping into a JSON object.
    pub fn resolve_mapping(&self, mapping: &Mapping) -> Result<Map<String, Value>, EngineError> {
        mapping
            .iter()
            .map(|(name, expr)| Ok((name.clone(), self.resolve(expr)?)))
            .collect()
    }
}

/// Walk `path` segments into `value`.
pub fn lookup_path<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Build the input an agent receives for `step`.
///
/// With no `input_mapping` the agent gets `static_input`, or the whole
/// workflow input when that is unset too. Mapped fields are merged over an
/// object `static_input`.
pub fn build_step_input(step: &StepDefinition, ctx: &MappingContext<'_>) -> Result<Value, EngineError> {
    if step.input_mapping.is_empty() {
        return Ok(step.static_input.clone().unwrap_or_else(|| ctx.input.clone()));
    }
    let mut merged = match &step.static_input {
        Some(Value::Object(base)) => base.clone(),
        _ => Map::new(),
    };
    merged.extend(ctx.resolve_mapping(&step.input_mapping)?);
    Ok(Value::Object(merged))
}

/// Entries a successful step contributes to the output namespace.
pub fn map_step_output(
    step: &StepDefinition,
    output: &Value,
    ctx: &MappingContext<'_>,
) -> Result<Map<String, Value>, EngineError> {
    if step.output_mapping.is_empty() {
        let mut entry = Map::new();
        entry.insert(step.id.clone(), output.clone());
        return Ok(entry);
    }
    ctx.with_current(output).resolve_mapping(&step.output_mapping)
}
