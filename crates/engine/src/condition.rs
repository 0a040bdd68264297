//! Boolean condition expressions for step conditions and handoff triggers.
//!
//! Supported forms (tokens separated by whitespace):
//! - `<ref> == <literal>` / `!=` / `>` / `>=` / `<` / `<=`
//! - `<ref> contains <literal>` — substring, array element or object key
//! - `exists <ref>` / `!exists <ref>`
//!
//! `<ref>` is a mapping reference (see [`crate::mapping`]); literals are JSON,
//! so strings must be quoted. A comparison against a missing reference is
//! false.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::mapping::MappingContext;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("malformed condition '{0}': expected '<ref> <op> <literal>'")]
    Malformed(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("invalid literal '{literal}': {reason}")]
    InvalidLiteral { literal: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl Op {
    fn parse(token: &str) -> Result<Self, ConditionError> {
        Ok(match token {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            "contains" => Self::Contains,
            other => return Err(ConditionError::UnknownOperator(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition<'e> {
    Exists(&'e str),
    Missing(&'e str),
    Compare { reference: &'e str, op: Op, literal: Value },
}

fn parse(expr: &str) -> Result<Condition<'_>, ConditionError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ConditionError::Empty);
    }

    if let Some(reference) = expr.strip_prefix("!exists ") {
        return Ok(Condition::Missing(reference.trim()));
    }
    if let Some(reference) = expr.strip_prefix("exists ") {
        return Ok(Condition::Exists(reference.trim()));
    }

    let (reference, rest) = expr
        .split_once(char::is_whitespace)
        .ok_or_else(|| ConditionError::Malformed(expr.to_string()))?;
    let (op, literal) = rest
        .trim_start()
        .split_once(char::is_whitespace)
        .ok_or_else(|| ConditionError::Malformed(expr.to_string()))?;

    let op = Op::parse(op)?;
    let literal = literal.trim();
    let literal = serde_json::from_str(literal).map_err(|e| ConditionError::InvalidLiteral {
        literal: literal.to_string(),
        reason: e.to_string(),
    })?;

    Ok(Condition::Compare { reference, op, literal })
}

/// Evaluate `expr` against `ctx`.
///
/// # Errors
/// Returns a [`ConditionError`] when the expression cannot be parsed.
pub fn evaluate(expr: &str, ctx: &MappingContext<'_>) -> Result<bool, ConditionError> {
    Ok(match parse(expr)? {
        Condition::Exists(reference) => ctx.lookup(reference).is_some(),
        Condition::Missing(reference) => ctx.lookup(reference).is_none(),
        Condition::Compare { reference, op, literal } => match ctx.lookup(reference) {
            Some(actual) => compare(actual, op, &literal),
            None => false,
        },
    })
}

/// Like [`evaluate`], but a malformed expression counts as false.
pub fn holds(expr: &str, ctx: &MappingContext<'_>) -> bool {
    evaluate(expr, ctx).unwrap_or_else(|e| {
        warn!(condition = expr, error = %e, "malformed condition treated as false");
        false
    })
}

/// Parse-only check used when definitions are registered.
pub fn validate(expr: &str) -> Result<(), ConditionError> {
    parse(expr).map(|_| ())
}

fn compare(actual: &Value, op: Op, literal: &Value) -> bool {
    match op {
        Op::Eq => json_eq(actual, literal),
        Op::Ne => !json_eq(actual, literal),
        Op::Contains => contains(actual, literal),
        Op::Gt => order(actual, literal) == Some(Ordering::Greater),
        Op::Ge => matches!(order(actual, literal), Some(Ordering::Greater | Ordering::Equal)),
        Op::Lt => order(actual, literal) == Some(Ordering::Less),
        Op::Le => matches!(order(actual, literal), Some(Ordering::Less | Ordering::Equal)),
    }
}

// 1 and 1.0 are distinct `Value`s but the same number.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), _) => items.iter().any(|item| json_eq(item, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use std::collections::BTreeMap;

    fn check(expr: &str, input: Value) -> Result<bool, ConditionError> {
        let steps = BTreeMap::new();
        let outputs = Map::new();
        evaluate(expr, &MappingContext::new(&input, &steps, &outputs))
    }

    #[test]
    fn comparisons() {
        let input = json!({ "score": 0.9, "status": "ok", "count": 3 });
        assert_eq!(check(r#"input.status == "ok""#, input.clone()), Ok(true));
        assert_eq!(check(r#"input.status != "ok""#, input.clone()), Ok(false));
        assert_eq!(check("input.score > 0.5", input.clone()), Ok(true));
        assert_eq!(check("input.score <= 0.5", input.clone()), Ok(false));
        assert_eq!(check("input.count >= 3", input.clone()), Ok(true));
        assert_eq!(check("input.count == 3.0", input.clone()), Ok(true));
        assert_eq!(check("input.count < 3", input), Ok(false));
    }

    #[test]
    fn contains_and_exists() {
        let input = json!({ "text": "needs review", "tags": ["a", "b"], "meta": { "k": 1 } });
        assert_eq!(check(r#"input.text contains "review""#, input.clone()), Ok(true));
        assert_eq!(check(r#"input.tags contains "b""#, input.clone()), Ok(true));
        assert_eq!(check(r#"input.meta contains "k""#, input.clone()), Ok(true));
        assert_eq!(check("exists input.meta.k", input.clone()), Ok(true));
        assert_eq!(check("!exists input.meta.k", input.clone()), Ok(false));
        assert_eq!(check("!exists input.nope", input), Ok(true));
    }

    #[test]
    fn missing_reference_is_false() {
        assert_eq!(check(r#"input.nope == "x""#, json!({})), Ok(false));
        assert_eq!(check("input.nope > 1", json!({})), Ok(false));
    }

    #[test]
    fn type_mismatch_orders_to_false() {
        assert_eq!(check(r#"input.n > "a""#, json!({ "n": 5 })), Ok(false));
    }

    #[test]
    fn malformed_expressions_are_errors_and_do_not_hold() {
        assert!(matches!(check("this is not valid", json!({})), Err(ConditionError::UnknownOperator(_))));
        assert!(matches!(check("input.x == bare", json!({})), Err(ConditionError::InvalidLiteral { .. })));
        assert!(matches!(check("lonely", json!({})), Err(ConditionError::Malformed(_))));
        assert_eq!(check("   ", json!({})), Err(ConditionError::Empty));

        let input = json!({});
        let steps = BTreeMap::new();
        let outputs = Map::new();
        assert!(!holds("garbage", &MappingContext::new(&input, &steps, &outputs)));
    }
}
