//! Conductor-Arbiter: Rule Condition Evaluator
//!
//! Small expression language for constitutional rule conditions, evaluated
//! against a violation report.
//!
//! # Grammar
//!
//! ```text
//! expression   := clause ('&&' clause)* | clause ('||' clause)*
//! clause       := '!'? comparison
//! comparison   := value (('==' | '!=' | '>=' | '<=' | '>' | '<') value)?
//! value        := field | string | number | boolean | null
//! field        := 'violation.' name | 'context.' path
//! ```
//!
//! # Examples
//!
//! - `violation.severity == 'critical'`
//! - `context.loc_delta > 500 && !context.waived`
//! - `violation.violator == 'agent-7' || violation.location == 'deploy'`

use crate::types::ConstitutionalViolation;
use serde_json::Value as JsonValue;

/// Condition evaluation failures. The engine treats these as inconclusive
/// (rule not violated) rather than failing the session.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("condition is empty")]
    Empty,

    #[error("unknown field '{field}'")]
    UnknownField { field: String },

    #[error("unterminated string literal '{token}'")]
    UnterminatedString { token: String },
}

/// Evaluate `condition` against a violation report.
pub fn evaluate_condition(
    condition: &str,
    violation: &ConstitutionalViolation,
) -> Result<bool, ConditionError> {
    let condition = condition.trim();
    if condition.is_empty() {
        return Err(ConditionError::Empty);
    }

    // AND binds the whole expression when present.
    let and_parts: Vec<&str> = condition.split("&&").collect();
    if and_parts.len() > 1 {
        for part in and_parts {
            if !evaluate_clause(part.trim(), violation)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let or_parts: Vec<&str> = condition.split("||").collect();
    if or_parts.len() > 1 {
        for part in or_parts {
            if evaluate_clause(part.trim(), violation)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }

    evaluate_clause(condition, violation)
}

/// A clause is a comparison with an optional leading negation.
fn evaluate_clause(
    clause: &str,
    violation: &ConstitutionalViolation,
) -> Result<bool, ConditionError> {
    if let Some(rest) = clause.strip_prefix('!') {
        return Ok(!evaluate_comparison(rest.trim(), violation)?);
    }
    evaluate_comparison(clause, violation)
}

fn evaluate_comparison(
    expr: &str,
    violation: &ConstitutionalViolation,
) -> Result<bool, ConditionError> {
    // Two-character operators must be tried before their one-character
    // prefixes.
    const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

    for op in OPERATORS {
        if let Some(index) = expr.find(op) {
            let left = resolve_value(expr[..index].trim(), violation)?;
            let right = resolve_value(expr[index + op.len()..].trim(), violation)?;

            return Ok(match op {
                "==" => left == right,
                "!=" => left != right,
                ">" => compare(&left, &right) == std::cmp::Ordering::Greater,
                "<" => compare(&left, &right) == std::cmp::Ordering::Less,
                ">=" => compare(&left, &right) != std::cmp::Ordering::Less,
                "<=" => compare(&left, &right) != std::cmp::Ordering::Greater,
                _ => false,
            });
        }
    }

    // No operator: truthiness of the single value.
    Ok(is_truthy(&resolve_value(expr, violation)?))
}

/// Resolve a token to a JSON value: a `violation.*` attribute, a
/// `context.*` path, or a literal.
fn resolve_value(
    token: &str,
    violation: &ConstitutionalViolation,
) -> Result<JsonValue, ConditionError> {
    let token = token.trim();

    if let Some(field) = token.strip_prefix("violation.") {
        return match field {
            "id" => Ok(JsonValue::String(violation.id.clone())),
            "rule_id" => Ok(JsonValue::String(violation.rule_id.clone())),
            "severity" => Ok(JsonValue::String(violation.severity.as_str().to_string())),
            "description" => Ok(JsonValue::String(violation.description.clone())),
            "violator" => Ok(violation
                .violator
                .clone()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null)),
            "location" => Ok(violation
                .location
                .clone()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null)),
            "evidence_count" => Ok(JsonValue::Number(violation.evidence.len().into())),
            other => Err(ConditionError::UnknownField {
                field: format!("violation.{other}"),
            }),
        };
    }

    if let Some(path) = token.strip_prefix("context.") {
        let mut current = &violation.context;
        for segment in path.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Ok(JsonValue::Null),
            }
        }
        return Ok(current.clone());
    }

    // String literal
    if token.starts_with('\'') || token.starts_with('"') {
        let quote = token.chars().next().unwrap_or('\'');
        if token.len() >= 2 && token.ends_with(quote) {
            return Ok(JsonValue::String(token[1..token.len() - 1].to_string()));
        }
        return Err(ConditionError::UnterminatedString {
            token: token.to_string(),
        });
    }

    match token.to_lowercase().as_str() {
        "true" => return Ok(JsonValue::Bool(true)),
        "false" => return Ok(JsonValue::Bool(false)),
        "null" => return Ok(JsonValue::Null),
        _ => {}
    }

    if let Ok(n) = token.parse::<i64>() {
        return Ok(JsonValue::Number(n.into()));
    }
    if let Ok(n) = token.parse::<f64>() {
        return Ok(serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null));
    }

    Err(ConditionError::UnknownField {
        field: token.to_string(),
    })
}

fn compare(a: &JsonValue, b: &JsonValue) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (JsonValue::String(a), JsonValue::String(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}
