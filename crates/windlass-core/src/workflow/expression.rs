//! Restricted expression evaluator for condition nodes.
//!
//! Condition expressions are authored by the planner and edited by users,
//! so the evaluator is a closed grammar, not a scripting engine: a single
//! comparison `<path> <op> <rhs>`, nothing else. It never executes code
//! and never errors -- a malformed expression degrades to a truthiness
//! check of the whole string as a path (authoring tools are expected to
//! validate expressions before save).
//!
//! The right-hand side is parsed in priority order: number, quoted string,
//! `true`/`false`, `null`, and finally another path lookup, which enables
//! field-to-field comparisons.

use serde_json::Value;

use super::path::resolve_path;

/// Comparison operators, longest first so `===` wins over `==` and `>=`
/// over `>` at the same position.
const OPERATORS: [&str; 8] = ["===", "!==", "==", "!=", ">=", "<=", ">", "<"];

/// Evaluate a condition expression against a JSON context.
///
/// Absent a recognized operator the whole expression is treated as a path
/// and its resolved value's truthiness is returned (missing paths are
/// falsy).
pub fn evaluate(expr: &str, context: &Value) -> bool {
    let Some((lhs, op, rhs)) = split_comparison(expr) else {
        return truthy(resolve_path(expr.trim(), context).as_ref());
    };

    let left = resolve_path(lhs, context);
    let right = parse_rhs(rhs, context);

    match op {
        "==" | "===" => loose_eq(left.as_ref(), right.as_ref()),
        "!=" | "!==" => !loose_eq(left.as_ref(), right.as_ref()),
        ">" | ">=" | "<" | "<=" => compare_numeric(left.as_ref(), right.as_ref(), op),
        _ => unreachable!("operator table is closed"),
    }
}

/// Find the leftmost operator occurrence, preferring the longest operator
/// at that position. Returns `(lhs, op, rhs)` with both sides trimmed.
fn split_comparison(expr: &str) -> Option<(&str, &'static str, &str)> {
    let mut best: Option<(usize, &'static str)> = None;
    for op in OPERATORS {
        if let Some(pos) = expr.find(op) {
            let better = match best {
                None => true,
                // OPERATORS is ordered longest-first, so the first hit at
                // a given position is the longest one.
                Some((best_pos, _)) => pos < best_pos,
            };
            if better {
                best = Some((pos, op));
            }
        }
    }

    let (pos, op) = best?;
    let lhs = expr[..pos].trim();
    let rhs = expr[pos + op.len()..].trim();
    Some((lhs, op, rhs))
}

/// Parse the right-hand literal, falling back to a path lookup.
fn parse_rhs(rhs: &str, context: &Value) -> Option<Value> {
    if let Ok(n) = rhs.parse::<f64>() {
        return Some(Value::from(n));
    }
    if rhs.len() >= 2 {
        let quoted = (rhs.starts_with('"') && rhs.ends_with('"'))
            || (rhs.starts_with('\'') && rhs.ends_with('\''));
        if quoted {
            return Some(Value::String(rhs[1..rhs.len() - 1].to_string()));
        }
    }
    match rhs {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    resolve_path(rhs, context)
}

/// Equality across JSON values. Numbers compare by f64 value so `1` and
/// `1.0` are equal; a missing side compares equal to `null` only.
fn loose_eq(left: Option<&Value>, right: Option<&Value>) -> bool {
    let left = left.unwrap_or(&Value::Null);
    let right = right.unwrap_or(&Value::Null);
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

/// Ordering comparison. Non-numeric operands make the comparison false.
fn compare_numeric(left: Option<&Value>, right: Option<&Value>, op: &str) -> bool {
    let (Some(a), Some(b)) = (
        left.and_then(Value::as_f64),
        right.and_then(Value::as_f64),
    ) else {
        return false;
    };
    match op {
        ">" => a > b,
        ">=" => a >= b,
        "<" => a < b,
        "<=" => a <= b,
        _ => false,
    }
}

/// JavaScript-like truthiness for resolved values.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
