//! Safe property-path resolution over step results.
//!
//! Planner- and user-authored dot paths are resolved against JSON values
//! with a denylist guarding the keys that enable prototype-pollution
//! attacks in the surrounding JavaScript ecosystem (`__proto__`,
//! `constructor`, `prototype`). `serde_json` maps carry no prototype
//! chain, but the paths themselves travel through web clients and the
//! planner -- the denylist is a deliberate security control on
//! attacker-authored input, kept verbatim, not an artifact to clean up.
//!
//! Resolution never errors: any missing or blocked segment short-circuits
//! to `None`.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Keys that are never resolvable, regardless of the target value.
const BLOCKED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Look up a single key on a JSON value.
///
/// - blocked keys resolve to `None` outright;
/// - arrays special-case `length` (the element count) and numeric indices;
/// - objects index their own keys only;
/// - scalars have no properties.
pub fn safe_get(target: &Value, key: &str) -> Option<Value> {
    if BLOCKED_KEYS.contains(&key) {
        return None;
    }

    match target {
        Value::Object(map) => map.get(key).cloned(),
        Value::Array(items) => {
            if key == "length" {
                return Some(Value::from(items.len()));
            }
            key.parse::<usize>().ok().and_then(|i| items.get(i)).cloned()
        }
        _ => None,
    }
}

/// Resolve a dot-separated path against a root value.
///
/// Splits on `.` and folds [`safe_get`] across the segments. A missing or
/// blocked segment short-circuits to `None`; malformed paths never panic
/// or error.
pub fn resolve_path(path: &str, root: &Value) -> Option<Value> {
    let mut current = root.clone();
    for segment in path.split('.') {
        current = safe_get(&current, segment)?;
    }
    Some(current)
}

/// Resolve `{{ dot.path }}` references embedded in a template string.
///
/// Each reference is replaced with the resolved value's display form
/// (strings bare, scalars via `to_string`, objects/arrays as compact
/// JSON). Unresolvable or blocked references are left as-is -- prompts
/// degrade gracefully rather than erroring.
pub fn interpolate(template: &str, root: &Value) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let reference = after[..end].trim();
        result.push_str(&rest[..start]);
        match resolve_path(reference, root) {
            Some(value) => result.push_str(&value_to_string(&value)),
            None => {
                // Leave the unresolvable reference in place.
                result.push_str(&rest[start..start + 2 + end + 2]);
            }
        }
        rest = &after[end + 2..];
    }
    result.push_str(rest);
    result
}

/// A tool argument of the exact form `{{ dot.path }}` is a whole-value
/// reference into step results; returns the inner path when so.
pub fn as_reference(argument: &str) -> Option<&str> {
    let inner = argument.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    Some(inner.trim())
}

/// Display form of a JSON value for template interpolation.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Apply an output mapping against accumulated step results.
///
/// Each declared key resolves its path independently; missing paths map to
/// `null` rather than failing the step.
pub fn resolve_output_mapping(
    mapping: &HashMap<String, String>,
    step_results: &Value,
) -> Map<String, Value> {
    let mut resolved = Map::new();
    for (key, path) in mapping {
        let value = resolve_path(path, step_results).unwrap_or(Value::Null);
        resolved.insert(key.clone(), value);
    }
    resolved
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
