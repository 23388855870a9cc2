//! Top-level argument checks against a tool's schema, run before a platform
//! tool executes.

use serde_json::Value;

use crate::error::TurnstileError;

/// Checks the object shape, required keys and declared property types.
/// Nested schemas are not descended into.
pub fn validate_arguments(tool: &str, args: &Value, schema: &Value) -> Result<(), TurnstileError> {
    let fail = |message: String| {
        Err(TurnstileError::InvalidArgument(format!("{tool}: {message}")))
    };

    let expects_object = schema.get("type").and_then(Value::as_str) == Some("object");
    let Some(fields) = args.as_object() else {
        if expects_object {
            return fail(format!("expected object arguments, got {}", type_name(args)));
        }
        return Ok(());
    };

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for name in required {
        if !fields.contains_key(name) {
            return fail(format!("missing required field '{name}'"));
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in fields {
        let expected = properties
            .get(key)
            .and_then(|prop| prop.get("type"))
            .and_then(Value::as_str);
        if let Some(expected) = expected {
            if !matches_type(value, expected) {
                return fail(format!(
                    "field '{key}' expected {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }
    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
