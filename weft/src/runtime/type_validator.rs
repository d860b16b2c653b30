//! Declared-type checks for contract inputs/outputs and declarative inputs.

use crate::ir::Span;
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::error_reporting::build_guidance_message;
use crate::runtime::values::Value;

/// Built-in type names. Anything else is treated as a record type, which
/// accepts an object.
pub const BUILTIN_TYPES: &[&str] = &[
    "text", "number", "int", "boolean", "json", "list", "object", "map", "null",
];

pub fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name.trim().to_ascii_lowercase().as_str() {
        "text" | "string" => matches!(value, Value::String(_)),
        "number" => value.is_number(),
        "int" | "integer" => matches!(value, Value::Integer(_)),
        "boolean" | "bool" => matches!(value, Value::Boolean(_)),
        "json" | "any" => true,
        "list" => matches!(value, Value::List(_)),
        "object" | "map" => matches!(value, Value::Map(_)),
        "null" => matches!(value, Value::Null),
        _ => matches!(value, Value::Map(_)),
    }
}

pub fn require_type(value: &Value, type_name: &str, span: Span) -> RuntimeResult<()> {
    if value_matches_type(value, type_name) {
        return Ok(());
    }
    Err(RuntimeError::domain(build_guidance_message(
        &format!("Expected {}, got {}.", type_name, value.kind_name()),
        "The value does not match its declared type.",
        &format!("Pass a {} value.", type_name),
        &example_for(type_name),
    ))
    .at(span))
}

fn example_for(type_name: &str) -> String {
    match type_name {
        "text" | "string" => "\"hello\"".to_string(),
        "number" => "42".to_string(),
        "int" | "integer" => "7".to_string(),
        "boolean" | "bool" => "true".to_string(),
        "list" => "[1, 2, 3]".to_string(),
        _ => "{\"id\": 1}".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        assert!(value_matches_type(&Value::text("a"), "text"));
        assert!(value_matches_type(&Value::Float(1.5), "number"));
        assert!(!value_matches_type(&Value::Float(1.5), "int"));
        assert!(value_matches_type(&Value::Null, "json"));
        assert!(value_matches_type(&Value::map([("id", Value::Integer(1))]), "Order"));
        assert!(!value_matches_type(&Value::text("x"), "Order"));
    }

    #[test]
    fn test_require_type_reports_kind() {
        let err = require_type(&Value::Integer(3), "text", Span::new(4, 2)).unwrap_err();
        assert!(err.is_catchable());
        assert!(err.message().contains("Expected text, got number."));
    }
}
