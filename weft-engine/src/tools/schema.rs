//! Tool payload schemas.
//!
//! A tool's declared input/output fields are turned into a JSON schema and
//! checked with `jsonschema` before dispatch (input) and after a successful
//! dispatch (output).

use jsonschema::JSONSchema;
use serde_json::{json, Map};
use weft::ir::{Param, Span};
use weft::runtime::error_reporting::build_guidance_message;
use weft::{RuntimeError, RuntimeResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadPhase {
    Input,
    Output,
}

impl PayloadPhase {
    fn as_str(&self) -> &'static str {
        match self {
            PayloadPhase::Input => "input",
            PayloadPhase::Output => "output",
        }
    }
}

fn field_schema(type_name: &str) -> serde_json::Value {
    match type_name.trim().to_lowercase().as_str() {
        "text" | "string" => json!({ "type": "string" }),
        "number" => json!({ "type": "number" }),
        "boolean" => json!({ "type": "boolean" }),
        "list" => json!({ "type": "array" }),
        "object" | "map" => json!({ "type": "object" }),
        _ => json!({}),
    }
}

/// Object schema for a field list: declared fields only, required ones listed.
pub fn build_json_schema(fields: &[Param]) -> serde_json::Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in fields {
        properties.insert(field.name.clone(), field_schema(&field.type_name));
        if field.required {
            required.push(serde_json::Value::String(field.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

fn payload_example(tool_name: &str, phase: PayloadPhase, fields: &[Param]) -> String {
    let body = fields
        .iter()
        .map(|f| format!("  {} is {}", f.name, f.type_name))
        .collect::<Vec<_>>()
        .join("\n");
    format!("tool \"{}\" {}:\n{}", tool_name, phase.as_str(), body)
}

/// Validate a payload against declared fields. No fields declared means no
/// constraint.
pub fn validate_tool_payload(
    tool_name: &str,
    phase: PayloadPhase,
    fields: &[Param],
    payload: &Value,
    span: Span,
) -> RuntimeResult<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let schema = build_json_schema(fields);
    let compiled = JSONSchema::compile(&schema).map_err(|e| {
        RuntimeError::Internal(format!("Invalid schema for tool \"{}\": {}", tool_name, e))
    })?;
    let instance = payload.to_json();
    let problems: Vec<String> = match compiled.validate(&instance) {
        Ok(()) => return Ok(()),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };
    log::debug!("Tool {} for '{}' failed validation: {:?}", phase.as_str(), tool_name, problems);
    Err(RuntimeError::domain(build_guidance_message(
        &format!("Tool {} for \"{}\" does not match its declaration.", phase.as_str(), tool_name),
        &problems.join("; "),
        &format!("Send only declared fields with the declared types in the tool {}.", phase.as_str()),
        &payload_example(tool_name, phase, fields),
    ))
    .at(span))
}
