//! Declarative flow steps
//!
//! A declarative flow is a fixed list of `input`, `require`, `create`,
//! `update` and `delete` steps. Record steps are lowered to the equivalent
//! statements and run through the interpreter, so they pass the same
//! mutation gate as hand-written statements. Each step leaves a `flow_step`
//! trace; once a `require` gate blocks, every later non-`require` step is
//! recorded as `skipped`.

use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::trace::{StepChanges, StepGate, TraceEvent};
use weft::ir::{Expression, FieldExprs, Flow, FlowField, FlowStep, Span, Statement};
use weft::runtime::error_reporting::build_guidance_message;
use weft::runtime::type_validator::require_type;
use weft::{RuntimeError, RuntimeResult, Value};

const DISCARD_LOCAL: &str = "_";

pub fn flow_id(flow_name: &str) -> String {
    format!("flow:{}", flow_name)
}

pub fn flow_step_id(flow_name: &str, kind: &str, ordinal: usize) -> String {
    format!("{}:{}:{}", flow_name, kind, ordinal)
}

/// Evaluate a `require` condition against state.
///
/// The condition is a dotted path, optionally prefixed with `state.` and
/// optionally negated with a leading `not `. A missing path counts as false.
pub fn evaluate_state_condition(condition: &str, state: &Value) -> StepGate {
    let trimmed = condition.trim();
    let (negated, path_text) = match trimmed.strip_prefix("not ") {
        Some(rest) => (true, rest.trim()),
        None => (false, trimmed),
    };
    let path_text = path_text.strip_prefix("state.").unwrap_or(path_text);
    let path: Vec<String> = path_text
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let truthy = state.get_path(&path).map(Value::is_truthy).unwrap_or(false);
    let ready = truthy != negated;
    StepGate {
        requires: condition.to_string(),
        status: if ready { "passed" } else { "blocked" }.to_string(),
        reason: format!("requires {}", condition),
        path: (!path.is_empty()).then_some(path),
    }
}

fn step_what(step: &FlowStep) -> String {
    match step {
        FlowStep::Input { .. } => "input".to_string(),
        FlowStep::Require { condition, .. } => format!("require \"{}\"", condition),
        FlowStep::Create { record, .. } => format!("create \"{}\"", record),
        FlowStep::Update { record, .. } => format!("update \"{}\"", record),
        FlowStep::Delete { record, .. } => format!("delete \"{}\"", record),
    }
}

fn input_field_names(step: &FlowStep) -> Option<Vec<String>> {
    match step {
        FlowStep::Input { fields, .. } => Some(fields.iter().map(|f| f.name.clone()).collect()),
        _ => None,
    }
}

fn validate_input_payload(payload: Option<&Value>, fields: &[FlowField]) -> RuntimeResult<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let Some(Value::Map(payload)) = payload else {
        return Err(RuntimeError::domain(build_guidance_message(
            "Flow input payload is not a JSON object.",
            "Declarative flows expect input to be a dictionary of field values.",
            "Provide a JSON object with the required fields.",
            "{\"name\":\"Ada\"}",
        )));
    };
    for field in fields {
        let Some(value) = payload.get(&field.name) else {
            return Err(RuntimeError::domain(build_guidance_message(
                &format!("Flow input is missing '{}'.", field.name),
                "Declarative flow inputs are required.",
                "Provide the missing field in the input payload.",
                &format!("{{\"{}\":\"value\"}}", field.name),
            ))
            .at(field.span));
        };
        require_type(value, &field.type_name, field.span)?;
    }
    Ok(())
}

fn step_changes(record: &str, fields: Vec<String>) -> StepChanges {
    StepChanges {
        record: record.to_string(),
        fields,
    }
}

fn create_step(record: &str, fields: &FieldExprs, span: Span) -> (Statement, StepChanges) {
    let stmt = Statement::Create {
        record: record.to_string(),
        values: Expression::Map(fields.clone()),
        target: DISCARD_LOCAL.to_string(),
        span,
    };
    (stmt, step_changes(record, fields.iter().map(|(name, _)| name.clone()).collect()))
}

fn update_step(record: &str, filter: &FieldExprs, updates: &FieldExprs, span: Span) -> (Statement, StepChanges) {
    let stmt = Statement::Update {
        record: record.to_string(),
        filter: filter.clone(),
        updates: updates.clone(),
        span,
    };
    (stmt, step_changes(record, updates.iter().map(|(name, _)| name.clone()).collect()))
}

fn delete_step(record: &str, filter: &FieldExprs, span: Span) -> (Statement, StepChanges) {
    let stmt = Statement::Delete {
        record: record.to_string(),
        filter: filter.clone(),
        span,
    };
    (stmt, step_changes(record, Vec::new()))
}

struct StepRecorder<'a> {
    flow_id: String,
    flow_name: &'a str,
    why: String,
}

impl StepRecorder<'_> {
    fn record(
        &self,
        ctx: &mut ExecutionContext,
        step: &FlowStep,
        ordinal: usize,
        status: &str,
        gate: Option<StepGate>,
        changes: Option<StepChanges>,
    ) {
        ctx.push_trace(TraceEvent::FlowStep {
            flow_id: self.flow_id.clone(),
            flow_name: self.flow_name.to_string(),
            step_id: flow_step_id(self.flow_name, step.kind(), ordinal),
            step_kind: step.kind().to_string(),
            ordinal,
            what: step_what(step),
            why: self.why.clone(),
            status: status.to_string(),
            gate,
            changes,
            fields: input_field_names(step),
        });
    }
}

impl Engine {
    /// Run the steps of a declarative flow inside an already-entered frame.
    pub(crate) fn run_declarative_flow(
        &self,
        ctx: &mut ExecutionContext,
        flow: &Flow,
        steps: &[FlowStep],
    ) -> RuntimeResult<()> {
        let recorder = StepRecorder {
            flow_id: flow_id(&flow.name),
            flow_name: &flow.name,
            why: match &ctx.flow_action_id {
                Some(action) => format!("action \"{}\" ran flow \"{}\"", action, flow.name),
                None => format!("flow \"{}\" ran", flow.name),
            },
        };
        ctx.push_trace(TraceEvent::FlowStart {
            flow_id: recorder.flow_id.clone(),
            flow_name: flow.name.clone(),
        });

        let input_fields = steps
            .iter()
            .find_map(|step| match step {
                FlowStep::Input { fields, .. } => Some(fields.as_slice()),
                _ => None,
            })
            .unwrap_or(&[]);
        validate_input_payload(ctx.locals.get("input"), input_fields).map_err(|e| e.at(flow.span))?;

        let mut active_gate: Option<StepGate> = None;
        for (index, step) in steps.iter().enumerate() {
            let ordinal = index + 1;
            let blocked = active_gate.as_ref().is_some_and(|g| g.status == "blocked");
            if blocked && !matches!(step, FlowStep::Require { .. }) {
                recorder.record(ctx, step, ordinal, "skipped", active_gate.clone(), None);
                continue;
            }
            let (stmt, changes) = match step {
                FlowStep::Input { .. } => {
                    recorder.record(ctx, step, ordinal, "ran", active_gate.clone(), None);
                    continue;
                }
                FlowStep::Require { condition, .. } => {
                    let gate = evaluate_state_condition(condition, &ctx.state_value());
                    log::debug!("Flow '{}' gate '{}' {}", flow.name, condition, gate.status);
                    active_gate = Some(gate.clone());
                    recorder.record(ctx, step, ordinal, "ran", Some(gate), None);
                    continue;
                }
                FlowStep::Create { record, fields, span } => create_step(record, fields, *span),
                FlowStep::Update {
                    record,
                    filter,
                    updates,
                    span,
                } => update_step(record, filter, updates, *span),
                FlowStep::Delete { record, filter, span } => delete_step(record, filter, *span),
            };
            ctx.current_statement_index = Some(ordinal);
            ctx.current_statement_span = Some(step.span());
            self.execute_statement(ctx, &stmt)?;
            recorder.record(ctx, step, ordinal, "ran", active_gate.clone(), Some(changes));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state() -> Value {
        Value::map([(
            "cart",
            Value::map([("ready", Value::Boolean(true)), ("locked", Value::Boolean(false))]),
        )])
    }

    #[test]
    fn test_state_condition_paths_and_negation() {
        assert_eq!(evaluate_state_condition("state.cart.ready", &state()).status, "passed");
        assert_eq!(evaluate_state_condition("cart.locked", &state()).status, "blocked");
        assert_eq!(evaluate_state_condition("not cart.locked", &state()).status, "passed");
        assert_eq!(evaluate_state_condition("cart.missing", &state()).status, "blocked");
        let gate = evaluate_state_condition("state.cart.ready", &state());
        assert_eq!(gate.path, Some(vec!["cart".to_string(), "ready".to_string()]));
        assert_eq!(gate.reason, "requires state.cart.ready");
    }

    #[test]
    fn test_ids() {
        assert_eq!(flow_id("checkout"), "flow:checkout");
        assert_eq!(flow_step_id("checkout", "create", 3), "checkout:create:3");
    }

    #[test]
    fn test_input_payload_validation() {
        let fields = vec![FlowField {
            name: "name".to_string(),
            type_name: "text".to_string(),
            span: Span::new(2, 5),
        }];
        assert!(validate_input_payload(Some(&Value::text("x")), &fields)
            .unwrap_err()
            .message()
            .contains("not a JSON object"));
        let err = validate_input_payload(Some(&Value::map([("other", Value::Integer(1))])), &fields).unwrap_err();
        assert!(err.message().contains("Flow input is missing 'name'."));
        assert_eq!(err.diagnostic().and_then(|d| d.line), Some(2));
        assert!(validate_input_payload(Some(&Value::map([("name", Value::text("Ada"))])), &fields).is_ok());
    }

    #[test]
    fn test_record_steps_lower_with_changed_fields() {
        let fields = vec![("qty".to_string(), Expression::literal(2i64))];
        let (stmt, changes) = create_step("Order", &fields, Span::new(4, 1));
        assert!(matches!(stmt, Statement::Create { ref target, .. } if target == DISCARD_LOCAL));
        assert_eq!(changes.fields, vec!["qty".to_string()]);

        let filter = vec![("id".to_string(), Expression::literal(1i64))];
        let (_, changes) = update_step("Order", &filter, &fields, Span::new(5, 1));
        assert_eq!(changes.fields, vec!["qty".to_string()]);

        let (stmt, changes) = delete_step("Order", &filter, Span::new(6, 1));
        assert_eq!(stmt.span(), Span::new(6, 1));
        assert_eq!(changes.record, "Order");
        assert!(changes.fields.is_empty());
    }
}
