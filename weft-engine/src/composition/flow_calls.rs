//! Flow-to-flow calls
//!
//! A call is checked against the callee's contract on the way in and on the
//! way out. The callee runs in its own frame (see `FlowFrameGuard`); the
//! caller's frame is restored whatever the outcome. Traces bracket the call:
//! `flow_call_started` before the callee runs, `flow_call_finished` after,
//! with `status` "ok" or "error".

use crate::audit::{resolve_actor, AuditEntry};
use crate::context::{ExecutionContext, FlowFrameGuard};
use crate::engine::Engine;
use crate::evaluator::evaluate_arguments;
use crate::explain::ExplainCollector;
use crate::interpreter::StatementOutcome;
use crate::trace::{ExecutionStep, FlowCallTrace, TraceEvent};
use std::sync::Arc;
use weft::ir::{CallFlowExpr, Contract, Flow, FlowBody, Purity, Span, Statement};
use weft::runtime::error_reporting::build_guidance_message;
use weft::runtime::type_validator::require_type;
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

fn missing_contract(flow_name: &str, span: Span) -> RuntimeError {
    RuntimeError::domain(build_guidance_message(
        &format!("Flow \"{}\" is missing a contract.", flow_name),
        "Composed flows require explicit input and output contracts.",
        "Add a contract flow block for the called flow.",
        &format!(
            "contract flow \"{}\":\n  input:\n    value is text\n  output:\n    result is text",
            flow_name
        ),
    ))
    .at(span)
}

fn pure_calls_effectful(caller: &str, callee: &str, span: Span) -> RuntimeError {
    RuntimeError::domain(build_guidance_message(
        &format!("Pure flow \"{}\" cannot call effectful flow \"{}\".", caller, callee),
        "Pure flows may only compose other pure flows.",
        "Mark the called flow as pure or remove purity from the caller.",
        &format!("flow \"{}\": pure", callee),
    ))
    .at(span)
}

/// Map the call's arguments onto the contract inputs.
fn build_input_payload(contract: &Contract, mut args: ValueMap, span: Span) -> RuntimeResult<ValueMap> {
    let mut payload = ValueMap::new();
    for param in &contract.inputs {
        match args.shift_remove(&param.name) {
            Some(value) => {
                require_type(&value, &param.type_name, span)?;
                payload.insert(param.name.clone(), value);
            }
            None if param.required => {
                return Err(RuntimeError::domain(format!("Missing flow input '{}'", param.name)).at(span))
            }
            None => {}
        }
    }
    if let Some(extra) = args.keys().min() {
        return Err(RuntimeError::domain(format!("Unknown flow input '{}'", extra)).at(span));
    }
    Ok(payload)
}

fn validate_flow_output(contract: &Contract, value: Value, span: Span) -> RuntimeResult<ValueMap> {
    let Value::Map(output) = value else {
        return Err(RuntimeError::domain("Flow return must be a map").at(span));
    };
    for param in &contract.outputs {
        match output.get(&param.name) {
            Some(value) => require_type(value, &param.type_name, span)?,
            None if param.required => {
                return Err(RuntimeError::domain(format!("Missing flow output '{}'", param.name)).at(span))
            }
            None => {}
        }
    }
    if let Some(extra) = output
        .keys()
        .filter(|k| !contract.outputs.iter().any(|p| &p.name == *k))
        .min()
    {
        return Err(RuntimeError::domain(format!("Unknown flow output '{}'", extra)).at(span));
    }
    Ok(output)
}

fn select_outputs(output: &ValueMap, names: &[String], span: Span) -> RuntimeResult<ValueMap> {
    names
        .iter()
        .map(|name| {
            output
                .get(name)
                .map(|v| (name.clone(), v.clone()))
                .ok_or_else(|| RuntimeError::domain(format!("Missing flow output '{}'", name)).at(span))
        })
        .collect()
}

fn pure_tag(purity: Option<Purity>) -> Option<String> {
    Purity::is_pure(purity).then(|| Purity::Pure.to_string())
}

fn call_step_data(call: &FlowCallTrace) -> ValueMap {
    let names = |v: &[String]| Value::List(v.iter().cloned().map(Value::String).collect());
    let mut data = ValueMap::new();
    data.insert("flow_call_id".to_string(), Value::text(call.flow_call_id.clone()));
    data.insert("callee_flow".to_string(), Value::text(call.callee_flow.clone()));
    data.insert("contract_inputs".to_string(), names(&call.contract_inputs));
    data.insert("contract_outputs".to_string(), names(&call.contract_outputs));
    if let Some(p) = &call.caller_purity {
        data.insert("caller_purity".to_string(), Value::text(p.clone()));
    }
    if let Some(p) = &call.callee_purity {
        data.insert("callee_purity".to_string(), Value::text(p.clone()));
    }
    data
}

impl Engine {
    /// Evaluate a `call flow` expression and return the selected outputs.
    pub fn execute_flow_call(
        &self,
        ctx: &mut ExecutionContext,
        call: &CallFlowExpr,
        collector: Option<&mut ExplainCollector>,
    ) -> RuntimeResult<ValueMap> {
        let span = call.span;
        if ctx.in_function() {
            return Err(RuntimeError::fatal("Functions cannot call flows").at(span));
        }
        let flow = self.lookup_flow(ctx, &call.flow_name).map_err(|e| e.at(span))?;
        let caller_flow = ctx.current_flow_name().map(str::to_string);
        let caller_purity = ctx.flow.as_deref().and_then(|f| f.purity);
        if Purity::is_pure(caller_purity) && !Purity::is_pure(flow.purity) {
            return Err(pure_calls_effectful(
                caller_flow.as_deref().unwrap_or("flow"),
                &flow.name,
                span,
            ));
        }
        let program = ctx.program.clone();
        let contract = program
            .contracts
            .get(&call.flow_name)
            .ok_or_else(|| missing_contract(&call.flow_name, span))?;

        let args = evaluate_arguments(self, ctx, &call.arguments, "flow input", collector)?;
        let payload = build_input_payload(contract, args, span)?;

        let trace = FlowCallTrace {
            flow_call_id: ctx.next_flow_call_id(),
            caller_flow,
            callee_flow: flow.name.clone(),
            inputs: call.arguments.iter().map(|a| a.name.clone()).collect(),
            outputs: call.outputs.clone(),
            contract_inputs: contract.input_names(),
            contract_outputs: contract.output_names(),
            caller_purity: pure_tag(caller_purity),
            callee_purity: pure_tag(flow.purity),
        };
        log::debug!("{} -> flow '{}'", trace.flow_call_id, flow.name);
        ctx.push_trace(TraceEvent::FlowCallStarted { call: trace.clone() });
        ctx.record_step(
            ExecutionStep::new("flow_call_start", format!("call flow \"{}\"", flow.name), span)
                .with_data(call_step_data(&trace)),
        );

        let audit_before = flow.audited.then(|| ctx.state_value());
        let changes_mark = ctx.record_changes.len();

        let result = self
            .run_called_flow(ctx, &flow, payload, trace.flow_call_id.clone())
            .and_then(|value| validate_flow_output(contract, value, span))
            .and_then(|output| select_outputs(&output, &call.outputs, span))
            .and_then(|selected| match audit_before {
                Some(before) => self
                    .record_audit(ctx, &flow, before, changes_mark)
                    .map(|()| selected),
                None => Ok(selected),
            });

        let selected = match result {
            Ok(selected) => selected,
            Err(err) => {
                ctx.push_trace(TraceEvent::FlowCallFinished {
                    call: trace.clone(),
                    status: "error".to_string(),
                    error_message: Some(err.message()),
                });
                ctx.record_step(
                    ExecutionStep::new("flow_call_error", format!("call flow \"{}\" failed", flow.name), span)
                        .because(err.message())
                        .with_data(call_step_data(&trace)),
                );
                return Err(err);
            }
        };

        ctx.push_trace(TraceEvent::FlowCallFinished {
            call: trace.clone(),
            status: "ok".to_string(),
            error_message: None,
        });
        ctx.record_step(
            ExecutionStep::new("flow_call_end", format!("call flow \"{}\" finished", flow.name), span)
                .with_data(call_step_data(&trace)),
        );
        Ok(selected)
    }

    fn run_called_flow(
        &self,
        ctx: &mut ExecutionContext,
        flow: &Arc<Flow>,
        payload: ValueMap,
        flow_call_id: String,
    ) -> RuntimeResult<Value> {
        if ctx.flow_stack.iter().any(|name| name == &flow.name) {
            return Err(RuntimeError::fatal("Flow recursion is not allowed").at(flow.span));
        }
        let mut locals = ValueMap::new();
        locals.insert("input".to_string(), Value::Map(payload));
        if let Some(secrets) = ctx.locals.get("secrets") {
            locals.insert("secrets".to_string(), secrets.clone());
        }
        let mut frame = FlowFrameGuard::enter(ctx, flow.clone(), locals, Some(flow_call_id));
        self.run_flow_frame(&mut frame, flow)
    }

    /// Body of a flow already installed as the current frame: guard first,
    /// then statements or declarative steps.
    pub(crate) fn run_flow_frame(&self, ctx: &mut ExecutionContext, flow: &Flow) -> RuntimeResult<Value> {
        let requires = flow.requires.as_ref();
        // Guards that read `mutation` are checked per mutation by the policy gate.
        if !requires.map(|r| r.mentions_mutation()).unwrap_or(false) {
            let subject = format!("flow \"{}\"", flow.name);
            self.enforce_requires(ctx, requires, &subject, flow.span)?;
        }
        match &flow.body {
            FlowBody::Statements(body) => self.execute_flow_body(ctx, body),
            FlowBody::Steps(steps) => {
                self.run_declarative_flow(ctx, flow, steps)?;
                Ok(ctx.last_value.clone())
            }
        }
    }

    /// Run statements top to bottom. The result is the `return` value, or
    /// the last value when the body finishes without one.
    pub(crate) fn execute_flow_body(&self, ctx: &mut ExecutionContext, body: &[Statement]) -> RuntimeResult<Value> {
        for (index, stmt) in body.iter().enumerate() {
            ctx.current_statement_index = Some(index + 1);
            ctx.current_statement_span = Some(stmt.span());
            if let StatementOutcome::Return(value) = self.execute_statement(ctx, stmt)? {
                ctx.last_value = value.clone();
                return Ok(value);
            }
        }
        Ok(ctx.last_value.clone())
    }

    /// Write the audit entry for an audited flow that just finished.
    pub(crate) fn record_audit(
        &self,
        ctx: &mut ExecutionContext,
        flow: &Flow,
        before: Value,
        changes_mark: usize,
    ) -> RuntimeResult<()> {
        let changes = ctx.record_changes.get(changes_mark..).unwrap_or_default().to_vec();
        let entry = AuditEntry::new(
            &flow.name,
            ctx.flow_action_id.clone(),
            resolve_actor(&ctx.identity),
            before,
            ctx.state_value(),
            changes,
        )
        .redacted(&ctx.secret_values());
        ctx.audit.record(&entry)?;
        let digest = entry.digest();
        log::info!("Audit entry for flow '{}' by {} ({})", flow.name, entry.actor, digest);
        ctx.push_trace(TraceEvent::AuditRecorded {
            flow_name: entry.flow_name,
            actor: entry.actor,
            digest,
            before: entry.before,
            after: entry.after,
            record_changes: entry.record_changes,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use pretty_assertions::assert_eq;
    use weft::ir::{CallArg, Expression, Param};

    fn price_contract() -> Contract {
        Contract {
            inputs: vec![Param::required("qty", "number"), Param::optional("note", "text")],
            outputs: vec![Param::required("total", "number")],
        }
    }

    #[test]
    fn test_input_payload_rules() {
        let contract = price_contract();
        let mut args = ValueMap::new();
        args.insert("qty".to_string(), Value::Integer(2));
        let payload = build_input_payload(&contract, args, Span::unknown()).unwrap();
        assert_eq!(payload.keys().collect::<Vec<_>>(), vec!["qty"]);

        let err = build_input_payload(&contract, ValueMap::new(), Span::unknown()).unwrap_err();
        assert_eq!(err.message(), "Missing flow input 'qty'");

        let mut args = ValueMap::new();
        args.insert("qty".to_string(), Value::Integer(2));
        args.insert("zeta".to_string(), Value::Null);
        args.insert("alpha".to_string(), Value::Null);
        let err = build_input_payload(&contract, args, Span::unknown()).unwrap_err();
        assert_eq!(err.message(), "Unknown flow input 'alpha'");

        let mut args = ValueMap::new();
        args.insert("qty".to_string(), Value::text("two"));
        assert!(build_input_payload(&contract, args, Span::unknown()).is_err());
    }

    #[test]
    fn test_output_rules() {
        let contract = price_contract();
        let err = validate_flow_output(&contract, Value::Integer(1), Span::unknown()).unwrap_err();
        assert_eq!(err.message(), "Flow return must be a map");

        let err = validate_flow_output(&contract, Value::map([("extra", Value::Null), ("total", Value::Integer(1))]), Span::unknown())
            .unwrap_err();
        assert_eq!(err.message(), "Unknown flow output 'extra'");

        let output = validate_flow_output(&contract, Value::map([("total", Value::Integer(4))]), Span::unknown()).unwrap();
        let err = select_outputs(&output, &["missing".to_string()], Span::unknown()).unwrap_err();
        assert_eq!(err.message(), "Missing flow output 'missing'");
    }

    #[test]
    fn test_call_inside_function_is_fatal() {
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(weft::ir::Program::new()), EngineConfig::default());
        ctx.call_stack.push("helper".to_string());
        let call = CallFlowExpr {
            flow_name: "price".to_string(),
            arguments: vec![CallArg::new("qty", Expression::literal(1i64))],
            outputs: vec![],
            span: Span::new(2, 5),
        };
        let err = engine.execute_flow_call(&mut ctx, &call, None).unwrap_err();
        assert!(!err.is_catchable());
        assert_eq!(err.message(), "Functions cannot call flows");
    }

    #[derive(Debug)]
    struct FailingAudit;

    impl crate::audit::AuditRecorder for FailingAudit {
        fn record(&self, _entry: &AuditEntry) -> Result<(), crate::audit::AuditError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }
    }

    #[test]
    fn test_audit_failure_still_finishes_call() {
        let callee = Flow::new(
            "price",
            vec![Statement::ret(Expression::Map(vec![(
                "total".to_string(),
                Expression::literal(3i64),
            )]))],
        )
        .audited();
        let caller = Flow::new(
            "checkout",
            vec![Statement::let_(
                "priced",
                Expression::CallFlow(CallFlowExpr {
                    flow_name: "price".to_string(),
                    arguments: vec![CallArg::new("qty", Expression::literal(1i64))],
                    outputs: vec![],
                    span: Span::new(3, 5),
                }),
            )],
        );
        let program = weft::ir::Program::new()
            .with_flow(caller)
            .with_flow(callee)
            .with_contract("price", price_contract());
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default())
            .with_audit(Arc::new(FailingAudit));

        let err = engine.run_flow(&mut ctx, "checkout", Value::Null).unwrap_err();
        assert!(err.message().contains("read-only"));
        let kinds: Vec<&str> = ctx.traces.iter().map(TraceEvent::type_name).collect();
        assert_eq!(kinds, vec!["flow_call_started", "flow_call_finished"]);
        assert_eq!(ctx.traces[1].to_json()["status"], "error");
        assert!(ctx.steps.iter().any(|s| s.kind == "flow_call_error"));
    }
}
