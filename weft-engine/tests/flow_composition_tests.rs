use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use weft::ir::{
    Assignable, BinaryOp, CallArg, CallFlowExpr, Contract, Expression, Flow, Param, Program, Span, Statement,
};
use weft::{Value, ValueMap};
use weft_engine::{EngineConfig, Engine, ExecutionContext, InMemoryAuditLog, TraceEvent};

fn call_flow(name: &str, args: Vec<CallArg>, outputs: &[&str]) -> Expression {
    Expression::CallFlow(CallFlowExpr {
        flow_name: name.to_string(),
        arguments: args,
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        span: Span::new(3, 9),
    })
}

fn price_contract() -> Contract {
    Contract {
        inputs: vec![Param::required("amount", "number")],
        outputs: vec![Param::required("total", "number"), Param::optional("note", "text")],
    }
}

fn price_flow(body_total: Option<Expression>) -> Flow {
    let result = match body_total {
        Some(total) => Expression::Map(vec![("total".to_string(), total)]),
        None => Expression::Map(vec![]),
    };
    Flow::new("price", vec![Statement::ret(result)])
}

fn checkout(args: Vec<CallArg>) -> Flow {
    Flow::new(
        "checkout",
        vec![
            Statement::let_("priced", call_flow("price", args, &["total"])),
            Statement::ret(Expression::var("priced")),
        ],
    )
}

fn doubled_amount() -> Expression {
    Expression::binary(BinaryOp::Mul, Expression::attr("input", &["amount"]), Expression::literal(2i64))
}

fn type_names(ctx: &ExecutionContext) -> Vec<&'static str> {
    ctx.traces.iter().map(TraceEvent::type_name).collect()
}

#[test]
fn test_call_returns_selected_outputs_and_restores_caller() {
    let program = Program::new()
        .with_flow(checkout(vec![CallArg::new("amount", Expression::literal(21i64))]))
        .with_flow(price_flow(Some(doubled_amount())))
        .with_contract("price", price_contract());
    let engine = Engine::new();
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());

    let out = engine.run_flow(&mut ctx, "checkout", Value::Null).unwrap();
    assert_eq!(out, Value::map([("total", Value::Integer(42))]));
    assert_eq!(type_names(&ctx), vec!["flow_call_started", "flow_call_finished"]);

    let finished = ctx.traces[1].to_json();
    assert_eq!(finished["flow_call_id"], "flow_call:0001");
    assert_eq!(finished["caller_flow"], "checkout");
    assert_eq!(finished["callee_flow"], "price");
    assert_eq!(finished["status"], "ok");
    assert_eq!(finished["contract_outputs"], serde_json::json!(["total", "note"]));

    assert!(ctx.flow.is_none());
    assert!(ctx.flow_stack.is_empty());
    assert!(ctx.locals.is_empty());
    let kinds: Vec<&str> = ctx.steps.iter().map(|s| s.kind.as_str()).collect();
    assert!(kinds.contains(&"flow_call_start"));
    assert!(kinds.contains(&"flow_call_end"));
}

#[test]
fn test_missing_required_output_fails_call() {
    let program = Program::new()
        .with_flow(checkout(vec![CallArg::new("amount", Expression::literal(1i64))]))
        .with_flow(price_flow(None))
        .with_contract("price", price_contract());
    let engine = Engine::new();
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());

    let err = engine.run_flow(&mut ctx, "checkout", Value::Null).unwrap_err();
    assert_eq!(err.message(), "Missing flow output 'total'");
    let finished = ctx.traces.last().unwrap().to_json();
    assert_eq!(finished["type"], "flow_call_finished");
    assert_eq!(finished["status"], "error");
    assert_eq!(finished["error_message"], "Missing flow output 'total'");
    assert!(ctx.steps.iter().any(|s| s.kind == "flow_call_error"));
}

#[test]
fn test_unknown_input_has_no_side_effects() {
    let program = Program::new()
        .with_flow(checkout(vec![
            CallArg::new("amount", Expression::literal(1i64)),
            CallArg::new("zeta", Expression::literal(1i64)),
            CallArg::new("bogus", Expression::literal(1i64)),
        ]))
        .with_flow(price_flow(Some(doubled_amount())))
        .with_contract("price", price_contract());
    let engine = Engine::new();
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());

    let err = engine.run_flow(&mut ctx, "checkout", Value::Null).unwrap_err();
    assert!(err.is_catchable());
    assert_eq!(err.message(), "Unknown flow input 'bogus'");
    assert!(ctx.traces.is_empty());
    assert_eq!(ctx.flow_call_counter, 0);
}

#[test]
fn test_missing_contract_and_wrong_input_type() {
    let engine = Engine::new();
    let program = Program::new()
        .with_flow(checkout(vec![CallArg::new("amount", Expression::literal(1i64))]))
        .with_flow(price_flow(Some(doubled_amount())));
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
    let err = engine.run_flow(&mut ctx, "checkout", Value::Null).unwrap_err();
    assert!(err.message().contains("Flow \"price\" is missing a contract."));

    let program = Program::new()
        .with_flow(checkout(vec![CallArg::new("amount", Expression::literal("ten"))]))
        .with_flow(price_flow(Some(doubled_amount())))
        .with_contract("price", price_contract());
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
    assert!(engine.run_flow(&mut ctx, "checkout", Value::Null).is_err());
    assert!(ctx.traces.is_empty());
}

#[test]
fn test_recursion_rejected_before_callee_runs() {
    let looping = Flow::new(
        "loop",
        vec![
            Statement::let_("marker", Expression::literal(1i64)),
            Statement::ret(call_flow("loop", vec![], &[])),
        ],
    );
    let program = Program::new().with_flow(looping).with_contract("loop", Contract::default());
    let engine = Engine::new();
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());

    let err = engine.run_flow(&mut ctx, "loop", Value::Null).unwrap_err();
    assert!(!err.is_catchable());
    assert_eq!(err.message(), "Flow recursion is not allowed");
    let lets = ctx.steps.iter().filter(|s| s.kind == "statement_let").count();
    assert_eq!(lets, 1);
    assert!(ctx.flow_stack.is_empty());
}

#[test]
fn test_audited_save_writes_redacted_entry() {
    let flow = Flow::new(
        "register",
        vec![
            Statement::set(
                Assignable::State(vec!["profile".to_string()]),
                Expression::Map(vec![
                    ("name".to_string(), Expression::attr("input", &["name"])),
                    ("token".to_string(), Expression::literal("sk-live-123")),
                ]),
            ),
            Statement::save("profile", Some(Expression::state(&["profile"]))),
        ],
    )
    .requires(Expression::literal(true))
    .audited();
    let program = Program::new().with_flow(flow);
    let mut config = EngineConfig::default();
    config.secrets.insert("stripe".to_string(), "sk-live-123".to_string());

    let audit = Arc::new(InMemoryAuditLog::new());
    let engine = Engine::new();
    let mut ctx = ExecutionContext::new(Arc::new(program), config).with_audit(audit.clone());
    ctx.identity.insert("email".to_string(), Value::text("ada@example.com"));

    engine
        .run_flow(&mut ctx, "register", Value::map([("name", Value::text("Ada"))]))
        .unwrap();

    let entries = audit.entries();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.flow_name, "register");
    assert_eq!(entry.actor, "ada@example.com");
    assert_eq!(entry.before, Value::Map(ValueMap::new()));
    assert_eq!(entry.record_changes.len(), 1);
    let serialized = serde_json::to_string(entry).unwrap();
    assert!(!serialized.contains("sk-live-123"));

    let recorded = ctx.traces.last().unwrap().to_json();
    assert_eq!(recorded["type"], "audit_recorded");
    assert_eq!(recorded["digest"], entry.digest());
}

#[test]
fn test_caught_call_failure_restores_caller_frame() {
    let program = Program::new()
        .with_flow(price_flow(None))
        .with_contract("price", price_contract());
    let engine = Engine::new();
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
    ctx.flow = Some(Arc::new(Flow::new("checkout", vec![])));
    ctx.flow_stack.push("checkout".to_string());
    ctx.flow_call_id = Some("flow_call:outer".to_string());
    ctx.last_value = Value::text("before");
    ctx.locals.insert("keep".to_string(), Value::Integer(1));
    ctx.constants.insert("keep".to_string());

    let guarded = Statement::TryCatch {
        try_body: vec![Statement::let_(
            "priced",
            call_flow("price", vec![CallArg::new("amount", Expression::literal(1i64))], &["total"]),
        )],
        catch_var: "err".to_string(),
        catch_body: vec![],
        span: Span::new(2, 1),
    };
    engine.execute_statement(&mut ctx, &guarded).unwrap();

    let mut names: Vec<&str> = ctx.locals.keys().map(String::as_str).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["err", "keep"]);
    assert_eq!(ctx.locals.get("keep"), Some(&Value::Integer(1)));
    assert_eq!(ctx.constants, HashSet::from(["keep".to_string()]));
    assert_eq!(ctx.flow_call_id.as_deref(), Some("flow_call:outer"));
    assert_eq!(ctx.last_value, Value::text("before"));
    assert_eq!(ctx.flow_stack, vec!["checkout".to_string()]);
    assert_eq!(ctx.flow.as_deref().map(|f| f.name.as_str()), Some("checkout"));
    assert_eq!(type_names(&ctx), vec!["flow_call_started", "flow_call_finished"]);
}
