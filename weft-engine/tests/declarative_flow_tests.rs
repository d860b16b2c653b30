use pretty_assertions::assert_eq;
use std::sync::Arc;
use weft::ir::{Expression, Flow, FlowField, FlowStep, Program, Span};
use weft::{Value, ValueMap};
use weft_engine::{Engine, EngineConfig, ExecutionContext, TraceEvent};

fn signup_flow() -> Flow {
    Flow::declarative(
        "signup",
        vec![
            FlowStep::Input {
                fields: vec![FlowField {
                    name: "email".to_string(),
                    type_name: "text".to_string(),
                    span: Span::new(2, 5),
                }],
                span: Span::new(2, 3),
            },
            FlowStep::Require {
                condition: "state.signups.open".to_string(),
                span: Span::new(3, 3),
            },
            FlowStep::Create {
                record: "User".to_string(),
                fields: vec![("email".to_string(), Expression::attr("input", &["email"]))],
                span: Span::new(4, 3),
            },
        ],
    )
    .requires(Expression::literal(true))
}

fn state(open: bool) -> ValueMap {
    let mut state = ValueMap::new();
    state.insert("signups".to_string(), Value::map([("open", Value::Boolean(open))]));
    state
}

fn flow_steps(ctx: &ExecutionContext) -> Vec<serde_json::Value> {
    ctx.traces
        .iter()
        .filter(|t| matches!(t, TraceEvent::FlowStep { .. }))
        .map(TraceEvent::to_json)
        .collect()
}

fn input() -> Value {
    Value::map([("email", Value::text("ada@example.com"))])
}

#[test]
fn test_open_gate_runs_every_step() {
    let engine = Engine::new();
    let program = Program::new().with_flow(signup_flow());
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default())
        .with_state(state(true))
        .with_action_id("signup_form");

    engine.run_flow(&mut ctx, "signup", input()).unwrap();

    let kinds: Vec<&str> = ctx.traces.iter().map(TraceEvent::type_name).collect();
    assert_eq!(kinds[..2].to_vec(), vec!["authorization_check", "flow_start"]);
    let steps = flow_steps(&ctx);
    let ids: Vec<&str> = steps.iter().map(|s| s["step_id"].as_str().unwrap_or("")).collect();
    assert_eq!(ids, vec!["signup:input:1", "signup:require:2", "signup:create:3"]);
    assert!(steps.iter().all(|s| s["status"] == "ran"));
    assert_eq!(steps[0]["fields"], serde_json::json!(["email"]));
    assert_eq!(steps[1]["gate"]["status"], "passed");
    assert_eq!(steps[2]["changes"]["record"], "User");
    assert_eq!(steps[2]["why"], "action \"signup_form\" ran flow \"signup\"");
    assert_eq!(ctx.record_changes.len(), 1);
}

#[test]
fn test_blocked_gate_skips_later_steps() {
    let engine = Engine::new();
    let program = Program::new().with_flow(signup_flow());
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default()).with_state(state(false));

    engine.run_flow(&mut ctx, "signup", input()).unwrap();

    let steps = flow_steps(&ctx);
    assert_eq!(steps[1]["gate"]["status"], "blocked");
    assert_eq!(steps[1]["status"], "ran");
    assert_eq!(steps[2]["status"], "skipped");
    assert_eq!(steps[2]["gate"]["reason"], "requires state.signups.open");
    assert_eq!(steps[2]["why"], "flow \"signup\" ran");
    assert!(ctx.record_changes.is_empty());
}

#[test]
fn test_missing_input_field_fails_before_any_step() {
    let engine = Engine::new();
    let program = Program::new().with_flow(signup_flow());
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default()).with_state(state(true));

    let err = engine
        .run_flow(&mut ctx, "signup", Value::map([("name", Value::text("Ada"))]))
        .unwrap_err();
    assert!(err.message().contains("Flow input is missing 'email'."));
    assert!(flow_steps(&ctx).is_empty());
    assert!(ctx.record_changes.is_empty());
}

#[test]
fn test_declarative_create_still_needs_requires() {
    let mut flow = signup_flow();
    flow.requires = None;
    let engine = Engine::new();
    let program = Program::new().with_flow(flow);
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default()).with_state(state(true));

    let err = engine.run_flow(&mut ctx, "signup", input()).unwrap_err();
    assert_eq!(
        err.diagnostic().and_then(|d| d.detail("policy_reason")),
        Some("policy_missing")
    );
    assert_eq!(err.diagnostic().and_then(|d| d.line), Some(4));
}
