use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::ir::{CallArg, Expression, Flow, Program, Span, Statement, ToolCallExpr, ToolDecl, ToolKind};
use weft::Value;
use weft_engine::tools::bindings::ToolBinding;
use weft_engine::{
    DecisionStatus, Engine, EngineConfig, ExecutionContext, ResultKind, RunnerError, ToolRequest, ToolRunner,
    TraceEvent,
};

#[derive(Debug, Default)]
struct RecordingRunner {
    calls: AtomicUsize,
}

impl ToolRunner for RecordingRunner {
    fn name(&self) -> &str {
        "local"
    }

    fn execute(&self, request: &ToolRequest<'_>) -> Result<Value, RunnerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let entry = request.binding.map(|b| b.entry.clone()).unwrap_or_default();
        Ok(Value::map([("entry", Value::text(entry))]))
    }
}

fn tool_flow(tool: &str) -> Flow {
    Flow::new(
        "fetch_data",
        vec![Statement::ret(Expression::ToolCall(ToolCallExpr {
            tool_name: tool.to_string(),
            arguments: vec![CallArg::new("url", Expression::literal("https://example.com"))],
            span: Span::new(4, 12),
        }))],
    )
}

#[test]
fn test_missing_binding_never_invokes_runner() {
    let runner = Arc::new(RecordingRunner::default());
    let engine = Engine::new().with_runner(runner.clone());
    let program = Program::new()
        .with_flow(tool_flow("fetch"))
        .with_tool(ToolDecl::new("fetch", ToolKind::Python));
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());

    let err = engine.run_flow(&mut ctx, "fetch_data", Value::Null).unwrap_err();
    assert!(err.is_catchable());
    assert_eq!(err.diagnostic().and_then(|d| d.detail("tool_reason")), Some("missing_binding"));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

    let trace = ctx.traces.last().unwrap().to_json();
    assert_eq!(trace["type"], "tool_call");
    assert_eq!(trace["result"], "error");
    assert_eq!(trace["decision"]["reason"], "missing_binding");
}

#[test]
fn test_local_tool_file_binds_implicitly() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("tools"))?;
    std::fs::write(dir.path().join("tools/fetch_page.py"), "def run(payload):\n    return payload\n")?;

    let runner = Arc::new(RecordingRunner::default());
    let engine = Engine::new().with_runner(runner.clone());
    let program = Program::new()
        .with_flow(tool_flow("Fetch Page"))
        .with_tool(ToolDecl::new("Fetch Page", ToolKind::Python));
    let mut config = EngineConfig::default();
    config.project_root = Some(dir.path().to_path_buf());
    let mut ctx = ExecutionContext::new(Arc::new(program), config);

    let out = engine.run_flow(&mut ctx, "fetch_data", Value::Null)?;
    assert_eq!(out, Value::map([("entry", Value::text("tools.fetch_page:run"))]));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_gate_decision_is_stable_across_repeated_calls() {
    let runner = Arc::new(RecordingRunner::default());
    let engine = Engine::new().with_runner(runner.clone());
    let program = Program::new().with_tool(ToolDecl::new("fetch", ToolKind::Python).with_capabilities(&["network"]));
    let mut config = EngineConfig::default();
    config
        .tools
        .bindings
        .insert("fetch".to_string(), ToolBinding::new(ToolKind::Python, "tools.fetch:run"));
    let mut ctx = ExecutionContext::new(Arc::new(program), config);

    let first = engine
        .execute_tool_call_with_outcome(&mut ctx, "fetch", Value::Null, Span::unknown())
        .unwrap()
        .0;
    let second = engine
        .execute_tool_call_with_outcome(&mut ctx, "fetch", Value::Null, Span::unknown())
        .unwrap()
        .0;
    assert_eq!(first, second);
    assert_eq!(first.decision.status, DecisionStatus::Blocked);
    assert_eq!(first.result_kind, ResultKind::Blocked);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

    let blocks = ctx
        .traces
        .iter()
        .filter(|t| matches!(t, TraceEvent::ToolPolicyBlock { .. }))
        .count();
    assert_eq!(blocks, 2);
}

#[test]
fn test_foreign_tool_inside_parallel_block_is_fatal() {
    let engine = Engine::new();
    let program = Program::new().with_tool(ToolDecl::new("geo", ToolKind::Python).foreign());
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
    let stmt = Statement::Parallel {
        tasks: vec![weft::ir::ParallelTask {
            name: "lookup".to_string(),
            body: vec![Statement::let_(
                "place",
                Expression::ToolCall(ToolCallExpr {
                    tool_name: "geo".to_string(),
                    arguments: vec![],
                    span: Span::unknown(),
                }),
            )],
        }],
        target: None,
        span: Span::unknown(),
    };
    let err = engine.execute_statement(&mut ctx, &stmt).unwrap_err();
    assert!(!err.is_catchable());
    assert_eq!(err.message(), "Parallel tasks cannot call foreign tools");
    assert!(ctx.traces.is_empty());
}

#[test]
fn test_builtin_tools_are_not_callable_from_flows() {
    let engine = Engine::new();
    let program = Program::new().with_tool(ToolDecl::new("echo", ToolKind::Builtin));
    let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
    let err = engine
        .execute_tool_call(&mut ctx, "echo", Value::Null, Span::unknown())
        .unwrap_err();
    assert!(err.message().contains("Tool \"echo\" has unsupported kind \"builtin\"."));
}
