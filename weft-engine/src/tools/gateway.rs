//! Tool call gateway
//!
//! Every tool call, whether a flow expression or an AI turn asked for it,
//! passes through here. Order of checks: isolation, binding, foreign policy,
//! capability gate, then dispatch. Whatever the exit path, one `tool_call`
//! trace is written, blocked exits add a `tool_policy_block`, and a foreign
//! tool's `foreign_boundary_start` is always paired with a
//! `foreign_boundary_end`.

use crate::config::ForeignPolicyMode;
use crate::context::{ExecutionContext, ToolCallSource, TraceSinkGuard};
use crate::engine::Engine;
use crate::tools::bindings::{resolve_tool_binding, ToolBinding, REASON_DETAIL};
use crate::tools::builtins::is_builtin_tool;
use crate::tools::gate::{gate_tool_call, normalize_capabilities, ToolPolicy};
use crate::tools::outcome::{DecisionStatus, ResultKind, ToolCallOutcome, ToolDecision};
use crate::tools::runners::{ToolRequest, ToolRunner};
use crate::tools::schema::{validate_tool_payload, PayloadPhase};
use crate::trace::TraceEvent;
use std::sync::Arc;
use weft::ir::{Span, ToolDecl, ToolKind};
use weft::runtime::error_reporting::build_guidance_message;
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

const BLOCKED_STATUS_REASON: &str = "pack_unavailable_or_unverified";

struct Attempt {
    decision: ToolDecision,
    result: Result<Value, RuntimeError>,
}

impl Attempt {
    fn stopped(decision: ToolDecision, err: RuntimeError) -> Self {
        Self {
            decision,
            result: Err(err),
        }
    }
}

type Dispatch = Option<(ToolBinding, Arc<dyn ToolRunner>)>;

fn tool_example(tool_name: &str) -> String {
    format!(
        "tool \"{}\":\n  implemented using python\n\n  input:\n    web address is text\n\n  output:\n    data is json",
        tool_name
    )
}

fn undeclared_tool_error(tool_name: &str, span: Span) -> RuntimeError {
    RuntimeError::domain(build_guidance_message(
        &format!("Tool \"{}\" is not declared.", tool_name),
        "The flow called a tool name that is not in the program.",
        "Declare the tool before calling it.",
        &tool_example(tool_name),
    ))
    .at(span)
}

fn unsupported_kind_error(tool_name: &str, kind: ToolKind, span: Span) -> RuntimeError {
    RuntimeError::domain(build_guidance_message(
        &format!("Tool \"{}\" has unsupported kind \"{}\".", tool_name, kind),
        "Only python and node tools can be called directly from flows.",
        "Declare the tool with `implemented using python` or `implemented using node` before calling it.",
        &tool_example(tool_name),
    ))
    .at(span)
}

fn foreign_policy_message(mode: ForeignPolicyMode) -> &'static str {
    match mode {
        ForeignPolicyMode::Strict => "Foreign calls are blocked by strict determinism policy.",
        ForeignPolicyMode::Default => "Foreign calls are blocked by policy.",
    }
}

fn foreign_policy_error(tool_name: &str, span: Span) -> RuntimeError {
    RuntimeError::domain(build_guidance_message(
        &format!("Foreign function \"{}\" is blocked by strict determinism policy.", tool_name),
        "Strict mode rejects foreign calls unless explicitly allowed.",
        "Allow foreign calls for this run or disable strict mode.",
        "WEFT_FOREIGN_ALLOW=1",
    ))
    .at(span)
}

/// Non-foreign results always reach the caller as an object.
fn ensure_object(value: Value) -> Value {
    match value {
        Value::Map(_) => value,
        other => {
            let mut map = ValueMap::new();
            map.insert("result".to_string(), other);
            Value::Map(map)
        }
    }
}

impl Engine {
    /// Call a tool and hand back its result, or the error that stopped it.
    pub fn execute_tool_call(
        &self,
        ctx: &mut ExecutionContext,
        tool_name: &str,
        args: Value,
        span: Span,
    ) -> RuntimeResult<Value> {
        let (outcome, error) = self.execute_tool_call_with_outcome(ctx, tool_name, args, span)?;
        match error {
            Some(err) => Err(err),
            None => Ok(outcome.result_value.unwrap_or(Value::Null)),
        }
    }

    /// Call a tool and report the uniform outcome alongside any error.
    ///
    /// Only fatal isolation violations come back as `Err`; every policy,
    /// resolution or runner failure is an outcome plus its error.
    pub fn execute_tool_call_with_outcome(
        &self,
        ctx: &mut ExecutionContext,
        tool_name: &str,
        args: Value,
        span: Span,
    ) -> RuntimeResult<(ToolCallOutcome, Option<RuntimeError>)> {
        if ctx.tool_call_source == ToolCallSource::Ai {
            let mut sink = TraceSinkGuard::redirect_to_pending(ctx);
            return self.run_tool_call(&mut sink, tool_name, args, span);
        }
        self.run_tool_call(ctx, tool_name, args, span)
    }

    fn run_tool_call(
        &self,
        ctx: &mut ExecutionContext,
        tool_name: &str,
        args: Value,
        span: Span,
    ) -> RuntimeResult<(ToolCallOutcome, Option<RuntimeError>)> {
        let program = ctx.program.clone();
        let decl = program.tools.get(tool_name);
        let foreign = decl.map(|d| d.foreign).unwrap_or(false);
        if foreign && ctx.parallel_mode {
            return Err(RuntimeError::fatal("Parallel tasks cannot call foreign tools").at(span));
        }
        let builtin_fallback =
            decl.is_none() && ctx.tool_call_source == ToolCallSource::Ai && is_builtin_tool(tool_name);
        let kind = decl
            .map(|d| d.kind)
            .or_else(|| builtin_fallback.then_some(ToolKind::Builtin));
        let policy_mode = ctx.config.foreign.mode();

        if foreign {
            ctx.push_trace(TraceEvent::ForeignBoundaryStart {
                tool_name: tool_name.to_string(),
                policy_mode: policy_mode.as_str().to_string(),
                input: args.clone(),
            });
        }

        let Attempt { decision, result } =
            self.attempt_tool_call(ctx, tool_name, decl, kind, builtin_fallback, &args, span);
        let result_kind = match (&result, decision.status) {
            (Ok(_), _) => ResultKind::Ok,
            (Err(_), DecisionStatus::Blocked) => ResultKind::Blocked,
            (Err(_), _) => ResultKind::Error,
        };

        if result_kind == ResultKind::Blocked {
            ctx.push_trace(TraceEvent::ToolPolicyBlock {
                tool_name: tool_name.to_string(),
                decision: decision.clone(),
            });
        }
        ctx.push_trace(TraceEvent::ToolCall {
            tool_name: tool_name.to_string(),
            kind: kind.map(|k| k.as_str().to_string()),
            decision: decision.clone(),
            result: result_kind.as_str().to_string(),
        });
        if foreign {
            ctx.push_trace(TraceEvent::ForeignBoundaryEnd {
                tool_name: tool_name.to_string(),
                policy_mode: policy_mode.as_str().to_string(),
                status: result_kind.as_str().to_string(),
                result: result.as_ref().ok().cloned(),
                error_message: result.as_ref().err().map(RuntimeError::message),
            });
        }

        match result {
            Ok(value) => {
                log::debug!("Tool '{}' ok", tool_name);
                Ok((ToolCallOutcome::ok(tool_name, decision, value), None))
            }
            Err(err) => {
                let summary = match &decision.message {
                    Some(message) if !decision.is_allowed() => message.clone(),
                    _ => err.message(),
                };
                log::warn!("Tool '{}' {}: {:?}", tool_name, result_kind, decision.reason);
                Ok((
                    ToolCallOutcome::failed(tool_name, decision, result_kind, summary),
                    Some(err),
                ))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt_tool_call(
        &self,
        ctx: &mut ExecutionContext,
        tool_name: &str,
        decl: Option<&ToolDecl>,
        kind: Option<ToolKind>,
        builtin_fallback: bool,
        args: &Value,
        span: Span,
    ) -> Attempt {
        let dispatch = match self.check_binding(ctx, tool_name, kind, span) {
            Ok(dispatch) => dispatch,
            Err(attempt) => return attempt,
        };

        let foreign = decl.map(|d| d.foreign).unwrap_or(false);
        if foreign && !ctx.config.foreign.allows_foreign() {
            let decision =
                ToolDecision::blocked("foreign_policy", foreign_policy_message(ctx.config.foreign.mode()));
            return Attempt::stopped(decision, foreign_policy_error(tool_name, span));
        }

        let required = normalize_capabilities(decl.map(|d| d.capabilities.clone()).unwrap_or_default());
        let policy = ToolPolicy {
            tool_known: decl.is_some() || builtin_fallback,
            granted: &ctx.capabilities,
        };
        let decision = gate_tool_call(tool_name, &required, &policy);
        if !decision.is_allowed() {
            let message = decision.message.clone().unwrap_or_default();
            return Attempt::stopped(decision, RuntimeError::domain(message).at(span));
        }

        let result = match (decl, kind) {
            (_, None) => Err(RuntimeError::domain(format!("Unknown tool \"{}\".", tool_name)).at(span)),
            (decl, Some(kind)) => self.dispatch_tool(ctx, tool_name, decl, kind, dispatch, args, span),
        };
        Attempt { decision, result }
    }

    /// Resolve the binding and runner of scripted tools. Other kinds need none.
    fn check_binding(
        &self,
        ctx: &ExecutionContext,
        tool_name: &str,
        kind: Option<ToolKind>,
        span: Span,
    ) -> Result<Dispatch, Attempt> {
        let Some(kind) = kind else {
            let err = match ctx.tool_call_source {
                ToolCallSource::Ai => RuntimeError::domain(format!("Unknown tool \"{}\".", tool_name)).at(span),
                ToolCallSource::Flow => undeclared_tool_error(tool_name, span),
            };
            let decision = ToolDecision::error("unknown_tool", format!("Unknown tool \"{}\".", tool_name));
            return Err(Attempt::stopped(decision, err));
        };
        if !kind.is_scripted() {
            return Ok(None);
        }
        let resolved = resolve_tool_binding(
            &ctx.config.tools,
            ctx.config.project_root.as_deref(),
            tool_name,
            kind,
            span,
        )
        .map_err(|err| {
            let reason = err
                .diagnostic()
                .and_then(|d| d.detail(REASON_DETAIL))
                .unwrap_or("binding_error")
                .to_string();
            let decision = if reason == BLOCKED_STATUS_REASON {
                ToolDecision::blocked(&reason, err.message())
            } else {
                ToolDecision::error(&reason, err.message())
            };
            Attempt::stopped(decision, err)
        })?;
        let runner = self
            .runners()
            .get(resolved.binding.runner_name(), span)
            .map_err(|err| {
                let decision = ToolDecision::error("unknown_runner", err.message());
                Attempt::stopped(decision, err.with_detail(REASON_DETAIL, "unknown_runner"))
            })?;
        Ok(Some((resolved.binding, runner)))
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_tool(
        &self,
        ctx: &mut ExecutionContext,
        tool_name: &str,
        decl: Option<&ToolDecl>,
        kind: ToolKind,
        dispatch: Dispatch,
        args: &Value,
        span: Span,
    ) -> RuntimeResult<Value> {
        let builtin_decl;
        let tool = match decl {
            Some(tool) => tool,
            None => {
                builtin_decl = ToolDecl::new(tool_name, ToolKind::Builtin);
                &builtin_decl
            }
        };
        validate_tool_payload(tool_name, PayloadPhase::Input, &tool.input_fields, args, span)?;

        let value = match (kind, dispatch) {
            (ToolKind::Python | ToolKind::Node, Some((binding, runner))) => {
                log::debug!("Dispatching '{}' to runner '{}'", tool_name, runner.name());
                let request = ToolRequest {
                    tool,
                    binding: Some(&binding),
                    payload: args,
                    project_root: ctx.config.project_root.as_ref(),
                };
                runner
                    .execute(&request)
                    .map_err(|e| RuntimeError::from(e).at(span))?
            }
            (ToolKind::Builtin, _) if ctx.tool_call_source == ToolCallSource::Ai => {
                let request = ToolRequest {
                    tool,
                    binding: None,
                    payload: args,
                    project_root: ctx.config.project_root.as_ref(),
                };
                self.builtin_runner()
                    .execute(&request)
                    .map_err(|e| RuntimeError::from(e).at(span))?
            }
            (kind, _) => return Err(unsupported_kind_error(tool_name, kind, span)),
        };

        if tool.foreign {
            return Ok(value);
        }
        let object = ensure_object(value);
        validate_tool_payload(tool_name, PayloadPhase::Output, &tool.output_fields, &object, span)?;
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::tools::runners::RunnerError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft::ir::{Param, Program};

    #[derive(Debug, Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    impl ToolRunner for CountingRunner {
        fn name(&self) -> &str {
            "local"
        }

        fn execute(&self, request: &ToolRequest<'_>) -> Result<Value, RunnerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(request.payload.clone())
        }
    }

    fn bound_config(tool: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        config
            .tools
            .bindings
            .insert(tool.to_string(), ToolBinding::new(ToolKind::Python, format!("tools.{}:run", tool)));
        config
    }

    #[test]
    fn test_capability_denied_by_default() {
        let runner = Arc::new(CountingRunner::default());
        let engine = Engine::new().with_runner(runner.clone());
        let program = Program::new()
            .with_tool(ToolDecl::new("fetch", ToolKind::Python).with_capabilities(&["Network"]));
        let mut ctx = ExecutionContext::new(Arc::new(program), bound_config("fetch"));
        let (outcome, err) = engine
            .execute_tool_call_with_outcome(&mut ctx, "fetch", Value::map([("url", Value::text("x"))]), Span::unknown())
            .unwrap();
        assert!(err.is_some());
        assert_eq!(outcome.result_kind, ResultKind::Blocked);
        assert_eq!(outcome.decision.capability.as_deref(), Some("network"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        let kinds: Vec<&str> = ctx.traces.iter().map(TraceEvent::type_name).collect();
        assert_eq!(kinds, vec!["tool_policy_block", "tool_call"]);

        let mut ctx = ctx.with_capabilities(["network"]);
        let value = engine
            .execute_tool_call(&mut ctx, "fetch", Value::text("plain"), Span::unknown())
            .unwrap();
        assert_eq!(value, Value::map([("result", Value::text("plain"))]));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbound_scripted_tool_never_runs() {
        let runner = Arc::new(CountingRunner::default());
        let engine = Engine::new().with_runner(runner.clone());
        let program = Program::new().with_tool(ToolDecl::new("summarize", ToolKind::Python));
        let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
        let (outcome, err) = engine
            .execute_tool_call_with_outcome(&mut ctx, "summarize", Value::Map(ValueMap::new()), Span::unknown())
            .unwrap();
        assert!(err.is_some());
        assert_eq!(outcome.result_kind, ResultKind::Error);
        assert_eq!(outcome.decision.reason.as_deref(), Some("missing_binding"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_undeclared_tool_from_flow() {
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(Program::new()), EngineConfig::default());
        let err = engine
            .execute_tool_call(&mut ctx, "echo", Value::Null, Span::unknown())
            .unwrap_err();
        assert!(err.message().contains("Tool \"echo\" is not declared."));
    }

    #[test]
    fn test_builtin_only_from_ai_and_traces_go_pending() {
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(Program::new()), EngineConfig::default());
        ctx.tool_call_source = ToolCallSource::Ai;
        let value = engine
            .execute_tool_call(&mut ctx, "slugify", Value::map([("text", Value::text("Hello World"))]), Span::unknown())
            .unwrap();
        assert!(value.as_map().is_some());
        assert!(ctx.traces.is_empty());
        assert_eq!(ctx.pending_tool_traces.len(), 1);
    }

    #[test]
    fn test_foreign_boundary_pairs_and_strict_policy() {
        let runner = Arc::new(CountingRunner::default());
        let engine = Engine::new().with_runner(runner.clone());
        let program = Program::new().with_tool(ToolDecl::new("geo", ToolKind::Python).foreign());
        let mut config = bound_config("geo");
        config.foreign.strict = true;
        let mut ctx = ExecutionContext::new(Arc::new(program), config);
        let (outcome, err) = engine
            .execute_tool_call_with_outcome(&mut ctx, "geo", Value::Null, Span::unknown())
            .unwrap();
        assert_eq!(outcome.decision.reason.as_deref(), Some("foreign_policy"));
        assert!(err.unwrap().message().contains("WEFT_FOREIGN_ALLOW=1"));
        let kinds: Vec<&str> = ctx.traces.iter().map(TraceEvent::type_name).collect();
        assert_eq!(
            kinds,
            vec!["foreign_boundary_start", "tool_policy_block", "tool_call", "foreign_boundary_end"]
        );
        assert_eq!(ctx.traces[3].to_json()["status"], "blocked");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        ctx.parallel_mode = true;
        let fatal = engine
            .execute_tool_call_with_outcome(&mut ctx, "geo", Value::Null, Span::unknown())
            .unwrap_err();
        assert!(!fatal.is_catchable());
    }

    #[test]
    fn test_input_schema_violation_is_error_outcome() {
        let runner = Arc::new(CountingRunner::default());
        let engine = Engine::new().with_runner(runner.clone());
        let mut tool = ToolDecl::new("fetch", ToolKind::Python);
        tool.input_fields = vec![Param::required("url", "text")];
        let program = Program::new().with_tool(tool);
        let mut ctx = ExecutionContext::new(Arc::new(program), bound_config("fetch"));
        let (outcome, err) = engine
            .execute_tool_call_with_outcome(&mut ctx, "fetch", Value::map([("url", Value::Integer(3))]), Span::unknown())
            .unwrap();
        assert_eq!(outcome.result_kind, ResultKind::Error);
        assert!(err.unwrap().message().contains("Tool input for \"fetch\""));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }
}
