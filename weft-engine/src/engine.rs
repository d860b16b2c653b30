//! Engine façade
//!
//! `Engine` owns the stateless collaborators: the expression evaluator, the
//! tool runner registry, the built-in tool runner and the optional AI
//! provider. All per-run state lives in `ExecutionContext`, so one engine
//! can serve many contexts. The operations themselves are spread across
//! `impl Engine` blocks in the interpreter, composer, policy and gateway
//! modules.

use crate::context::{ExecutionContext, FlowFrameGuard};
use crate::evaluator::{BasicEvaluator, ExpressionEvaluator};
use crate::explain::ExplainCollector;
use crate::interpreter::ai::AiProvider;
use crate::tools::builtins::BuiltinToolRunner;
use crate::tools::runners::{ToolRunner, ToolRunnerRegistry};
use std::fmt;
use std::sync::Arc;
use weft::ir::{Expression, Flow};
use weft::runtime::error_reporting::{build_guidance_message, closest_match};
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

pub struct Engine {
    evaluator: Arc<dyn ExpressionEvaluator>,
    runners: ToolRunnerRegistry,
    builtins: Arc<dyn ToolRunner>,
    ai_provider: Option<Arc<dyn AiProvider>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("evaluator", &self.evaluator)
            .field("runners", &self.runners.names())
            .field("ai_provider", &self.ai_provider.is_some())
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            evaluator: Arc::new(BasicEvaluator),
            runners: ToolRunnerRegistry::with_defaults(),
            builtins: Arc::new(BuiltinToolRunner),
            ai_provider: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Register (or replace) a runner under its own name.
    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runners.register(runner);
        self
    }

    pub fn with_ai_provider(mut self, provider: Arc<dyn AiProvider>) -> Self {
        self.ai_provider = Some(provider);
        self
    }

    pub fn runners(&self) -> &ToolRunnerRegistry {
        &self.runners
    }

    pub(crate) fn builtin_runner(&self) -> &Arc<dyn ToolRunner> {
        &self.builtins
    }

    pub(crate) fn ai_provider(&self) -> Option<&Arc<dyn AiProvider>> {
        self.ai_provider.as_ref()
    }

    pub fn evaluate(&self, ctx: &mut ExecutionContext, expr: &Expression) -> RuntimeResult<Value> {
        self.evaluator.evaluate(self, ctx, expr, None)
    }

    pub fn evaluate_explained(
        &self,
        ctx: &mut ExecutionContext,
        expr: &Expression,
        collector: Option<&mut ExplainCollector>,
    ) -> RuntimeResult<Value> {
        self.evaluator.evaluate(self, ctx, expr, collector)
    }

    pub(crate) fn lookup_flow(&self, ctx: &ExecutionContext, name: &str) -> RuntimeResult<Arc<Flow>> {
        if let Some(flow) = ctx.program.flows.get(name) {
            return Ok(flow.clone());
        }
        let suggestion = closest_match(name, ctx.program.flows.keys(), 0.6);
        let what = match &suggestion {
            Some(s) => format!("Unknown flow \"{}\". Did you mean \"{}\"?", name, s),
            None => format!("Unknown flow \"{}\".", name),
        };
        Err(RuntimeError::domain(build_guidance_message(
            &what,
            "Flows can only call flows declared in the program.",
            "Check the flow name or declare the flow.",
            &format!("flow \"{}\":", suggestion.as_deref().unwrap_or(name)),
        )))
    }

    /// Top-level invocation of a flow with an input payload.
    ///
    /// Runs the requires guard, the body (statements or declarative steps) and
    /// records an audit entry when the flow is audited. Unlike a flow call,
    /// no contract is applied: the body's return value is handed back as is.
    pub fn run_flow(&self, ctx: &mut ExecutionContext, name: &str, input: Value) -> RuntimeResult<Value> {
        let flow = self.lookup_flow(ctx, name)?;
        let span = tracing::info_span!("flow_run", flow = %name, run_id = %ctx.run_id);
        let _entered = span.enter();
        log::info!("Running flow '{}'", name);
        let obs_span = ctx.observability.span_start(&format!("flow:{}", name));

        let mut locals = ValueMap::new();
        locals.insert("input".to_string(), input);
        let secrets = &ctx.config.secrets;
        if !secrets.is_empty() {
            let secret_map: ValueMap = secrets
                .iter()
                .map(|(k, v)| (k.clone(), Value::text(v.clone())))
                .collect();
            locals.insert("secrets".to_string(), Value::Map(secret_map));
        }

        let audit_before = flow.audited.then(|| ctx.state_value());
        let changes_mark = ctx.record_changes.len();
        let result = {
            let mut frame = FlowFrameGuard::enter(ctx, flow.clone(), locals, None);
            self.run_flow_frame(&mut frame, &flow)
        };
        let status = if result.is_ok() { "ok" } else { "error" };
        ctx.observability.span_end(obs_span, status);
        let value = result?;
        if let Some(before) = audit_before {
            self.record_audit(ctx, &flow, before, changes_mark)?;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use weft::ir::{Program, Statement};

    #[test]
    fn test_unknown_flow_suggests_closest() {
        let program = Program::new().with_flow(Flow::new(
            "checkout",
            vec![Statement::ret(Expression::literal(1i64))],
        ));
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
        let err = engine.run_flow(&mut ctx, "chekout", Value::Null).unwrap_err();
        assert!(err
            .message()
            .contains("Unknown flow \"chekout\". Did you mean \"checkout\"?"));
    }

    #[test]
    fn test_run_flow_returns_body_value() {
        let program = Program::new().with_flow(Flow::new(
            "echo",
            vec![Statement::ret(Expression::attr("input", &["name"]))],
        ));
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
        let out = engine
            .run_flow(&mut ctx, "echo", Value::map([("name", Value::text("ana"))]))
            .unwrap();
        assert_eq!(out, Value::text("ana"));
        assert!(ctx.flow_stack.is_empty());
        assert!(ctx.locals.is_empty());
    }
}
