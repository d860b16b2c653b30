//! AI turns and agents
//!
//! An AI turn drives an `AiProvider` through a bounded loop. The provider
//! either answers with text or asks for a tool; tool requests go through the
//! gateway with the call source set to `ai`, and the uniform outcome is fed
//! back on the next turn. Tool traces produced during the turn are collected
//! in `pending_tool_traces` and folded into a single `ai_call` trace.

use crate::context::{ExecutionContext, ParallelModeGuard, ToolCallSource, ToolSourceGuard};
use crate::engine::Engine;
use crate::evaluator::evaluate_at;
use crate::trace::{ExecutionStep, TraceEvent};
use std::fmt;
use std::mem;
use weft::ir::{AgentRun, AiProfile, Expression, Span};
use weft::runtime::error_reporting::{build_guidance_message, closest_match};
use weft::{RuntimeError, RuntimeResult, Value};

pub const MAX_TOOL_CALLS: usize = 3;
pub const MAX_TURNS: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct AiRequest {
    pub ai_name: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub input: Value,
    pub tools: Vec<String>,
    /// One `{tool, outcome}` object per tool call made so far in this turn.
    pub tool_results: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AiTurn {
    Text(String),
    ToolCall { name: String, arguments: Value },
}

pub trait AiProvider: fmt::Debug + Send + Sync {
    fn respond(&self, request: &AiRequest) -> RuntimeResult<AiTurn>;
}

fn provider_missing(span: Span) -> RuntimeError {
    RuntimeError::domain(build_guidance_message(
        "AI provider is not configured.",
        "The program asked an AI but the engine has no provider.",
        "Attach a provider to the engine before running AI statements.",
        "Engine::new().with_ai_provider(provider)",
    ))
    .at(span)
}

fn unknown_declaration<'a, I>(kind: &str, name: &str, known: I, span: Span) -> RuntimeError
where
    I: IntoIterator<Item = &'a String>,
{
    let what = match closest_match(name, known, 0.6) {
        Some(s) => format!("Unknown {} \"{}\". Did you mean \"{}\"?", kind, name, s),
        None => format!("Unknown {} \"{}\".", kind, name),
    };
    RuntimeError::domain(build_guidance_message(
        &what,
        &format!("Only declared {}s can be used.", kind),
        &format!("Declare the {} or fix the name.", kind),
        &format!("{} \"{}\":", kind, name),
    ))
    .at(span)
}

fn bind_target(ctx: &mut ExecutionContext, target: &str, value: Value, span: Span) -> RuntimeResult<()> {
    if ctx.constants.contains(target) {
        return Err(RuntimeError::domain(format!("Cannot assign to constant '{}'", target)).at(span));
    }
    ctx.locals.insert(target.to_string(), value.clone());
    ctx.last_value = value;
    Ok(())
}

impl Engine {
    /// One AI turn for `profile`. Always leaves an `ai_call` trace behind,
    /// whether the turn answered or failed.
    pub fn run_ai_turn(
        &self,
        ctx: &mut ExecutionContext,
        profile: &AiProfile,
        system_prompt: Option<String>,
        input: Value,
        span: Span,
    ) -> RuntimeResult<String> {
        let provider = self.ai_provider().cloned().ok_or_else(|| provider_missing(span))?;
        let outer_pending = mem::take(&mut ctx.pending_tool_traces);
        let result = {
            let mut scope = ToolSourceGuard::enter(ctx, ToolCallSource::Ai);
            self.drive_provider(&mut scope, provider.as_ref(), profile, system_prompt, &input, span)
        };
        let tool_calls = mem::replace(&mut ctx.pending_tool_traces, outer_pending);
        let (output, status) = match &result {
            Ok(text) => (Some(text.clone()), "ok"),
            Err(_) => (None, "error"),
        };
        log::info!("AI '{}' turn finished with {} tool trace(s): {}", profile.name, tool_calls.len(), status);
        ctx.push_trace(TraceEvent::AiCall {
            ai_name: profile.name.clone(),
            model: profile.model.clone(),
            input,
            output,
            tool_calls,
            status: status.to_string(),
        });
        result
    }

    fn drive_provider(
        &self,
        ctx: &mut ExecutionContext,
        provider: &dyn AiProvider,
        profile: &AiProfile,
        system_prompt: Option<String>,
        input: &Value,
        span: Span,
    ) -> RuntimeResult<String> {
        let mut request = AiRequest {
            ai_name: profile.name.clone(),
            model: profile.model.clone(),
            system_prompt,
            input: input.clone(),
            tools: profile.exposed_tools.clone(),
            tool_results: Vec::new(),
        };
        for _ in 0..MAX_TURNS {
            let (name, arguments) = match provider.respond(&request).map_err(|e| e.at(span))? {
                AiTurn::Text(text) => return Ok(text),
                AiTurn::ToolCall { name, arguments } => (name, arguments),
            };
            if request.tool_results.len() >= MAX_TOOL_CALLS {
                return Err(RuntimeError::domain(format!(
                    "AI \"{}\" exceeded the limit of {} tool calls.",
                    profile.name, MAX_TOOL_CALLS
                ))
                .at(span));
            }
            if !profile.exposed_tools.iter().any(|t| t == &name) {
                return Err(RuntimeError::domain(format!(
                    "AI \"{}\" asked for tool \"{}\" which is not exposed to it.",
                    profile.name, name
                ))
                .at(span));
            }
            let (outcome, error) = self.execute_tool_call_with_outcome(ctx, &name, arguments, span)?;
            if let Some(err) = error {
                log::debug!("Tool '{}' failed inside AI turn: {}", name, err);
            }
            request
                .tool_results
                .push(Value::map([("tool", Value::text(name)), ("outcome", outcome.to_value())]));
        }
        Err(RuntimeError::domain(format!(
            "AI \"{}\" did not answer within {} turns.",
            profile.name, MAX_TURNS
        ))
        .at(span))
    }

    fn ai_profile(&self, ctx: &ExecutionContext, ai_name: &str, span: Span) -> RuntimeResult<AiProfile> {
        ctx.program
            .ai_profiles
            .get(ai_name)
            .cloned()
            .ok_or_else(|| unknown_declaration("AI", ai_name, ctx.program.ai_profiles.keys(), span))
    }

    fn run_agent_by_name(
        &self,
        ctx: &mut ExecutionContext,
        agent_name: &str,
        input: &Expression,
        span: Span,
    ) -> RuntimeResult<Value> {
        let program = ctx.program.clone();
        let agent = program
            .agents
            .get(agent_name)
            .ok_or_else(|| unknown_declaration("agent", agent_name, program.agents.keys(), span))?;
        let profile = self.ai_profile(ctx, &agent.ai_name, span)?;
        let input = evaluate_at(self, ctx, input, span)?;
        let prompt = agent.system_prompt.clone().or_else(|| profile.system_prompt.clone());
        let output = self.run_ai_turn(ctx, &profile, prompt, input, span)?;
        Ok(Value::text(output))
    }

    pub(crate) fn execute_ask_ai(
        &self,
        ctx: &mut ExecutionContext,
        ai_name: &str,
        input: &Expression,
        target: &str,
        span: Span,
    ) -> RuntimeResult<()> {
        let profile = self.ai_profile(ctx, ai_name, span)?;
        let input = evaluate_at(self, ctx, input, span)?;
        let prompt = profile.system_prompt.clone();
        let output = self.run_ai_turn(ctx, &profile, prompt, input, span)?;
        ctx.record_step(ExecutionStep::new("statement_ask_ai", format!("asked AI {}", ai_name), span));
        bind_target(ctx, target, Value::text(output), span)
    }

    pub(crate) fn execute_run_agent(
        &self,
        ctx: &mut ExecutionContext,
        agent_name: &str,
        input: &Expression,
        target: &str,
        span: Span,
    ) -> RuntimeResult<()> {
        let output = self.run_agent_by_name(ctx, agent_name, input, span)?;
        ctx.record_step(ExecutionStep::new("statement_run_agent", format!("agent {} completed", agent_name), span));
        bind_target(ctx, target, output, span)
    }

    pub(crate) fn execute_run_agents_parallel(
        &self,
        ctx: &mut ExecutionContext,
        runs: &[AgentRun],
        target: &str,
        span: Span,
    ) -> RuntimeResult<()> {
        let mut outputs = Vec::with_capacity(runs.len());
        for run in runs {
            let mut scope = ParallelModeGuard::enter(ctx);
            outputs.push(self.run_agent_by_name(&mut scope, &run.agent_name, &run.input, span)?);
        }
        ctx.record_step(ExecutionStep::new(
            "statement_run_agents_parallel",
            format!("ran {} agents", runs.len()),
            span,
        ));
        bind_target(ctx, target, Value::List(outputs), span)
    }
}
