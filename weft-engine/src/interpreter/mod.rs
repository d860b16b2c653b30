//! Statement interpreter
//!
//! `execute_statement` is one exhaustive match over the closed statement set.
//! Assignments, `return` and `try/catch` live here; loops and branches are in
//! `control_flow`, record effects in `records`, AI turns in `ai`, and theme,
//! log, metric and job statements in `observe`.
//!
//! A `Return` anywhere in a nested block surfaces as
//! `StatementOutcome::Return` and unwinds through every enclosing block. It
//! is never an error, so `try/catch` cannot intercept it.

pub mod ai;
pub mod control_flow;
pub mod observe;
pub mod records;

use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::evaluator::evaluate_at;
use crate::explain::{build_expression_explain_trace, AssignmentKind, ExplainCollector, ExplainInput};
use crate::trace::ExecutionStep;
use weft::ir::{Assignable, Expression, Span, Statement};
use weft::{RuntimeError, RuntimeResult, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutcome {
    Continue,
    Return(Value),
}

impl Engine {
    pub fn execute_statement(
        &self,
        ctx: &mut ExecutionContext,
        stmt: &Statement,
    ) -> RuntimeResult<StatementOutcome> {
        let span = stmt.span();
        self.dispatch_statement(ctx, stmt).map_err(|e| e.at(span))
    }

    /// Run statements in order, stopping at the first `Return`.
    pub fn execute_block(
        &self,
        ctx: &mut ExecutionContext,
        body: &[Statement],
    ) -> RuntimeResult<StatementOutcome> {
        for stmt in body {
            if let StatementOutcome::Return(value) = self.execute_statement(ctx, stmt)? {
                return Ok(StatementOutcome::Return(value));
            }
        }
        Ok(StatementOutcome::Continue)
    }

    fn dispatch_statement(
        &self,
        ctx: &mut ExecutionContext,
        stmt: &Statement,
    ) -> RuntimeResult<StatementOutcome> {
        match stmt {
            Statement::Let {
                name,
                expression,
                constant,
                span,
            } => self.execute_let(ctx, name, expression, *constant, *span)?,
            Statement::Set {
                target,
                expression,
                span,
            } => self.execute_set(ctx, target, expression, *span)?,
            Statement::Return { expression, span } => {
                let value = evaluate_at(self, ctx, expression, *span)?;
                ctx.record_step(ExecutionStep::new("statement_return", "returned a value", *span));
                return Ok(StatementOutcome::Return(value));
            }
            Statement::If {
                condition,
                then_body,
                else_body,
                span,
            } => return self.execute_if(ctx, condition, then_body, else_body, *span),
            Statement::Repeat { count, body, span } => return self.execute_repeat(ctx, count, body, *span),
            Statement::RepeatWhile {
                condition,
                limit,
                body,
                span,
            } => return self.execute_repeat_while(ctx, condition, *limit, body, *span),
            Statement::ForEach {
                name,
                iterable,
                body,
                span,
            } => return self.execute_for_each(ctx, name, iterable, body, *span),
            Statement::Match {
                subject,
                cases,
                otherwise,
                span,
            } => return self.execute_match(ctx, subject, cases, otherwise.as_deref(), *span),
            Statement::TryCatch {
                try_body,
                catch_var,
                catch_body,
                span,
            } => return self.execute_try_catch(ctx, try_body, catch_var, catch_body, *span),
            Statement::AskAi {
                ai_name,
                input,
                target,
                span,
            } => self.execute_ask_ai(ctx, ai_name, input, target, *span)?,
            Statement::RunAgent {
                agent_name,
                input,
                target,
                span,
            } => self.execute_run_agent(ctx, agent_name, input, target, *span)?,
            Statement::RunAgentsParallel { runs, target, span } => {
                self.execute_run_agents_parallel(ctx, runs, target, *span)?
            }
            Statement::Parallel { tasks, target, span } => {
                self.execute_parallel(ctx, tasks, target.as_deref(), *span)?
            }
            Statement::Save { record, values, span } => {
                self.execute_save(ctx, record, values.as_ref(), *span)?
            }
            Statement::Create {
                record,
                values,
                target,
                span,
            } => self.execute_create(ctx, record, values, target, *span)?,
            Statement::Find {
                record,
                filter,
                target,
                span,
            } => self.execute_find(ctx, record, filter, target, *span)?,
            Statement::Update {
                record,
                filter,
                updates,
                span,
            } => self.execute_update(ctx, record, filter, updates, *span)?,
            Statement::Delete { record, filter, span } => self.execute_delete(ctx, record, filter, *span)?,
            Statement::ThemeChange { value, span } => self.execute_theme_change(ctx, value, *span)?,
            Statement::Log {
                level,
                message,
                fields,
                span,
            } => self.execute_log(ctx, *level, message, fields.as_ref(), *span)?,
            Statement::Metric {
                kind,
                operation,
                name,
                value,
                labels,
                span,
            } => self.execute_metric(ctx, *kind, *operation, name, value.as_ref(), labels.as_ref(), *span)?,
            Statement::EnqueueJob {
                job_name,
                input,
                schedule,
                span,
            } => self.execute_enqueue_job(ctx, job_name, input.as_ref(), schedule.as_ref(), *span)?,
            Statement::AdvanceTime { amount, span } => self.execute_advance_time(ctx, amount, *span)?,
        }
        Ok(StatementOutcome::Continue)
    }

    /// Evaluate the right-hand side of an assignment, with an explain trace
    /// when the line is one of the tracked calculation assignments.
    fn evaluate_assignment(
        &self,
        ctx: &mut ExecutionContext,
        target: String,
        expression: &Expression,
        span: Span,
        kind: AssignmentKind,
    ) -> RuntimeResult<Value> {
        let end = span
            .line
            .and_then(|line| ctx.calc_assignment_index.get(&line).copied());
        let Some(end) = end else {
            return evaluate_at(self, ctx, expression, span);
        };
        let mut collector = ExplainCollector::new();
        let result = self
            .evaluate_explained(ctx, expression, Some(&mut collector))
            .map_err(|e| e.at(span))?;
        let trace = build_expression_explain_trace(
            ExplainInput {
                target,
                expression,
                result: &result,
                start: span,
                end,
                flow_name: ctx.current_flow_name().map(str::to_string),
                kind,
            },
            collector,
        );
        ctx.push_trace(trace);
        Ok(result)
    }

    fn execute_let(
        &self,
        ctx: &mut ExecutionContext,
        name: &str,
        expression: &Expression,
        constant: bool,
        span: Span,
    ) -> RuntimeResult<()> {
        if ctx.constants.contains(name) {
            return Err(RuntimeError::domain(format!("Cannot set constant '{}'", name)));
        }
        let value = self.evaluate_assignment(ctx, name.to_string(), expression, span, AssignmentKind::Let)?;
        ctx.locals.insert(name.to_string(), value.clone());
        if constant {
            ctx.constants.insert(name.to_string());
        }
        ctx.last_value = value;
        ctx.record_step(ExecutionStep::new("statement_let", format!("set local {}", name), span));
        Ok(())
    }

    fn execute_set(
        &self,
        ctx: &mut ExecutionContext,
        target: &Assignable,
        expression: &Expression,
        span: Span,
    ) -> RuntimeResult<()> {
        match target {
            Assignable::Local(name) => {
                if ctx.constants.contains(name) {
                    return Err(RuntimeError::domain(format!("Cannot set constant '{}'", name)));
                }
                if !ctx.locals.contains_key(name) {
                    return Err(RuntimeError::domain(format!("Cannot set undeclared variable '{}'", name)));
                }
            }
            Assignable::State(_) => {
                if ctx.parallel_mode {
                    return Err(RuntimeError::fatal("Parallel tasks cannot change state"));
                }
                if ctx.in_function() {
                    return Err(RuntimeError::fatal("Functions cannot change state"));
                }
            }
        }

        let value = self.evaluate_assignment(ctx, target.to_string(), expression, span, AssignmentKind::Set)?;
        match target {
            Assignable::Local(name) => {
                ctx.locals.insert(name.clone(), value.clone());
            }
            Assignable::State(path) => ctx.set_state_path(path, value.clone(), span)?,
        }
        ctx.last_value = value;
        ctx.record_step(ExecutionStep::new("statement_set", format!("set {}", target), span));
        Ok(())
    }

    fn execute_try_catch(
        &self,
        ctx: &mut ExecutionContext,
        try_body: &[Statement],
        catch_var: &str,
        catch_body: &[Statement],
        span: Span,
    ) -> RuntimeResult<StatementOutcome> {
        ctx.record_step(ExecutionStep::new("decision_try", "try block", span));
        match self.execute_block(ctx, try_body) {
            Ok(outcome) => {
                ctx.record_step(ExecutionStep::new("catch_skipped", "catch block skipped", span).because("no error"));
                Ok(outcome)
            }
            Err(err) if err.is_catchable() => {
                log::debug!("Caught error into '{}': {}", catch_var, err);
                ctx.record_step(
                    ExecutionStep::new("catch_taken", "catch block taken", span).because("error raised"),
                );
                ctx.locals.insert(catch_var.to_string(), err.to_value());
                self.execute_block(ctx, catch_body)
            }
            Err(err) => Err(err),
        }
    }
}
