//! Branches, loops, `match` and parallel blocks.

use crate::context::{ExecutionContext, ParallelModeGuard};
use crate::engine::Engine;
use crate::evaluator::evaluate_at;
use crate::interpreter::StatementOutcome;
use crate::trace::ExecutionStep;
use weft::ir::{Expression, MatchCase, ParallelTask, Span, Statement};
use weft::runtime::error_reporting::build_guidance_message;
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

fn require_condition(value: Value, span: Span) -> RuntimeResult<bool> {
    value.as_bool().ok_or_else(|| {
        RuntimeError::domain(build_guidance_message(
            "Condition must evaluate to a boolean.",
            &format!("The condition evaluated to {}.", value.kind_name()),
            "Use a comparison so the condition is true or false.",
            "if total is greater than 10:",
        ))
        .at(span)
    })
}

impl Engine {
    pub(crate) fn execute_if(
        &self,
        ctx: &mut ExecutionContext,
        condition: &Expression,
        then_body: &[Statement],
        else_body: &[Statement],
        span: Span,
    ) -> RuntimeResult<StatementOutcome> {
        let value = evaluate_at(self, ctx, condition, span)?;
        let taken = require_condition(value, span)?;
        let (what, body) = if taken {
            ("took then branch", then_body)
        } else {
            ("took else branch", else_body)
        };
        ctx.record_step(
            ExecutionStep::new("statement_if", what, span).because(format!("condition was {}", taken)),
        );
        self.execute_block(ctx, body)
    }

    pub(crate) fn execute_repeat(
        &self,
        ctx: &mut ExecutionContext,
        count: &Expression,
        body: &[Statement],
        span: Span,
    ) -> RuntimeResult<StatementOutcome> {
        let times = match evaluate_at(self, ctx, count, span)? {
            Value::Integer(n) if n < 0 => {
                return Err(RuntimeError::domain("Repeat count cannot be negative").at(span))
            }
            Value::Integer(n) => n,
            _ => return Err(RuntimeError::domain("Repeat count must be an integer").at(span)),
        };
        ctx.record_step(ExecutionStep::new("statement_repeat", format!("repeat {} times", times), span));
        for _ in 0..times {
            if let StatementOutcome::Return(value) = self.execute_block(ctx, body)? {
                return Ok(StatementOutcome::Return(value));
            }
        }
        Ok(StatementOutcome::Continue)
    }

    pub(crate) fn execute_repeat_while(
        &self,
        ctx: &mut ExecutionContext,
        condition: &Expression,
        limit: u32,
        body: &[Statement],
        span: Span,
    ) -> RuntimeResult<StatementOutcome> {
        let mut iterations: u32 = 0;
        loop {
            let value = evaluate_at(self, ctx, condition, span)?;
            if !require_condition(value, span)? {
                break;
            }
            if iterations >= limit {
                return Err(RuntimeError::domain(build_guidance_message(
                    &format!("Repeat while exceeded its limit of {} iterations.", limit),
                    "The loop condition was still true when the limit was reached.",
                    "Make sure the loop body moves the condition towards false or raise the limit.",
                    "repeat while count is less than 10 limit 20:",
                ))
                .at(span));
            }
            iterations += 1;
            if let StatementOutcome::Return(value) = self.execute_block(ctx, body)? {
                return Ok(StatementOutcome::Return(value));
            }
        }
        ctx.record_step(
            ExecutionStep::new("statement_repeat_while", format!("repeated {} times", iterations), span)
                .because("condition became false"),
        );
        Ok(StatementOutcome::Continue)
    }

    pub(crate) fn execute_for_each(
        &self,
        ctx: &mut ExecutionContext,
        name: &str,
        iterable: &Expression,
        body: &[Statement],
        span: Span,
    ) -> RuntimeResult<StatementOutcome> {
        let items = match evaluate_at(self, ctx, iterable, span)? {
            Value::List(items) => items,
            other => {
                return Err(RuntimeError::domain(build_guidance_message(
                    "For-each expects a list.",
                    &format!("The value to iterate is {}.", other.kind_name()),
                    "Iterate over a list value.",
                    "for each item in order.items:",
                ))
                .at(span))
            }
        };
        ctx.record_step(ExecutionStep::new("statement_for_each", format!("for each {} ({} items)", name, items.len()), span));
        for item in items {
            ctx.locals.insert(name.to_string(), item);
            if let StatementOutcome::Return(value) = self.execute_block(ctx, body)? {
                return Ok(StatementOutcome::Return(value));
            }
        }
        Ok(StatementOutcome::Continue)
    }

    pub(crate) fn execute_match(
        &self,
        ctx: &mut ExecutionContext,
        subject: &Expression,
        cases: &[MatchCase],
        otherwise: Option<&[Statement]>,
        span: Span,
    ) -> RuntimeResult<StatementOutcome> {
        let subject_value = evaluate_at(self, ctx, subject, span)?;
        for (index, case) in cases.iter().enumerate() {
            let pattern = evaluate_at(self, ctx, &case.pattern, span)?;
            if subject_value.loose_eq(&pattern) {
                ctx.record_step(
                    ExecutionStep::new("statement_match", format!("matched case {}", index + 1), span)
                        .because(format!("subject equals {}", case.pattern)),
                );
                return self.execute_block(ctx, &case.body);
            }
        }
        match otherwise {
            Some(body) => {
                ctx.record_step(
                    ExecutionStep::new("statement_match", "took otherwise", span).because("no case matched"),
                );
                self.execute_block(ctx, body)
            }
            None => Ok(StatementOutcome::Continue),
        }
    }

    /// Tasks run one after the other, each against a copy of the locals and
    /// with `parallel_mode` on. A `return` inside a task ends only that task.
    pub(crate) fn execute_parallel(
        &self,
        ctx: &mut ExecutionContext,
        tasks: &[ParallelTask],
        target: Option<&str>,
        span: Span,
    ) -> RuntimeResult<()> {
        let mut results = ValueMap::new();
        for task in tasks {
            let value = {
                let mut scope = ParallelModeGuard::enter(ctx);
                let saved_last = std::mem::take(&mut scope.last_value);
                let outcome = self.execute_block(&mut scope, &task.body);
                let last = std::mem::replace(&mut scope.last_value, saved_last);
                match outcome? {
                    StatementOutcome::Return(value) => value,
                    StatementOutcome::Continue => last,
                }
            };
            results.insert(task.name.clone(), value);
        }
        ctx.record_step(
            ExecutionStep::new("statement_parallel", format!("ran {} parallel tasks", tasks.len()), span),
        );
        let results = Value::Map(results);
        if let Some(target) = target {
            ctx.locals.insert(target.to_string(), results.clone());
        }
        ctx.last_value = results;
        Ok(())
    }
}
