//! Theme, log, metric and job statements.

use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::evaluator::evaluate_at;
use crate::scheduler::{non_negative_int, require_non_negative_int};
use crate::trace::{ExecutionStep, TraceEvent};
use itertools::Itertools;
use weft::ir::{Expression, JobSchedule, LogLevel, MetricKind, MetricOp, Span};
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

fn optional_object(
    engine: &Engine,
    ctx: &mut ExecutionContext,
    expr: Option<&Expression>,
    message: &str,
    span: Span,
) -> RuntimeResult<Option<ValueMap>> {
    let Some(expr) = expr else {
        return Ok(None);
    };
    match evaluate_at(engine, ctx, expr, span)? {
        Value::Map(map) => Ok(Some(map)),
        _ => Err(RuntimeError::domain(message).at(span)),
    }
}

impl Engine {
    pub(crate) fn execute_theme_change(
        &self,
        ctx: &mut ExecutionContext,
        value: &str,
        span: Span,
    ) -> RuntimeResult<()> {
        if ctx.parallel_mode {
            return Err(RuntimeError::fatal("Parallel tasks cannot change theme").at(span));
        }
        if ctx.in_function() {
            return Err(RuntimeError::fatal("Functions cannot change theme").at(span));
        }
        if !ctx.config.ui.themes.iter().any(|t| t == value) {
            let allowed = ctx.config.ui.themes.iter().sorted().join(", ");
            return Err(RuntimeError::domain(format!("Theme must be one of: {}", allowed)).at(span));
        }
        ctx.runtime_theme = Some(value.to_string());
        ctx.push_trace(TraceEvent::ThemeChange {
            value: value.to_string(),
        });
        ctx.record_step(ExecutionStep::new("statement_theme", format!("set theme {}", value), span));
        ctx.last_value = Value::text(value);
        Ok(())
    }

    pub(crate) fn execute_log(
        &self,
        ctx: &mut ExecutionContext,
        level: LogLevel,
        message: &Expression,
        fields: Option<&Expression>,
        span: Span,
    ) -> RuntimeResult<()> {
        let message = evaluate_at(self, ctx, message, span)?;
        let fields = optional_object(self, ctx, fields, "Log fields must be an object", span)?;
        ctx.observability.record_log(level, &message, fields.as_ref());
        ctx.record_step(ExecutionStep::new("statement_log", format!("log {}", level), span));
        ctx.last_value = message;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_metric(
        &self,
        ctx: &mut ExecutionContext,
        kind: MetricKind,
        operation: MetricOp,
        name: &str,
        value: Option<&Expression>,
        labels: Option<&Expression>,
        span: Span,
    ) -> RuntimeResult<()> {
        let labels = optional_object(self, ctx, labels, "Metric labels must be an object", span)?;
        let value = match value {
            Some(expr) => evaluate_at(self, ctx, expr, span)?,
            None if operation == MetricOp::Increment => Value::Integer(1),
            None => Value::Null,
        };
        let labels = labels.as_ref();
        match (kind, operation) {
            (MetricKind::Counter, MetricOp::Increment | MetricOp::Add | MetricOp::Set) => {
                let amount = value
                    .as_f64()
                    .ok_or_else(|| RuntimeError::fatal("Metric value must be a number").at(span))?;
                match operation {
                    MetricOp::Increment => ctx.observability.counter_increment(name, amount, labels),
                    MetricOp::Add => ctx.observability.counter_add(name, amount, labels),
                    _ => ctx.observability.counter_set(name, amount, labels),
                }
            }
            (MetricKind::Timing, MetricOp::Record) => {
                let duration = non_negative_int(&value).ok_or_else(|| {
                    RuntimeError::fatal("Timing value must be a non-negative integer").at(span)
                })?;
                ctx.observability.record_timing(name, duration, labels);
            }
            (kind, operation) => {
                return Err(RuntimeError::fatal(format!(
                    "Metric operation '{}' is not valid for a {}",
                    operation, kind
                ))
                .at(span))
            }
        }
        ctx.record_step(
            ExecutionStep::new("statement_metric", format!("metric {} {}", kind, operation), span)
                .because(name.to_string()),
        );
        ctx.last_value = value;
        Ok(())
    }

    pub(crate) fn execute_enqueue_job(
        &self,
        ctx: &mut ExecutionContext,
        job_name: &str,
        input: Option<&Expression>,
        schedule: Option<&JobSchedule>,
        span: Span,
    ) -> RuntimeResult<()> {
        let payload = match input {
            Some(expr) => evaluate_at(self, ctx, expr, span)?,
            None => Value::Map(ValueMap::new()),
        };
        match schedule {
            Some(schedule) => {
                let when = evaluate_at(self, ctx, &schedule.value, span)?;
                let due_at = ctx
                    .jobs
                    .schedule(job_name, payload.clone(), schedule.kind, &when, span)?;
                ctx.record_step(ExecutionStep::new(
                    "statement_enqueue_job",
                    format!("scheduled job {} at {}", job_name, due_at),
                    span,
                ));
            }
            None => {
                ctx.jobs.enqueue(job_name, payload.clone());
                ctx.record_step(ExecutionStep::new(
                    "statement_enqueue_job",
                    format!("enqueued job {}", job_name),
                    span,
                ));
            }
        }
        ctx.last_value = payload;
        Ok(())
    }

    pub(crate) fn execute_advance_time(
        &self,
        ctx: &mut ExecutionContext,
        amount: &Expression,
        span: Span,
    ) -> RuntimeResult<()> {
        let value = evaluate_at(self, ctx, amount, span)?;
        let ticks = require_non_negative_int(&value, "Advance time amount", span)?;
        let released = ctx.jobs.advance(ticks);
        log::debug!("Logical clock at {}, released {} job(s)", ctx.jobs.now(), released);
        ctx.record_step(
            ExecutionStep::new("statement_advance_time", format!("advanced time by {}", ticks), span)
                .because(format!("{} job(s) released", released)),
        );
        ctx.last_value = Value::Integer(ctx.jobs.now() as i64);
        Ok(())
    }
}
