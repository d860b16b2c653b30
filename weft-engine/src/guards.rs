//! `requires` guards on flow entry.

use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::trace::TraceEvent;
use weft::ir::{Expression, Span};
use weft::runtime::error_reporting::build_guidance_message;
use weft::{RuntimeError, RuntimeResult, Value};

fn requires_type_message(subject: &str, value: &Value) -> String {
    build_guidance_message(
        &format!("{} requires a boolean condition.", subject),
        &format!(
            "The requires expression evaluated to {}, not true or false.",
            value.kind_name()
        ),
        "Use a comparison so the requires clause evaluates to true or false.",
        "requires identity.role is \"admin\"",
    )
}

fn requires_failed_message(subject: &str) -> String {
    build_guidance_message(
        &format!("{} access is not permitted.", subject),
        "The requires condition evaluated to false.",
        "Provide an identity that satisfies the requirement or update the requires clause.",
        "requires identity.role is \"admin\"",
    )
}

fn record_check(ctx: &mut ExecutionContext, subject: &str, outcome: &str, reason: Option<&str>) {
    ctx.push_trace(TraceEvent::AuthorizationCheck {
        subject: subject.to_string(),
        outcome: outcome.to_string(),
        reason: reason.map(str::to_string),
    });
}

impl Engine {
    /// Evaluate a `requires` guard. No guard means access is open.
    ///
    /// Evaluation errors propagate unchanged and leave no trace; a
    /// non-boolean result or `false` records the check and fails.
    pub fn enforce_requires(
        &self,
        ctx: &mut ExecutionContext,
        requires: Option<&Expression>,
        subject: &str,
        span: Span,
    ) -> RuntimeResult<()> {
        let Some(expr) = requires else {
            return Ok(());
        };
        let result = self.evaluate(ctx, expr).map_err(|e| e.at(span))?;
        match result {
            Value::Boolean(true) => {
                record_check(ctx, subject, "allowed", None);
                Ok(())
            }
            Value::Boolean(false) => {
                record_check(ctx, subject, "denied", Some("access_denied"));
                log::info!("{} denied by requires guard", subject);
                Err(RuntimeError::domain(requires_failed_message(subject))
                    .at(span)
                    .with_detail("category", "policy")
                    .with_detail("reason_code", "access_denied"))
            }
            other => {
                record_check(ctx, subject, "invalid", None);
                Err(RuntimeError::domain(requires_type_message(subject, &other)).at(span))
            }
        }
    }
}
