//! Mutation policy gate
//!
//! Decides whether a record mutation may happen right now. Order of checks:
//! a requires rule must exist, audit-required mode demands `audited`, the
//! rule must evaluate (with the synthetic `mutation` local bound) to a
//! boolean, and that boolean must be true. The gate never touches the store.

use crate::context::{ExecutionContext, LocalBindingGuard};
use crate::engine::Engine;
use serde::Serialize;
use weft::ir::{Expression, Program, Span};
use weft::runtime::error_reporting::{build_guidance_message, first_line, parse_guidance_message};
use weft::{RuntimeError, RuntimeResult, Value};

pub const MUTATION_LOCAL: &str = "mutation";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationDecision {
    pub allowed: bool,
    pub reason_code: Option<String>,
    pub message: Option<String>,
    pub fix_hint: Option<String>,
    pub error_message: Option<String>,
}

impl MutationDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason_code: None,
            message: None,
            fix_hint: None,
            error_message: None,
        }
    }

    fn block(reason_code: &str, message: String, fix_hint: &str, error_message: String) -> Self {
        Self {
            allowed: false,
            reason_code: Some(reason_code.to_string()),
            message: Some(message),
            fix_hint: Some(fix_hint.to_string()),
            error_message: Some(error_message),
        }
    }

    /// Domain error raised by a statement whose mutation was denied.
    pub fn to_error(&self, span: Span) -> RuntimeError {
        let text = self
            .error_message
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Mutation blocked.".to_string());
        let mut err = RuntimeError::domain(text).at(span);
        if let Some(reason) = &self.reason_code {
            err = err.with_detail("policy_reason", reason.clone());
        }
        err
    }
}

pub fn requires_mentions_mutation(expr: Option<&Expression>) -> bool {
    expr.map(Expression::mentions_mutation).unwrap_or(false)
}

fn missing_requires(subject: &str) -> MutationDecision {
    let fix = "Add a requires clause to the page or flow header.";
    MutationDecision::block(
        "policy_missing",
        format!("{} is missing a requires rule for mutations.", subject),
        fix,
        build_guidance_message(
            "Mutation blocked by access control.",
            "Mutating flows and forms must declare a requires rule.",
            fix,
            "flow \"update_order\": requires identity.role is \"admin\"",
        ),
    )
}

fn audit_required(subject: &str) -> MutationDecision {
    let fix = "Mark the mutation as audited or disable audit-required mode.";
    MutationDecision::block(
        "audit_required",
        format!("{} is missing audited while audit-required is enabled.", subject),
        fix,
        build_guidance_message(
            "Mutation blocked by audit policy.",
            "Audit-required mode enforces audited mutations.",
            fix,
            "flow \"update_order\": audited",
        ),
    )
}

fn policy_invalid(subject: &str, err: &RuntimeError) -> MutationDecision {
    let text = err.message();
    let parsed = parse_guidance_message(&text);
    let message = parsed
        .what
        .or_else(|| first_line(&text))
        .unwrap_or_else(|| format!("{} requires a valid access rule.", subject));
    let fix = parsed
        .fix
        .unwrap_or_else(|| "Fix the requires clause so it can be evaluated.".to_string());
    MutationDecision {
        allowed: false,
        reason_code: Some("policy_invalid".to_string()),
        message: Some(message),
        fix_hint: Some(fix),
        error_message: Some(text),
    }
}

fn not_boolean(subject: &str, value: &Value) -> MutationDecision {
    let fix = "Use a comparison so the requires clause evaluates to true or false.";
    MutationDecision::block(
        "policy_invalid",
        format!("{} requires a boolean condition.", subject),
        fix,
        build_guidance_message(
            &format!("{} requires a boolean condition.", subject),
            &format!(
                "The requires expression evaluated to {}, not true or false.",
                value.kind_name()
            ),
            fix,
            "requires identity.role is \"admin\"",
        ),
    )
}

fn access_denied(subject: &str) -> MutationDecision {
    let fix = "Provide an identity that satisfies the requirement or update the requires rule.";
    MutationDecision::block(
        "access_denied",
        format!("{} access is not permitted.", subject),
        fix,
        build_guidance_message(
            &format!("{} access is not permitted.", subject),
            "The requires condition evaluated to false.",
            fix,
            "requires identity.role is \"admin\"",
        ),
    )
}

impl Engine {
    /// Gate a mutation against the current flow's rule.
    pub fn evaluate_mutation_policy(
        &self,
        ctx: &mut ExecutionContext,
        action: &str,
        record: &str,
        span: Span,
    ) -> RuntimeResult<MutationDecision> {
        let flow = ctx.flow.clone();
        let subject = format!(
            "flow \"{}\"",
            flow.as_deref().map(|f| f.name.as_str()).unwrap_or("flow")
        );
        let requires = flow.as_deref().and_then(|f| f.requires.as_ref());
        let audited = flow.as_deref().map(|f| f.audited).unwrap_or(false);
        let decision =
            self.evaluate_mutation_policy_for_rule(ctx, action, record, &subject, requires, audited)?;
        if !decision.allowed {
            log::debug!(
                "Mutation {} {} denied at line {:?}: {:?}",
                action,
                record,
                span.line,
                decision.reason_code
            );
        }
        Ok(decision)
    }

    /// Gate a mutation against a page's rule (UI form writes).
    pub fn evaluate_page_mutation_policy(
        &self,
        ctx: &mut ExecutionContext,
        page_name: &str,
        action: &str,
        record: &str,
    ) -> RuntimeResult<MutationDecision> {
        let program = ctx.program.clone();
        let page = program.pages.get(page_name).ok_or_else(|| {
            RuntimeError::domain(format!("Unknown page \"{}\".", page_name))
        })?;
        let subject = format!("page \"{}\"", page.name);
        self.evaluate_mutation_policy_for_rule(
            ctx,
            action,
            record,
            &subject,
            page.requires.as_ref(),
            page.audited,
        )
    }

    /// Shared rule evaluation for flows and pages. Only fatal and internal
    /// failures escape as errors; everything else becomes a decision.
    pub fn evaluate_mutation_policy_for_rule(
        &self,
        ctx: &mut ExecutionContext,
        action: &str,
        record: &str,
        subject: &str,
        requires: Option<&Expression>,
        audited: bool,
    ) -> RuntimeResult<MutationDecision> {
        let Some(requires) = requires else {
            return Ok(missing_requires(subject));
        };
        if ctx.config.policy.audit_required && !audited {
            return Ok(audit_required(subject));
        }
        let mutation = Value::map([
            ("action", Value::text(action)),
            ("record", Value::text(record)),
        ]);
        let result = {
            let mut scoped = LocalBindingGuard::bind(ctx, MUTATION_LOCAL, mutation);
            self.evaluate(&mut scoped, requires)
        };
        let value = match result {
            Ok(value) => value,
            Err(err) if err.is_catchable() => return Ok(policy_invalid(subject, &err)),
            Err(err) => return Err(err),
        };
        Ok(match value {
            Value::Boolean(true) => MutationDecision::allow(),
            Value::Boolean(false) => access_denied(subject),
            other => not_boolean(subject, &other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyWarning {
    pub code: String,
    pub message: String,
    pub fix: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

/// Static lint: mutating flows without `requires`, and without `audited`
/// when audit-required mode is on; pages with a form but no `requires`.
pub fn mutation_policy_warnings(program: &Program, audit_required: bool) -> Vec<PolicyWarning> {
    let mut flows: Vec<_> = program.flows.values().filter(|f| f.mutates()).collect();
    flows.sort_by(|a, b| a.name.cmp(&b.name));
    let mut warnings = Vec::new();
    for flow in flows {
        if flow.requires.is_none() {
            warnings.push(PolicyWarning {
                code: "requires.missing".to_string(),
                message: format!("Flow \"{}\" mutates data without requires.", flow.name),
                fix: "Add a requires clause to the flow header.".to_string(),
                line: flow.span.line,
                column: flow.span.column,
            });
        }
        if audit_required && !flow.audited {
            warnings.push(PolicyWarning {
                code: "audit.required".to_string(),
                message: format!("Flow \"{}\" mutates data without audited.", flow.name),
                fix: "Add audited to the flow header or disable audit-required mode.".to_string(),
                line: flow.span.line,
                column: flow.span.column,
            });
        }
    }
    let mut pages: Vec<_> = program
        .pages
        .values()
        .filter(|p| p.has_form && p.requires.is_none())
        .collect();
    pages.sort_by(|a, b| a.name.cmp(&b.name));
    for page in pages {
        warnings.push(PolicyWarning {
            code: "requires.missing".to_string(),
            message: format!("Page \"{}\" has a form without requires.", page.name),
            fix: "Add a requires clause to the page header.".to_string(),
            line: None,
            column: None,
        });
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Arc;
    use weft::ir::{CompareOp, Flow, Page, Statement};

    fn admin_only() -> Expression {
        Expression::compare(
            CompareOp::Eq,
            Expression::attr("identity", &["role"]),
            Expression::literal("admin"),
        )
    }

    fn ctx_with_flow(flow: Flow, config: EngineConfig) -> ExecutionContext {
        let flow = Arc::new(flow);
        let program = Program::new();
        let mut ctx = ExecutionContext::new(Arc::new(program), config);
        ctx.flow = Some(flow);
        ctx
    }

    #[test]
    fn test_missing_requires_is_policy_missing() {
        let engine = Engine::new();
        let mut ctx = ctx_with_flow(Flow::new("archive", vec![]), EngineConfig::default());
        let decision = engine
            .evaluate_mutation_policy(&mut ctx, "save", "Order", Span::unknown())
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason_code.as_deref(), Some("policy_missing"));
        assert_eq!(
            decision.message.as_deref(),
            Some("flow \"archive\" is missing a requires rule for mutations.")
        );
    }

    #[test]
    fn test_audit_required_checked_before_guard() {
        let engine = Engine::new();
        let mut config = EngineConfig::default();
        config.policy.audit_required = true;
        let mut ctx = ctx_with_flow(Flow::new("archive", vec![]).requires(admin_only()), config);
        let decision = engine
            .evaluate_mutation_policy(&mut ctx, "save", "Order", Span::unknown())
            .unwrap();
        assert_eq!(decision.reason_code.as_deref(), Some("audit_required"));
    }

    #[test]
    fn test_guard_outcomes() {
        let engine = Engine::new();
        let mut ctx = ctx_with_flow(
            Flow::new("archive", vec![]).requires(admin_only()),
            EngineConfig::default(),
        );
        let decision = engine
            .evaluate_mutation_policy(&mut ctx, "save", "Order", Span::unknown())
            .unwrap();
        assert_eq!(decision.reason_code.as_deref(), Some("policy_invalid"));
        assert_eq!(decision.message.as_deref(), Some("Identity is missing 'role'."));

        ctx.identity.insert("role".to_string(), Value::text("viewer"));
        let decision = engine
            .evaluate_mutation_policy(&mut ctx, "save", "Order", Span::unknown())
            .unwrap();
        assert_eq!(decision.reason_code.as_deref(), Some("access_denied"));
        assert_eq!(
            decision.message.as_deref(),
            Some("flow \"archive\" access is not permitted.")
        );

        ctx.identity.insert("role".to_string(), Value::text("admin"));
        let decision = engine
            .evaluate_mutation_policy(&mut ctx, "save", "Order", Span::unknown())
            .unwrap();
        assert!(decision.allowed);
    }

    #[test]
    fn test_non_boolean_guard() {
        let engine = Engine::new();
        let mut ctx = ctx_with_flow(
            Flow::new("archive", vec![]).requires(Expression::literal("yes")),
            EngineConfig::default(),
        );
        let decision = engine
            .evaluate_mutation_policy(&mut ctx, "save", "Order", Span::unknown())
            .unwrap();
        assert_eq!(decision.reason_code.as_deref(), Some("policy_invalid"));
        assert_eq!(
            decision.message.as_deref(),
            Some("flow \"archive\" requires a boolean condition.")
        );
    }

    #[test]
    fn test_mutation_local_visible_only_during_guard() {
        let engine = Engine::new();
        let guard = Expression::compare(
            CompareOp::Ne,
            Expression::attr("mutation", &["action"]),
            Expression::literal("delete"),
        );
        let mut ctx = ctx_with_flow(Flow::new("tidy", vec![]).requires(guard), EngineConfig::default());
        assert!(engine
            .evaluate_mutation_policy(&mut ctx, "save", "Order", Span::unknown())
            .unwrap()
            .allowed);
        let denied = engine
            .evaluate_mutation_policy(&mut ctx, "delete", "Order", Span::unknown())
            .unwrap();
        assert_eq!(denied.reason_code.as_deref(), Some("access_denied"));
        assert!(!ctx.locals.contains_key(MUTATION_LOCAL));
    }

    #[test]
    fn test_page_subject() {
        let engine = Engine::new();
        let program = Program::new().with_page(Page {
            name: "orders".to_string(),
            requires: None,
            audited: false,
            has_form: true,
        });
        let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
        let decision = engine
            .evaluate_page_mutation_policy(&mut ctx, "orders", "create", "Order")
            .unwrap();
        assert_eq!(
            decision.message.as_deref(),
            Some("page \"orders\" is missing a requires rule for mutations.")
        );
    }

    #[test]
    fn test_static_warnings() {
        let program = Program::new()
            .with_flow(Flow::new("write", vec![Statement::save("Order", None)]))
            .with_flow(Flow::new("read", vec![]));
        let warnings = mutation_policy_warnings(&program, true);
        let codes: Vec<&str> = warnings.iter().map(|w| w.code.as_str()).collect();
        assert_eq!(codes, vec!["requires.missing", "audit.required"]);
    }

    #[test]
    fn test_only_pages_with_forms_warn() {
        let page = |name: &str, has_form: bool| Page {
            name: name.to_string(),
            requires: None,
            audited: false,
            has_form,
        };
        let program = Program::new()
            .with_page(page("about", false))
            .with_page(page("signup", true));
        let warnings = mutation_policy_warnings(&program, false);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].message, "Page \"signup\" has a form without requires.");
    }
}
