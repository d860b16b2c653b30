//! Expression evaluation.
//!
//! The interpreter, the policy gate and the composer only depend on the
//! `ExpressionEvaluator` trait. `BasicEvaluator` covers the closed expression
//! set: arithmetic on numbers only, boolean operators on booleans only,
//! ordering comparisons on numbers only, and equality across everything.

use crate::context::ExecutionContext;
use crate::engine::Engine;
use crate::explain::ExplainCollector;
use crate::trace::ExecutionStep;
use std::cmp::Ordering;
use std::fmt;
use weft::ir::{BinaryOp, CallArg, CompareOp, Expression, Span, UnaryOp};
use weft::runtime::error_reporting::{build_guidance_message, closest_match};
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

pub trait ExpressionEvaluator: fmt::Debug + Send + Sync {
    fn evaluate(
        &self,
        engine: &Engine,
        ctx: &mut ExecutionContext,
        expr: &Expression,
        collector: Option<&mut ExplainCollector>,
    ) -> RuntimeResult<Value>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

fn unknown_variable(name: &str, ctx: &ExecutionContext) -> RuntimeError {
    let hint = closest_match(name, ctx.locals.keys(), 0.6)
        .map(|m| format!(" Did you mean \"{}\"?", m))
        .unwrap_or_default();
    RuntimeError::domain(format!("Unknown variable '{}'.{}", name, hint))
}

fn identity_attribute_message(attr: &str) -> String {
    build_guidance_message(
        &format!("Identity is missing '{}'.", attr),
        "The app referenced identity data that was not provided.",
        "Provide the field in the caller identity.",
        "identity = { email = \"dev@example.com\" }",
    )
}

fn arithmetic_message(op: &str, left: &Value, right: Option<&Value>) -> String {
    match right {
        None => build_guidance_message(
            &format!("Unary '{}' requires a number.", op),
            &format!(
                "The operand is {}, but arithmetic only works on numbers.",
                left.kind_name()
            ),
            "Use a numeric value or remove the operator.",
            "let total is -10.5",
        ),
        Some(right) => build_guidance_message(
            &format!(
                "Cannot apply '{}' to {} and {}.",
                op,
                left.kind_name(),
                right.kind_name()
            ),
            "Arithmetic operators only work on numbers.",
            "Convert both values to numbers or remove the operator.",
            "let total is 10.5 + 2.25",
        ),
    }
}

fn boolean_operand_message(op: &str, value: &Value) -> String {
    build_guidance_message(
        &format!("Operator '{}' requires a boolean.", op),
        &format!(
            "The operand is {}, but boolean logic only works with true/false.",
            value.kind_name()
        ),
        "Use a boolean expression (comparisons return true/false).",
        "if total > 10: return true",
    )
}

fn require_bool(op: &str, value: Value) -> RuntimeResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| RuntimeError::domain(boolean_operand_message(op, &value)))
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> RuntimeResult<Value> {
    if !left.is_number() || !right.is_number() {
        return Err(RuntimeError::domain(arithmetic_message(
            &op.to_string(),
            left,
            Some(right),
        )));
    }
    if let (Value::Integer(a), Value::Integer(b)) = (left, right) {
        let exact = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Div if *b != 0 && a % b == 0 => a.checked_div(*b),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::Integer(result));
        }
    }
    let (a, b) = (left.as_f64().unwrap_or(0.0), right.as_f64().unwrap_or(0.0));
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(RuntimeError::domain(build_guidance_message(
                    "Division by zero.",
                    "The right-hand side of '/' evaluated to 0.",
                    "Check for zero before dividing.",
                    "if divisor is not 0: set state.ratio is total / divisor",
                )));
            }
            a / b
        }
        BinaryOp::And | BinaryOp::Or => {
            return Err(RuntimeError::Internal(format!("'{}' is not arithmetic", op)))
        }
    };
    Ok(Value::Float(result))
}

fn comparison(op: CompareOp, left: &Value, right: &Value) -> RuntimeResult<bool> {
    let ordered = |test: fn(Ordering) -> bool| -> RuntimeResult<bool> {
        if !left.is_number() || !right.is_number() {
            return Err(RuntimeError::domain(build_guidance_message(
                "Comparison requires numbers.",
                "Ordering comparisons only work on numbers.",
                "Ensure both sides evaluate to numbers.",
                "if total > 10.5:",
            )));
        }
        left.compare(right)
            .map(test)
            .ok_or_else(|| RuntimeError::Internal("incomparable numbers".to_string()))
    };
    match op {
        CompareOp::Eq => Ok(left.loose_eq(right)),
        CompareOp::Ne => Ok(!left.loose_eq(right)),
        CompareOp::Lt => ordered(Ordering::is_lt),
        CompareOp::Le => ordered(Ordering::is_le),
        CompareOp::Gt => ordered(Ordering::is_gt),
        CompareOp::Ge => ordered(Ordering::is_ge),
    }
}

/// Evaluate named call arguments in order, rejecting duplicates with
/// `label` (e.g. "tool input").
pub fn evaluate_arguments(
    engine: &Engine,
    ctx: &mut ExecutionContext,
    arguments: &[CallArg],
    label: &str,
    mut collector: Option<&mut ExplainCollector>,
) -> RuntimeResult<ValueMap> {
    let mut payload = ValueMap::new();
    for arg in arguments {
        if payload.contains_key(&arg.name) {
            return Err(RuntimeError::domain(format!("Duplicate {} '{}'", label, arg.name)).at(arg.span));
        }
        let value = engine
            .evaluate_explained(ctx, &arg.value, collector.as_deref_mut())
            .map_err(|e| e.at(arg.span))?;
        payload.insert(arg.name.clone(), value);
    }
    Ok(payload)
}

impl BasicEvaluator {
    fn resolve_base(&self, ctx: &ExecutionContext, name: &str) -> RuntimeResult<Value> {
        if let Some(value) = ctx.locals.get(name) {
            return Ok(value.clone());
        }
        match name {
            "identity" => Ok(Value::Map(ctx.identity.clone())),
            "state" => Ok(ctx.state_value()),
            _ => Err(unknown_variable(name, ctx)),
        }
    }

    fn evaluate_inner(
        &self,
        engine: &Engine,
        ctx: &mut ExecutionContext,
        expr: &Expression,
        mut collector: Option<&mut ExplainCollector>,
    ) -> RuntimeResult<Value> {
        match expr {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Var(name) => self.resolve_base(ctx, name),
            Expression::StatePath(path) => {
                let mut cursor = &ctx.state;
                let (last, parents) = path
                    .split_last()
                    .ok_or_else(|| RuntimeError::domain("State path cannot be empty"))?;
                for segment in parents {
                    cursor = match cursor.get(segment) {
                        Some(Value::Map(map)) => map,
                        Some(_) => {
                            return Err(RuntimeError::domain(format!(
                                "State path '{}' is not a mapping",
                                path.join(".")
                            )))
                        }
                        None => {
                            return Err(RuntimeError::domain(format!(
                                "Unknown state path '{}'",
                                path.join(".")
                            )))
                        }
                    };
                }
                cursor.get(last).cloned().ok_or_else(|| {
                    RuntimeError::domain(format!("Unknown state path '{}'", path.join(".")))
                })
            }
            Expression::Attr { base, path } => {
                let mut value = self.resolve_base(ctx, base)?;
                for attr in path {
                    value = match value {
                        Value::Map(mut map) => match map.shift_remove(attr) {
                            Some(inner) => inner,
                            None if base == "identity" => {
                                return Err(RuntimeError::domain(identity_attribute_message(attr)))
                            }
                            None => {
                                return Err(RuntimeError::domain(format!("Missing attribute '{}'", attr)))
                            }
                        },
                        _ => return Err(RuntimeError::domain(format!("Missing attribute '{}'", attr))),
                    };
                }
                Ok(value)
            }
            Expression::Unary { op, operand } => {
                let value = self.evaluate(engine, ctx, operand, collector.as_deref_mut())?;
                match op {
                    UnaryOp::Not => Ok(Value::Boolean(!require_bool("not", value)?)),
                    UnaryOp::Neg => match value {
                        Value::Integer(i) => Ok(i
                            .checked_neg()
                            .map(Value::Integer)
                            .unwrap_or(Value::Float(-(i as f64)))),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(RuntimeError::domain(arithmetic_message("-", &other, None))),
                    },
                }
            }
            Expression::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = require_bool("and", self.evaluate(engine, ctx, left, collector.as_deref_mut())?)?;
                    if !l {
                        return Ok(Value::Boolean(false));
                    }
                    let r = require_bool("and", self.evaluate(engine, ctx, right, collector.as_deref_mut())?)?;
                    Ok(Value::Boolean(r))
                }
                BinaryOp::Or => {
                    let l = require_bool("or", self.evaluate(engine, ctx, left, collector.as_deref_mut())?)?;
                    if l {
                        return Ok(Value::Boolean(true));
                    }
                    let r = require_bool("or", self.evaluate(engine, ctx, right, collector.as_deref_mut())?)?;
                    Ok(Value::Boolean(r))
                }
                _ => {
                    let l = self.evaluate(engine, ctx, left, collector.as_deref_mut())?;
                    let r = self.evaluate(engine, ctx, right, collector.as_deref_mut())?;
                    arithmetic(*op, &l, &r)
                }
            },
            Expression::Comparison { op, left, right } => {
                let l = self.evaluate(engine, ctx, left, collector.as_deref_mut())?;
                let r = self.evaluate(engine, ctx, right, collector.as_deref_mut())?;
                Ok(Value::Boolean(comparison(*op, &l, &r)?))
            }
            Expression::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.evaluate(engine, ctx, item, collector.as_deref_mut())?);
                }
                Ok(Value::List(values))
            }
            Expression::Map(entries) => {
                let mut map = ValueMap::new();
                for (key, value_expr) in entries {
                    let value = self.evaluate(engine, ctx, value_expr, collector.as_deref_mut())?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Map(map))
            }
            Expression::CallFlow(call) => {
                let outputs = engine.execute_flow_call(ctx, call, collector)?;
                Ok(Value::Map(outputs))
            }
            Expression::ToolCall(call) => {
                let mut data = ValueMap::new();
                data.insert("tool_name".to_string(), Value::text(call.tool_name.clone()));
                ctx.record_step(
                    ExecutionStep::new("tool_call", format!("called tool {}", call.tool_name), call.span)
                        .with_data(data),
                );
                let payload = evaluate_arguments(engine, ctx, &call.arguments, "tool input", collector)?;
                engine.execute_tool_call(ctx, &call.tool_name, Value::Map(payload), call.span)
            }
            Expression::CallFunction(call) => engine.call_function(ctx, call, collector),
        }
    }
}

impl ExpressionEvaluator for BasicEvaluator {
    fn evaluate(
        &self,
        engine: &Engine,
        ctx: &mut ExecutionContext,
        expr: &Expression,
        mut collector: Option<&mut ExplainCollector>,
    ) -> RuntimeResult<Value> {
        let value = self.evaluate_inner(engine, ctx, expr, collector.as_deref_mut())?;
        if let Some(collector) = collector {
            collector.record(expr, &value);
        }
        Ok(value)
    }
}

/// Evaluate with a position attached to any error.
pub fn evaluate_at(
    engine: &Engine,
    ctx: &mut ExecutionContext,
    expr: &Expression,
    span: Span,
) -> RuntimeResult<Value> {
    engine.evaluate(ctx, expr).map_err(|e| e.at(span))
}
