//! Pure function calls.
//!
//! A function body runs with fresh locals bound from its parameters and with
//! `call_stack` pushed, which is what makes every state-changing statement
//! fatal inside it.

use crate::context::{ExecutionContext, FunctionFrameGuard};
use crate::engine::Engine;
use crate::evaluator::evaluate_arguments;
use crate::explain::ExplainCollector;
use crate::interpreter::StatementOutcome;
use weft::ir::{CallFunctionExpr, Function};
use weft::runtime::error_reporting::{build_guidance_message, closest_match};
use weft::runtime::type_validator::require_type;
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

fn bind_params(function: &Function, mut args: ValueMap, call: &CallFunctionExpr) -> RuntimeResult<ValueMap> {
    let mut params = ValueMap::new();
    for param in &function.params {
        match args.shift_remove(&param.name) {
            Some(value) => {
                require_type(&value, &param.type_name, call.span)?;
                params.insert(param.name.clone(), value);
            }
            None if param.required => {
                return Err(RuntimeError::domain(format!("Missing function input '{}'", param.name)).at(call.span))
            }
            None => {
                params.insert(param.name.clone(), Value::Null);
            }
        }
    }
    if let Some(extra) = args.keys().min() {
        return Err(RuntimeError::domain(format!("Unknown function input '{}'", extra)).at(call.span));
    }
    Ok(params)
}

impl Engine {
    pub fn call_function(
        &self,
        ctx: &mut ExecutionContext,
        call: &CallFunctionExpr,
        collector: Option<&mut ExplainCollector>,
    ) -> RuntimeResult<Value> {
        let program = ctx.program.clone();
        let function = program.functions.get(&call.function_name).ok_or_else(|| {
            let what = match closest_match(&call.function_name, program.functions.keys(), 0.6) {
                Some(s) => format!("Unknown function \"{}\". Did you mean \"{}\"?", call.function_name, s),
                None => format!("Unknown function \"{}\".", call.function_name),
            };
            RuntimeError::domain(build_guidance_message(
                &what,
                "Function calls must reference declared functions.",
                "Declare the function or fix the name.",
                &format!("define function \"{}\":", call.function_name),
            ))
            .at(call.span)
        })?;

        let args = evaluate_arguments(self, ctx, &call.arguments, "function input", collector)?;
        let params = bind_params(function, args, call)?;

        let mut frame = FunctionFrameGuard::enter(ctx, &function.name, params);
        for stmt in &function.body {
            if let StatementOutcome::Return(value) = self.execute_statement(&mut frame, stmt)? {
                return Ok(value);
            }
        }
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Arc;
    use weft::ir::{Assignable, BinaryOp, CallArg, Expression, Param, Program, Span, Statement};

    fn double() -> Function {
        Function {
            name: "double".to_string(),
            params: vec![Param::required("n", "number")],
            body: vec![Statement::ret(Expression::binary(
                BinaryOp::Mul,
                Expression::var("n"),
                Expression::literal(2i64),
            ))],
            span: Span::unknown(),
        }
    }

    fn call(name: &str, args: Vec<CallArg>) -> CallFunctionExpr {
        CallFunctionExpr {
            function_name: name.to_string(),
            arguments: args,
            span: Span::new(4, 2),
        }
    }

    #[test]
    fn test_function_returns_and_restores_frame() {
        let program = Program::new().with_function(double());
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
        ctx.locals.insert("outer".to_string(), Value::Integer(1));
        let value = engine
            .call_function(&mut ctx, &call("double", vec![CallArg::new("n", Expression::literal(21i64))]), None)
            .unwrap();
        assert_eq!(value, Value::Integer(42));
        assert!(ctx.call_stack.is_empty());
        assert_eq!(ctx.locals.len(), 1);
    }

    #[test]
    fn test_state_write_inside_function_is_fatal() {
        let writer = Function {
            name: "writer".to_string(),
            params: vec![],
            body: vec![Statement::set(
                Assignable::State(vec!["x".to_string()]),
                Expression::literal(1i64),
            )],
            span: Span::unknown(),
        };
        let program = Program::new().with_function(writer);
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
        let err = engine.call_function(&mut ctx, &call("writer", vec![]), None).unwrap_err();
        assert!(!err.is_catchable());
        assert_eq!(err.message(), "Functions cannot change state");
        assert!(ctx.state.is_empty());
    }

    #[test]
    fn test_unknown_function_and_inputs() {
        let program = Program::new().with_function(double());
        let engine = Engine::new();
        let mut ctx = ExecutionContext::new(Arc::new(program), EngineConfig::default());
        let err = engine.call_function(&mut ctx, &call("doubel", vec![]), None).unwrap_err();
        assert!(err.message().contains("Did you mean \"double\"?"));
        let err = engine.call_function(&mut ctx, &call("double", vec![]), None).unwrap_err();
        assert_eq!(err.message(), "Missing function input 'n'");
    }
}
