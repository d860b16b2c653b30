//! Built-in tools. Reachable only from AI turns: flows must declare the tools
//! they call, an AI may fall back to these by name.

use crate::tools::runners::{RunnerError, ToolRequest, ToolRunner};
use crate::tools::bindings::slugify_tool_name;
use lazy_static::lazy_static;
use std::collections::HashMap;
use weft::Value;

type BuiltinFn = fn(&Value) -> Result<Value, RunnerError>;

lazy_static! {
    static ref BUILTINS: HashMap<&'static str, BuiltinFn> = {
        let mut m: HashMap<&'static str, BuiltinFn> = HashMap::new();
        m.insert("echo", echo);
        m.insert("slugify", slugify);
        m.insert("word_count", word_count);
        m
    };
}

pub fn is_builtin_tool(name: &str) -> bool {
    BUILTINS.contains_key(name)
}

pub fn builtin_tool_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = BUILTINS.keys().copied().collect();
    names.sort_unstable();
    names
}

fn text_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, RunnerError> {
    args.get_path(&[key])
        .and_then(Value::as_str)
        .ok_or_else(|| RunnerError::Failed(format!("Expected text argument \"{}\"", key)))
}

fn echo(args: &Value) -> Result<Value, RunnerError> {
    Ok(args.clone())
}

fn slugify(args: &Value) -> Result<Value, RunnerError> {
    Ok(Value::map([("slug", Value::text(slugify_tool_name(text_arg(args, "text")?)))]))
}

fn word_count(args: &Value) -> Result<Value, RunnerError> {
    let count = text_arg(args, "text")?.split_whitespace().count();
    Ok(Value::map([("count", Value::Integer(count as i64))]))
}

#[derive(Debug, Default)]
pub struct BuiltinToolRunner;

impl ToolRunner for BuiltinToolRunner {
    fn name(&self) -> &str {
        "builtin"
    }

    fn execute(&self, request: &ToolRequest<'_>) -> Result<Value, RunnerError> {
        let func = BUILTINS.get(request.tool.name.as_str()).ok_or_else(|| {
            RunnerError::Failed(format!("Unknown built-in tool \"{}\"", request.tool.name))
        })?;
        func(request.payload)
    }
}
