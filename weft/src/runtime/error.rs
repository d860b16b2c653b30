//! Runtime error model
//!
//! Three kinds of failure leave the interpreter:
//! - `Domain`: policy denials, contract violations, tool failures. These carry
//!   guidance text and are the only errors a `try`/`catch` block intercepts.
//! - `Fatal`: structural violations (flow recursion, mutation from a function
//!   or a parallel task). Never catchable.
//! - `Internal`: host failures such as I/O or serialization.

use crate::ir::Span;
use crate::runtime::values::{Value, ValueMap};
use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Diagnostic {
    pub message: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub details: IndexMap<String, String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(String::as_str)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Domain(Diagnostic),
    #[error("{0}")]
    Fatal(Diagnostic),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    pub fn domain(message: impl Into<String>) -> Self {
        RuntimeError::Domain(Diagnostic::new(message))
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        RuntimeError::Fatal(Diagnostic::new(message))
    }

    /// Attach a source position. Positions already present are kept, so the
    /// innermost location wins as the error unwinds.
    pub fn at(mut self, span: Span) -> Self {
        if let Some(diag) = self.diagnostic_mut() {
            if diag.line.is_none() {
                diag.line = span.line;
            }
            if diag.column.is_none() {
                diag.column = span.column;
            }
        }
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        if let Some(diag) = self.diagnostic_mut() {
            diag.details.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn is_catchable(&self) -> bool {
        matches!(self, RuntimeError::Domain(_))
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            RuntimeError::Domain(d) | RuntimeError::Fatal(d) => Some(d),
            RuntimeError::Internal(_) => None,
        }
    }

    fn diagnostic_mut(&mut self) -> Option<&mut Diagnostic> {
        match self {
            RuntimeError::Domain(d) | RuntimeError::Fatal(d) => Some(d),
            RuntimeError::Internal(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RuntimeError::Domain(d) | RuntimeError::Fatal(d) => d.message.clone(),
            RuntimeError::Internal(msg) => msg.clone(),
        }
    }

    /// Value bound to a `catch` variable.
    pub fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        let kind = match self {
            RuntimeError::Domain(_) => "error",
            RuntimeError::Fatal(_) => "fatal",
            RuntimeError::Internal(_) => "internal",
        };
        map.insert("kind".to_string(), Value::text(kind));
        map.insert("message".to_string(), Value::text(self.message()));
        if let Some(diag) = self.diagnostic() {
            map.insert(
                "line".to_string(),
                diag.line.map(|l| Value::Integer(l as i64)).unwrap_or(Value::Null),
            );
            map.insert(
                "column".to_string(),
                diag.column.map(|c| Value::Integer(c as i64)).unwrap_or(Value::Null),
            );
        }
        Value::Map(map)
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Internal(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Internal(format!("IO error: {}", err))
    }
}
