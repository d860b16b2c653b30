//! Uniform shape of every tool call result, whichever path it took.

use serde::Serialize;
use std::fmt;
use weft::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Allowed,
    Blocked,
    Error,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Allowed => "allowed",
            DecisionStatus::Blocked => "blocked",
            DecisionStatus::Error => "error",
        }
    }

    /// Result kind of a call that stopped at this decision.
    pub fn result_kind(&self) -> ResultKind {
        match self {
            DecisionStatus::Allowed => ResultKind::Ok,
            DecisionStatus::Blocked => ResultKind::Blocked,
            DecisionStatus::Error => ResultKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDecision {
    pub status: DecisionStatus,
    pub capability: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ToolDecision {
    pub fn allowed(capability: Option<String>) -> Self {
        Self {
            status: DecisionStatus::Allowed,
            capability,
            reason: None,
            message: None,
        }
    }

    pub fn blocked(reason: &str, message: impl Into<String>) -> Self {
        Self {
            status: DecisionStatus::Blocked,
            capability: None,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    pub fn error(reason: &str, message: impl Into<String>) -> Self {
        Self {
            status: DecisionStatus::Error,
            capability: None,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.status == DecisionStatus::Allowed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Ok,
    Blocked,
    Error,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Ok => "ok",
            ResultKind::Blocked => "blocked",
            ResultKind::Error => "error",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallOutcome {
    pub tool_name: String,
    pub decision: ToolDecision,
    pub result_kind: ResultKind,
    pub result_summary: String,
    pub result_value: Option<Value>,
}

impl ToolCallOutcome {
    pub fn ok(tool_name: &str, decision: ToolDecision, value: Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            decision,
            result_kind: ResultKind::Ok,
            result_summary: "ok".to_string(),
            result_value: Some(value),
        }
    }

    pub fn failed(tool_name: &str, decision: ToolDecision, kind: ResultKind, summary: String) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            decision,
            result_kind: kind,
            result_summary: summary,
            result_value: None,
        }
    }

    /// Value handed back to an AI turn: the result when ok, else the
    /// decision and summary so the model can react.
    pub fn to_value(&self) -> Value {
        match (&self.result_kind, &self.result_value) {
            (ResultKind::Ok, Some(value)) => Value::map([
                ("status", Value::text("ok")),
                ("result", value.clone()),
            ]),
            _ => Value::map([
                ("status", Value::text(self.result_kind.as_str())),
                (
                    "reason",
                    self.decision
                        .reason
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                ),
                ("message", Value::text(self.result_summary.clone())),
            ]),
        }
    }
}
