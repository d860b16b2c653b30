//! Trace events and execution steps.
//!
//! Traces are append-only and ordered by emission: a nested call's start comes
//! after its parent's start and its end before the parent's end. Steps are a
//! flatter "what happened and why" record kept next to the traces.

use crate::store::RecordChange;
use crate::tools::outcome::ToolDecision;
use serde::Serialize;
use weft::ir::Span;
use weft::{Value, ValueMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowCallTrace {
    pub flow_call_id: String,
    pub caller_flow: Option<String>,
    pub callee_flow: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub contract_inputs: Vec<String>,
    pub contract_outputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_purity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callee_purity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainStepTrace {
    pub expression: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceRange {
    pub line_start: u32,
    pub column_start: u32,
    pub line_end: u32,
    pub column_end: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepGate {
    pub requires: String,
    pub status: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepChanges {
    pub record: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    FlowCallStarted {
        #[serde(flatten)]
        call: FlowCallTrace,
    },
    FlowCallFinished {
        #[serde(flatten)]
        call: FlowCallTrace,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    ToolCall {
        tool_name: String,
        kind: Option<String>,
        decision: ToolDecision,
        result: String,
    },
    ToolPolicyBlock {
        tool_name: String,
        decision: ToolDecision,
    },
    ForeignBoundaryStart {
        tool_name: String,
        policy_mode: String,
        input: Value,
    },
    ForeignBoundaryEnd {
        tool_name: String,
        policy_mode: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    AiCall {
        ai_name: String,
        model: String,
        input: Value,
        output: Option<String>,
        tool_calls: Vec<TraceEvent>,
        status: String,
    },
    ThemeChange {
        value: String,
    },
    ExpressionExplain {
        target: String,
        expression: String,
        result: Value,
        steps: Vec<ExplainStepTrace>,
        span: SourceRange,
        flow_name: Option<String>,
        assignment_kind: String,
        truncated: bool,
    },
    FlowStart {
        flow_id: String,
        flow_name: String,
    },
    FlowStep {
        flow_id: String,
        flow_name: String,
        step_id: String,
        step_kind: String,
        ordinal: usize,
        what: String,
        why: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        gate: Option<StepGate>,
        #[serde(skip_serializing_if = "Option::is_none")]
        changes: Option<StepChanges>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<Vec<String>>,
    },
    AuditRecorded {
        flow_name: String,
        actor: String,
        digest: String,
        before: Value,
        after: Value,
        record_changes: Vec<RecordChange>,
    },
    AuthorizationCheck {
        subject: String,
        outcome: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TraceEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            TraceEvent::FlowCallStarted { .. } => "flow_call_started",
            TraceEvent::FlowCallFinished { .. } => "flow_call_finished",
            TraceEvent::ToolCall { .. } => "tool_call",
            TraceEvent::ToolPolicyBlock { .. } => "tool_policy_block",
            TraceEvent::ForeignBoundaryStart { .. } => "foreign_boundary_start",
            TraceEvent::ForeignBoundaryEnd { .. } => "foreign_boundary_end",
            TraceEvent::AiCall { .. } => "ai_call",
            TraceEvent::ThemeChange { .. } => "theme_change",
            TraceEvent::ExpressionExplain { .. } => "expression_explain",
            TraceEvent::FlowStart { .. } => "flow_start",
            TraceEvent::FlowStep { .. } => "flow_step",
            TraceEvent::AuditRecorded { .. } => "audit_recorded",
            TraceEvent::AuthorizationCheck { .. } => "authorization_check",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStep {
    pub index: usize,
    pub kind: String,
    pub what: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub because: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ValueMap>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl ExecutionStep {
    pub fn new(kind: &str, what: impl Into<String>, span: Span) -> Self {
        Self {
            index: 0,
            kind: kind.to_string(),
            what: what.into(),
            because: None,
            data: None,
            line: span.line,
            column: span.column,
        }
    }

    pub fn because(mut self, because: impl Into<String>) -> Self {
        self.because = Some(because.into());
        self
    }

    pub fn with_data(mut self, data: ValueMap) -> Self {
        self.data = Some(data);
        self
    }
}
