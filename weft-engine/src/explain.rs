//! Expression explain traces for calculation assignments.
//!
//! When an assignment's line is listed in `calc_assignment_index`, the
//! evaluator is handed a collector and records every evaluated
//! sub-expression, innermost first. At most `sample_limit` snapshots are
//! kept; the rest only flip `truncated`.

use crate::trace::{ExplainStepTrace, SourceRange, TraceEvent};
use weft::ir::{Expression, Span};
use weft::Value;

pub const DEFAULT_SAMPLE_LIMIT: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct ExplainCollector {
    pub steps: Vec<ExplainStepTrace>,
    pub sample_limit: usize,
    pub truncated: bool,
}

impl Default for ExplainCollector {
    fn default() -> Self {
        Self::with_limit(DEFAULT_SAMPLE_LIMIT)
    }
}

impl ExplainCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(sample_limit: usize) -> Self {
        Self {
            steps: Vec::new(),
            sample_limit,
            truncated: false,
        }
    }

    pub fn record(&mut self, expression: &Expression, value: &Value) {
        // Literals explain nothing.
        if matches!(expression, Expression::Literal(_)) {
            return;
        }
        if self.steps.len() >= self.sample_limit {
            self.truncated = true;
            return;
        }
        self.steps.push(ExplainStepTrace {
            expression: expression.to_string(),
            value: value.clone(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentKind {
    Let,
    Set,
}

impl AssignmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentKind::Let => "let",
            AssignmentKind::Set => "set",
        }
    }
}

pub struct ExplainInput<'a> {
    pub target: String,
    pub expression: &'a Expression,
    pub result: &'a Value,
    pub start: Span,
    pub end: Span,
    pub flow_name: Option<String>,
    pub kind: AssignmentKind,
}

pub fn build_expression_explain_trace(input: ExplainInput<'_>, collector: ExplainCollector) -> TraceEvent {
    let line_start = input.start.line.unwrap_or(1);
    let column_start = input.start.column.unwrap_or(1);
    TraceEvent::ExpressionExplain {
        target: input.target,
        expression: input.expression.to_string(),
        result: input.result.clone(),
        steps: collector.steps,
        span: SourceRange {
            line_start,
            column_start,
            line_end: input.end.line.unwrap_or(line_start),
            column_end: input.end.column.unwrap_or(column_start),
        },
        flow_name: input.flow_name,
        assignment_kind: input.kind.as_str().to_string(),
        truncated: collector.truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_truncates_past_limit() {
        let mut collector = ExplainCollector::with_limit(2);
        let expr = Expression::var("x");
        collector.record(&Expression::literal(1i64), &Value::Integer(1));
        collector.record(&expr, &Value::Integer(1));
        collector.record(&expr, &Value::Integer(2));
        collector.record(&expr, &Value::Integer(3));
        assert_eq!(collector.steps.len(), 2);
        assert!(collector.truncated);
    }

    #[test]
    fn test_trace_span_defaults_to_start() {
        let expr = Expression::var("total");
        let trace = build_expression_explain_trace(
            ExplainInput {
                target: "total".to_string(),
                expression: &expr,
                result: &Value::Integer(4),
                start: Span::new(7, 3),
                end: Span::unknown(),
                flow_name: Some("price".to_string()),
                kind: AssignmentKind::Let,
            },
            ExplainCollector::new(),
        );
        let json = trace.to_json();
        assert_eq!(json["span"]["line_end"], 7);
        assert_eq!(json["span"]["column_end"], 3);
        assert_eq!(json["assignment_kind"], "let");
    }
}
