//! Lowered program representation consumed by the engine.
//!
//! Every node kind is a closed enum; the engine matches them exhaustively.

use crate::runtime::values::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Self {
            line: Some(line),
            column: Some(column),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallArg {
    pub name: String,
    pub value: Expression,
    pub span: Span,
}

impl CallArg {
    pub fn new(name: impl Into<String>, value: Expression) -> Self {
        Self {
            name: name.into(),
            value,
            span: Span::unknown(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallFlowExpr {
    pub flow_name: String,
    pub arguments: Vec<CallArg>,
    /// Output names the caller asks for.
    pub outputs: Vec<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallExpr {
    pub tool_name: String,
    pub arguments: Vec<CallArg>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallFunctionExpr {
    pub function_name: String,
    pub arguments: Vec<CallArg>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Var(String),
    /// `state.a.b`
    StatePath(Vec<String>),
    /// `base.a.b` where base is a local, `identity`, or `input`.
    Attr { base: String, path: Vec<String> },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Comparison {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    List(Vec<Expression>),
    Map(Vec<(String, Expression)>),
    CallFlow(CallFlowExpr),
    ToolCall(ToolCallExpr),
    CallFunction(CallFunctionExpr),
}

impl Expression {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expression::Var(name.into())
    }

    pub fn attr(base: impl Into<String>, path: &[&str]) -> Self {
        Expression::Attr {
            base: base.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn state(path: &[&str]) -> Self {
        Expression::StatePath(path.iter().map(|s| s.to_string()).collect())
    }

    pub fn compare(op: CompareOp, left: Expression, right: Expression) -> Self {
        Expression::Comparison {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// True when the expression reads the reserved `mutation` local.
    pub fn mentions_mutation(&self) -> bool {
        match self {
            Expression::Var(name) => name == "mutation",
            Expression::Attr { base, .. } => base == "mutation",
            Expression::Unary { operand, .. } => operand.mentions_mutation(),
            Expression::Binary { left, right, .. } | Expression::Comparison { left, right, .. } => {
                left.mentions_mutation() || right.mentions_mutation()
            }
            Expression::List(items) => items.iter().any(Expression::mentions_mutation),
            Expression::Map(entries) => entries.iter().any(|(_, v)| v.mentions_mutation()),
            Expression::ToolCall(call) => call.arguments.iter().any(|a| a.value.mentions_mutation()),
            Expression::CallFunction(call) => {
                call.arguments.iter().any(|a| a.value.mentions_mutation())
            }
            Expression::Literal(_) | Expression::StatePath(_) | Expression::CallFlow(_) => false,
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Not => write!(f, "not "),
            UnaryOp::Neg => write!(f, "-"),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "is",
            CompareOp::Ne => "is not",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[CallArg]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}: {}", arg.name, arg.value)?;
    }
    Ok(())
}

/// Canonical source-like rendering, used by explain traces.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(Value::String(s)) => write!(f, "{:?}", s),
            Expression::Literal(v) => write!(f, "{}", v),
            Expression::Var(name) => write!(f, "{}", name),
            Expression::StatePath(path) => write!(f, "state.{}", path.join(".")),
            Expression::Attr { base, path } => write!(f, "{}.{}", base, path.join(".")),
            Expression::Unary { op, operand } => write!(f, "{}{}", op, operand),
            Expression::Binary { op, left, right } => write!(f, "({} {} {})", left, op, right),
            Expression::Comparison { op, left, right } => write!(f, "{} {} {}", left, op, right),
            Expression::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expression::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Expression::CallFlow(call) => {
                write!(f, "call flow {:?}(", call.flow_name)?;
                write_args(f, &call.arguments)?;
                write!(f, ")")
            }
            Expression::ToolCall(call) => {
                write!(f, "{}(", call.tool_name)?;
                write_args(f, &call.arguments)?;
                write!(f, ")")
            }
            Expression::CallFunction(call) => {
                write!(f, "call function {:?}(", call.function_name)?;
                write_args(f, &call.arguments)?;
                write!(f, ")")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Assignable {
    Local(String),
    State(Vec<String>),
}

impl fmt::Display for Assignable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assignable::Local(name) => write!(f, "{}", name),
            Assignable::State(path) => write!(f, "state.{}", path.join(".")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: Expression,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelTask {
    pub name: String,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentRun {
    pub agent_name: String,
    pub input: Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Timing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricOp {
    Increment,
    Add,
    Set,
    Record,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Timing => write!(f, "timing"),
        }
    }
}

impl fmt::Display for MetricOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricOp::Increment => "increment",
            MetricOp::Add => "add",
            MetricOp::Set => "set",
            MetricOp::Record => "record",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Relative delay in logical ticks.
    After,
    /// Absolute logical time.
    At,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSchedule {
    pub kind: ScheduleKind,
    pub value: Expression,
}

/// Field filter `field is <expr>` used by find/update/delete.
pub type FieldExprs = Vec<(String, Expression)>;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Let {
        name: String,
        expression: Expression,
        constant: bool,
        span: Span,
    },
    Set {
        target: Assignable,
        expression: Expression,
        span: Span,
    },
    If {
        condition: Expression,
        then_body: Vec<Statement>,
        else_body: Vec<Statement>,
        span: Span,
    },
    Return {
        expression: Expression,
        span: Span,
    },
    Repeat {
        count: Expression,
        body: Vec<Statement>,
        span: Span,
    },
    RepeatWhile {
        condition: Expression,
        limit: u32,
        body: Vec<Statement>,
        span: Span,
    },
    ForEach {
        name: String,
        iterable: Expression,
        body: Vec<Statement>,
        span: Span,
    },
    Match {
        subject: Expression,
        cases: Vec<MatchCase>,
        otherwise: Option<Vec<Statement>>,
        span: Span,
    },
    TryCatch {
        try_body: Vec<Statement>,
        catch_var: String,
        catch_body: Vec<Statement>,
        span: Span,
    },
    AskAi {
        ai_name: String,
        input: Expression,
        target: String,
        span: Span,
    },
    RunAgent {
        agent_name: String,
        input: Expression,
        target: String,
        span: Span,
    },
    RunAgentsParallel {
        runs: Vec<AgentRun>,
        target: String,
        span: Span,
    },
    Parallel {
        tasks: Vec<ParallelTask>,
        target: Option<String>,
        span: Span,
    },
    /// Persist `values`, or `state.<record>` when no values are given.
    Save {
        record: String,
        values: Option<Expression>,
        span: Span,
    },
    Create {
        record: String,
        values: Expression,
        target: String,
        span: Span,
    },
    Find {
        record: String,
        filter: FieldExprs,
        target: String,
        span: Span,
    },
    Update {
        record: String,
        filter: FieldExprs,
        updates: FieldExprs,
        span: Span,
    },
    Delete {
        record: String,
        filter: FieldExprs,
        span: Span,
    },
    ThemeChange {
        value: String,
        span: Span,
    },
    Log {
        level: LogLevel,
        message: Expression,
        fields: Option<Expression>,
        span: Span,
    },
    Metric {
        kind: MetricKind,
        operation: MetricOp,
        name: String,
        value: Option<Expression>,
        labels: Option<Expression>,
        span: Span,
    },
    EnqueueJob {
        job_name: String,
        input: Option<Expression>,
        schedule: Option<JobSchedule>,
        span: Span,
    },
    AdvanceTime {
        amount: Expression,
        span: Span,
    },
}

impl Statement {
    pub fn span(&self) -> Span {
        match self {
            Statement::Let { span, .. }
            | Statement::Set { span, .. }
            | Statement::If { span, .. }
            | Statement::Return { span, .. }
            | Statement::Repeat { span, .. }
            | Statement::RepeatWhile { span, .. }
            | Statement::ForEach { span, .. }
            | Statement::Match { span, .. }
            | Statement::TryCatch { span, .. }
            | Statement::AskAi { span, .. }
            | Statement::RunAgent { span, .. }
            | Statement::RunAgentsParallel { span, .. }
            | Statement::Parallel { span, .. }
            | Statement::Save { span, .. }
            | Statement::Create { span, .. }
            | Statement::Find { span, .. }
            | Statement::Update { span, .. }
            | Statement::Delete { span, .. }
            | Statement::ThemeChange { span, .. }
            | Statement::Log { span, .. }
            | Statement::Metric { span, .. }
            | Statement::EnqueueJob { span, .. }
            | Statement::AdvanceTime { span, .. } => *span,
        }
    }

    pub fn let_(name: impl Into<String>, expression: Expression) -> Self {
        Statement::Let {
            name: name.into(),
            expression,
            constant: false,
            span: Span::unknown(),
        }
    }

    pub fn set(target: Assignable, expression: Expression) -> Self {
        Statement::Set {
            target,
            expression,
            span: Span::unknown(),
        }
    }

    pub fn ret(expression: Expression) -> Self {
        Statement::Return {
            expression,
            span: Span::unknown(),
        }
    }

    pub fn save(record: impl Into<String>, values: Option<Expression>) -> Self {
        Statement::Save {
            record: record.into(),
            values,
            span: Span::unknown(),
        }
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub type_name: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Param {
    pub fn required(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contract {
    pub inputs: Vec<Param>,
    pub outputs: Vec<Param>,
}

impl Contract {
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|p| p.name.clone()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|p| p.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purity {
    Pure,
    Effectful,
}

impl Purity {
    pub fn is_pure(purity: Option<Purity>) -> bool {
        purity == Some(Purity::Pure)
    }
}

impl fmt::Display for Purity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Purity::Pure => write!(f, "pure"),
            Purity::Effectful => write!(f, "effectful"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    pub name: String,
    pub type_name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowStep {
    Input {
        fields: Vec<FlowField>,
        span: Span,
    },
    /// Condition is a dotted state path, optionally prefixed with `state.`
    /// and optionally negated with a leading `not `.
    Require {
        condition: String,
        span: Span,
    },
    Create {
        record: String,
        fields: FieldExprs,
        span: Span,
    },
    Update {
        record: String,
        filter: FieldExprs,
        updates: FieldExprs,
        span: Span,
    },
    Delete {
        record: String,
        filter: FieldExprs,
        span: Span,
    },
}

impl FlowStep {
    pub fn kind(&self) -> &'static str {
        match self {
            FlowStep::Input { .. } => "input",
            FlowStep::Require { .. } => "require",
            FlowStep::Create { .. } => "create",
            FlowStep::Update { .. } => "update",
            FlowStep::Delete { .. } => "delete",
        }
    }

    pub fn span(&self) -> Span {
        match self {
            FlowStep::Input { span, .. }
            | FlowStep::Require { span, .. }
            | FlowStep::Create { span, .. }
            | FlowStep::Update { span, .. }
            | FlowStep::Delete { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowBody {
    Statements(Vec<Statement>),
    Steps(Vec<FlowStep>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub name: String,
    pub body: FlowBody,
    pub requires: Option<Expression>,
    pub audited: bool,
    pub purity: Option<Purity>,
    pub span: Span,
}

impl Flow {
    pub fn new(name: impl Into<String>, body: Vec<Statement>) -> Self {
        Self {
            name: name.into(),
            body: FlowBody::Statements(body),
            requires: None,
            audited: false,
            purity: None,
            span: Span::unknown(),
        }
    }

    pub fn declarative(name: impl Into<String>, steps: Vec<FlowStep>) -> Self {
        Self {
            body: FlowBody::Steps(steps),
            ..Self::new(name, Vec::new())
        }
    }

    pub fn requires(mut self, expr: Expression) -> Self {
        self.requires = Some(expr);
        self
    }

    pub fn audited(mut self) -> Self {
        self.audited = true;
        self
    }

    pub fn with_purity(mut self, purity: Purity) -> Self {
        self.purity = Some(purity);
        self
    }

    /// Does any statement or step in this flow write records?
    pub fn mutates(&self) -> bool {
        match &self.body {
            FlowBody::Steps(steps) => steps.iter().any(|s| {
                matches!(
                    s,
                    FlowStep::Create { .. } | FlowStep::Update { .. } | FlowStep::Delete { .. }
                )
            }),
            FlowBody::Statements(stmts) => statements_mutate(stmts),
        }
    }
}

pub fn statements_mutate(stmts: &[Statement]) -> bool {
    stmts.iter().any(|stmt| match stmt {
        Statement::Save { .. }
        | Statement::Create { .. }
        | Statement::Update { .. }
        | Statement::Delete { .. } => true,
        Statement::If {
            then_body,
            else_body,
            ..
        } => statements_mutate(then_body) || statements_mutate(else_body),
        Statement::Repeat { body, .. }
        | Statement::RepeatWhile { body, .. }
        | Statement::ForEach { body, .. } => statements_mutate(body),
        Statement::TryCatch {
            try_body,
            catch_body,
            ..
        } => statements_mutate(try_body) || statements_mutate(catch_body),
        Statement::Match {
            cases, otherwise, ..
        } => {
            cases.iter().any(|c| statements_mutate(&c.body))
                || otherwise.as_deref().map(statements_mutate).unwrap_or(false)
        }
        _ => false,
    })
}

/// Pure, parameterized statement body callable from expressions.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Statement>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Python,
    Node,
    Builtin,
    Service,
    Container,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Python => "python",
            ToolKind::Node => "node",
            ToolKind::Builtin => "builtin",
            ToolKind::Service => "service",
            ToolKind::Container => "container",
        }
    }

    /// Kinds executed by an out-of-process script runner.
    pub fn is_scripted(&self) -> bool {
        matches!(self, ToolKind::Python | ToolKind::Node)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDecl {
    pub name: String,
    pub kind: ToolKind,
    pub capabilities: Vec<String>,
    pub input_fields: Vec<Param>,
    pub output_fields: Vec<Param>,
    /// Declared with `foreign`: crosses a trust boundary.
    pub foreign: bool,
    pub span: Span,
}

impl ToolDecl {
    pub fn new(name: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            name: name.into(),
            kind,
            capabilities: Vec::new(),
            input_fields: Vec::new(),
            output_fields: Vec::new(),
            foreign: false,
            span: Span::unknown(),
        }
    }

    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn foreign(mut self) -> Self {
        self.foreign = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiProfile {
    pub name: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub exposed_tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentDecl {
    pub name: String,
    pub ai_name: String,
    pub system_prompt: Option<String>,
}

/// A UI page whose forms write records; guarded like a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub name: String,
    pub requires: Option<Expression>,
    pub audited: bool,
    /// Any form, nested at any depth in the page's items.
    pub has_form: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub flows: IndexMap<String, Arc<Flow>>,
    pub contracts: IndexMap<String, Contract>,
    pub functions: IndexMap<String, Arc<Function>>,
    pub tools: IndexMap<String, ToolDecl>,
    pub ai_profiles: IndexMap<String, AiProfile>,
    pub agents: IndexMap<String, AgentDecl>,
    pub pages: IndexMap<String, Page>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flows.insert(flow.name.clone(), Arc::new(flow));
        self
    }

    pub fn with_contract(mut self, flow_name: impl Into<String>, contract: Contract) -> Self {
        self.contracts.insert(flow_name.into(), contract);
        self
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.functions
            .insert(function.name.clone(), Arc::new(function));
        self
    }

    pub fn with_tool(mut self, tool: ToolDecl) -> Self {
        self.tools.insert(tool.name.clone(), tool);
        self
    }

    pub fn with_ai(mut self, profile: AiProfile) -> Self {
        self.ai_profiles.insert(profile.name.clone(), profile);
        self
    }

    pub fn with_agent(mut self, agent: AgentDecl) -> Self {
        self.agents.insert(agent.name.clone(), agent);
        self
    }

    pub fn with_page(mut self, page: Page) -> Self {
        self.pages.insert(page.name.clone(), page);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_mutation_looks_through_operators() {
        let guard = Expression::binary(
            BinaryOp::And,
            Expression::compare(
                CompareOp::Eq,
                Expression::attr("identity", &["role"]),
                Expression::literal("admin"),
            ),
            Expression::compare(
                CompareOp::Ne,
                Expression::attr("mutation", &["action"]),
                Expression::literal("delete"),
            ),
        );
        assert!(guard.mentions_mutation());
        assert!(!Expression::literal(true).mentions_mutation());
    }

    #[test]
    fn test_nested_mutation_detection() {
        let flow = Flow::new(
            "archive",
            vec![Statement::If {
                condition: Expression::literal(true),
                then_body: vec![Statement::save("Order", None)],
                else_body: vec![],
                span: Span::unknown(),
            }],
        );
        assert!(flow.mutates());
        assert!(!Flow::new("noop", vec![Statement::ret(Expression::literal(1i64))]).mutates());
    }

    #[test]
    fn test_canonical_rendering() {
        let expr = Expression::binary(
            BinaryOp::Add,
            Expression::var("price"),
            Expression::binary(BinaryOp::Mul, Expression::var("qty"), Expression::literal(2i64)),
        );
        assert_eq!(expr.to_string(), "(price + (qty * 2))");
    }
}
