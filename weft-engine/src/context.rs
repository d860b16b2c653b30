//! Execution context and its scope guards.
//!
//! One `ExecutionContext` lives for one top-level invocation. Nested frames
//! (flow calls, function calls, parallel tasks, AI turns) borrow it mutably
//! through a guard that swaps the relevant fields in on entry and restores
//! them on `Drop`, so every exit path, including `?`, leaves the caller's
//! frame intact.

use crate::audit::{is_sensitive_key, AuditRecorder, InMemoryAuditLog};
use crate::config::EngineConfig;
use crate::observability::{InMemoryObservability, Observability};
use crate::scheduler::JobQueue;
use crate::store::{MemoryRecordStore, RecordChange, RecordStore};
use crate::trace::{ExecutionStep, TraceEvent};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use weft::ir::{Flow, Program, Span};
use weft::runtime::error_reporting::build_guidance_message;
use weft::{RuntimeError, RuntimeResult, Value, ValueMap};

/// Who is calling a tool. Built-in tools are only reachable from `Ai`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCallSource {
    #[default]
    Flow,
    Ai,
}

impl ToolCallSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallSource::Flow => "flow",
            ToolCallSource::Ai => "ai",
        }
    }
}

pub struct ExecutionContext {
    pub program: Arc<Program>,
    pub config: EngineConfig,
    pub run_id: String,
    pub flow: Option<Arc<Flow>>,
    pub locals: ValueMap,
    pub constants: HashSet<String>,
    pub state: ValueMap,
    pub flow_stack: Vec<String>,
    pub call_stack: Vec<String>,
    pub capabilities: BTreeSet<String>,
    pub identity: ValueMap,
    pub store: Box<dyn RecordStore>,
    pub traces: Vec<TraceEvent>,
    pub steps: Vec<ExecutionStep>,
    pub pending_tool_traces: Vec<TraceEvent>,
    pub tool_call_source: ToolCallSource,
    pub parallel_mode: bool,
    pub flow_call_counter: u32,
    pub flow_call_id: Option<String>,
    pub last_value: Value,
    pub current_statement_index: Option<usize>,
    pub current_statement_span: Option<Span>,
    pub record_changes: Vec<RecordChange>,
    /// Assignment line -> end position, for lines that get explain traces.
    pub calc_assignment_index: HashMap<u32, Span>,
    pub runtime_theme: Option<String>,
    pub observability: Arc<dyn Observability>,
    pub audit: Arc<dyn AuditRecorder>,
    pub jobs: JobQueue,
    pub flow_action_id: Option<String>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("flow", &self.flow.as_ref().map(|fl| fl.name.as_str()))
            .field("flow_stack", &self.flow_stack)
            .field("call_stack", &self.call_stack)
            .field("parallel_mode", &self.parallel_mode)
            .field("traces", &self.traces.len())
            .finish()
    }
}

impl ExecutionContext {
    /// Context backed by the in-memory store, observability sink and audit log.
    pub fn new(program: Arc<Program>, config: EngineConfig) -> Self {
        Self {
            program,
            config,
            run_id: uuid::Uuid::new_v4().to_string(),
            flow: None,
            locals: ValueMap::new(),
            constants: HashSet::new(),
            state: ValueMap::new(),
            flow_stack: Vec::new(),
            call_stack: Vec::new(),
            capabilities: BTreeSet::new(),
            identity: ValueMap::new(),
            store: Box::new(MemoryRecordStore::new()),
            traces: Vec::new(),
            steps: Vec::new(),
            pending_tool_traces: Vec::new(),
            tool_call_source: ToolCallSource::Flow,
            parallel_mode: false,
            flow_call_counter: 0,
            flow_call_id: None,
            last_value: Value::Null,
            current_statement_index: None,
            current_statement_span: None,
            record_changes: Vec::new(),
            calc_assignment_index: HashMap::new(),
            runtime_theme: None,
            observability: Arc::new(InMemoryObservability::new()),
            audit: Arc::new(InMemoryAuditLog::new()),
            jobs: JobQueue::new(),
            flow_action_id: None,
        }
    }

    pub fn with_store(mut self, store: Box<dyn RecordStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_observability(mut self, observability: Arc<dyn Observability>) -> Self {
        self.observability = observability;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditRecorder>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_identity(mut self, identity: ValueMap) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_state(mut self, state: ValueMap) -> Self {
        self.state = state;
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.capabilities = crate::tools::gate::normalize_capabilities(caps)
            .into_iter()
            .collect();
        self
    }

    pub fn with_calc_assignment(mut self, line: u32, end: Span) -> Self {
        self.calc_assignment_index.insert(line, end);
        self
    }

    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.flow_action_id = Some(action_id.into());
        self
    }

    pub fn current_flow_name(&self) -> Option<&str> {
        self.flow.as_deref().map(|f| f.name.as_str())
    }

    /// A function body is running (pure context).
    pub fn in_function(&self) -> bool {
        !self.call_stack.is_empty()
    }

    pub fn record_step(&mut self, mut step: ExecutionStep) {
        step.index = self.steps.len() + 1;
        self.steps.push(step);
    }

    pub fn push_trace(&mut self, event: TraceEvent) {
        self.traces.push(event);
    }

    pub fn next_flow_call_id(&mut self) -> String {
        self.flow_call_counter += 1;
        format!("flow_call:{:04}", self.flow_call_counter)
    }

    pub fn state_value(&self) -> Value {
        Value::Map(self.state.clone())
    }

    /// Configured secrets plus identity values stored under sensitive keys.
    pub fn secret_values(&self) -> Vec<String> {
        let mut secrets = self.config.secret_values();
        for (key, value) in &self.identity {
            if let Value::String(s) = value {
                if is_sensitive_key(key) && !s.is_empty() {
                    secrets.push(s.clone());
                }
            }
        }
        secrets
    }

    /// Write `value` at a dotted state path, creating intermediate maps.
    pub fn set_state_path(&mut self, path: &[String], value: Value, span: Span) -> RuntimeResult<()> {
        let Some((last, parents)) = path.split_last() else {
            return Err(RuntimeError::domain("State path cannot be empty").at(span));
        };
        let mut current = &mut self.state;
        for (depth, segment) in parents.iter().enumerate() {
            let slot = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Map(ValueMap::new()));
            current = match slot {
                Value::Map(map) => map,
                other => {
                    return Err(RuntimeError::domain(build_guidance_message(
                        &format!(
                            "Cannot set state.{} because state.{} is {}.",
                            path.join("."),
                            parents[..=depth].join("."),
                            other.kind_name()
                        ),
                        "Only objects can hold nested state fields.",
                        "Store an object at the parent path first.",
                        &format!("set state.{} is {{}}", parents[..=depth].join(".")),
                    ))
                    .at(span))
                }
            };
        }
        current.insert(last.clone(), value);
        Ok(())
    }
}

macro_rules! context_guard_deref {
    ($guard:ident) => {
        impl<'a> Deref for $guard<'a> {
            type Target = ExecutionContext;
            fn deref(&self) -> &ExecutionContext {
                self.ctx
            }
        }

        impl<'a> DerefMut for $guard<'a> {
            fn deref_mut(&mut self) -> &mut ExecutionContext {
                self.ctx
            }
        }
    };
}

struct SavedFrame {
    flow: Option<Arc<Flow>>,
    locals: ValueMap,
    constants: HashSet<String>,
    last_value: Value,
    statement_index: Option<usize>,
    statement_span: Option<Span>,
    flow_call_id: Option<String>,
}

/// Swaps in a callee flow frame; pushes `flow_stack` for its lifetime.
pub struct FlowFrameGuard<'a> {
    ctx: &'a mut ExecutionContext,
    saved: Option<SavedFrame>,
}

impl<'a> FlowFrameGuard<'a> {
    pub fn enter(
        ctx: &'a mut ExecutionContext,
        flow: Arc<Flow>,
        locals: ValueMap,
        flow_call_id: Option<String>,
    ) -> Self {
        ctx.flow_stack.push(flow.name.clone());
        let saved = SavedFrame {
            flow: ctx.flow.replace(flow),
            locals: mem::replace(&mut ctx.locals, locals),
            constants: mem::take(&mut ctx.constants),
            last_value: mem::take(&mut ctx.last_value),
            statement_index: ctx.current_statement_index.take(),
            statement_span: ctx.current_statement_span.take(),
            flow_call_id: mem::replace(&mut ctx.flow_call_id, flow_call_id),
        };
        Self {
            ctx,
            saved: Some(saved),
        }
    }
}

impl Drop for FlowFrameGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.ctx.flow = saved.flow;
            self.ctx.locals = saved.locals;
            self.ctx.constants = saved.constants;
            self.ctx.last_value = saved.last_value;
            self.ctx.current_statement_index = saved.statement_index;
            self.ctx.current_statement_span = saved.statement_span;
            self.ctx.flow_call_id = saved.flow_call_id;
        }
        self.ctx.flow_stack.pop();
    }
}

context_guard_deref!(FlowFrameGuard);

/// Runs a function body: fresh locals from the parameters, `call_stack` pushed.
pub struct FunctionFrameGuard<'a> {
    ctx: &'a mut ExecutionContext,
    locals: ValueMap,
    constants: HashSet<String>,
    last_value: Value,
}

impl<'a> FunctionFrameGuard<'a> {
    pub fn enter(ctx: &'a mut ExecutionContext, function_name: &str, params: ValueMap) -> Self {
        ctx.call_stack.push(function_name.to_string());
        let locals = mem::replace(&mut ctx.locals, params);
        let constants = mem::take(&mut ctx.constants);
        let last_value = mem::take(&mut ctx.last_value);
        Self {
            ctx,
            locals,
            constants,
            last_value,
        }
    }
}

impl Drop for FunctionFrameGuard<'_> {
    fn drop(&mut self) {
        self.ctx.locals = mem::take(&mut self.locals);
        self.ctx.constants = mem::take(&mut self.constants);
        self.ctx.last_value = mem::take(&mut self.last_value);
        self.ctx.call_stack.pop();
    }
}

context_guard_deref!(FunctionFrameGuard);

/// Parallel task scope: `parallel_mode` on, locals and constants restored
/// afterwards so a task only ever sees a copy.
pub struct ParallelModeGuard<'a> {
    ctx: &'a mut ExecutionContext,
    previous_mode: bool,
    locals: ValueMap,
    constants: HashSet<String>,
}

impl<'a> ParallelModeGuard<'a> {
    pub fn enter(ctx: &'a mut ExecutionContext) -> Self {
        let previous_mode = mem::replace(&mut ctx.parallel_mode, true);
        let locals = ctx.locals.clone();
        let constants = ctx.constants.clone();
        Self {
            ctx,
            previous_mode,
            locals,
            constants,
        }
    }
}

impl Drop for ParallelModeGuard<'_> {
    fn drop(&mut self) {
        self.ctx.parallel_mode = self.previous_mode;
        self.ctx.locals = mem::take(&mut self.locals);
        self.ctx.constants = mem::take(&mut self.constants);
    }
}

context_guard_deref!(ParallelModeGuard);

/// Binds one local for the guard's lifetime, restoring any shadowed value.
pub struct LocalBindingGuard<'a> {
    ctx: &'a mut ExecutionContext,
    name: String,
    previous: Option<Value>,
}

impl<'a> LocalBindingGuard<'a> {
    pub fn bind(ctx: &'a mut ExecutionContext, name: &str, value: Value) -> Self {
        let previous = ctx.locals.insert(name.to_string(), value);
        Self {
            ctx,
            name: name.to_string(),
            previous,
        }
    }
}

impl Drop for LocalBindingGuard<'_> {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => {
                self.ctx.locals.insert(self.name.clone(), value);
            }
            None => {
                self.ctx.locals.shift_remove(&self.name);
            }
        }
    }
}

context_guard_deref!(LocalBindingGuard);

pub struct ToolSourceGuard<'a> {
    ctx: &'a mut ExecutionContext,
    previous: ToolCallSource,
}

impl<'a> ToolSourceGuard<'a> {
    pub fn enter(ctx: &'a mut ExecutionContext, source: ToolCallSource) -> Self {
        let previous = mem::replace(&mut ctx.tool_call_source, source);
        Self { ctx, previous }
    }
}

impl Drop for ToolSourceGuard<'_> {
    fn drop(&mut self) {
        self.ctx.tool_call_source = self.previous;
    }
}

context_guard_deref!(ToolSourceGuard);

/// Routes `traces` into `pending_tool_traces` while held.
pub struct TraceSinkGuard<'a> {
    ctx: &'a mut ExecutionContext,
}

impl<'a> TraceSinkGuard<'a> {
    pub fn redirect_to_pending(ctx: &'a mut ExecutionContext) -> Self {
        mem::swap(&mut ctx.traces, &mut ctx.pending_tool_traces);
        Self { ctx }
    }
}

impl Drop for TraceSinkGuard<'_> {
    fn drop(&mut self) {
        mem::swap(&mut self.ctx.traces, &mut self.ctx.pending_tool_traces);
    }
}

context_guard_deref!(TraceSinkGuard);
