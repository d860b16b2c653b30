// Weft engine
// Statement interpreter, flow composer, mutation policy gate and tool gateway
// built on the `weft` program representation.

pub mod audit;
pub mod composition;
pub mod config;
pub mod context;
pub mod declarative;
pub mod engine;
pub mod evaluator;
pub mod explain;
pub mod guards;
pub mod interpreter;
pub mod logging;
pub mod mutation_policy;
pub mod observability;
pub mod scheduler;
pub mod store;
pub mod tools;
pub mod trace;

pub use audit::{AuditEntry, AuditRecorder, InMemoryAuditLog, JsonlAuditLog};
pub use config::EngineConfig;
pub use context::{ExecutionContext, ToolCallSource};
pub use engine::Engine;
pub use interpreter::ai::{AiProvider, AiRequest, AiTurn};
pub use interpreter::StatementOutcome;
pub use mutation_policy::{mutation_policy_warnings, MutationDecision, PolicyWarning};
pub use observability::{InMemoryObservability, Observability};
pub use store::{MemoryRecordStore, RecordAction, RecordChange, RecordStore};
pub use tools::outcome::{DecisionStatus, ResultKind, ToolCallOutcome, ToolDecision};
pub use tools::runners::{RunnerError, ToolRequest, ToolRunner, ToolRunnerRegistry};
pub use trace::{ExecutionStep, TraceEvent};
