//! Composition: flow calls under contracts and pure function calls.

pub mod flow_calls;
pub mod functions;
