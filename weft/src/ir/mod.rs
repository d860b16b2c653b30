//! Intermediate representation produced by lowering and consumed by the engine.

pub mod nodes;

pub use nodes::*;
