//! Weft: the language layer of the flow engine.
//!
//! This crate is pure. It defines the lowered program representation, the
//! runtime value type and the error model. Everything stateful (context,
//! interpreter, policy gates, tool dispatch) lives in `weft-engine`.

pub mod ir;
pub mod runtime;

pub use runtime::error::{Diagnostic, RuntimeError, RuntimeResult};
pub use runtime::values::{Value, ValueMap};
