//! Runtime building blocks shared by every host: values, errors, guidance
//! text and declared-type checks.

pub mod error;
pub mod error_reporting;
pub mod type_validator;
pub mod values;

pub use error::{Diagnostic, RuntimeError, RuntimeResult};
pub use values::{Value, ValueMap};
