//! Tool declarations meet the outside world here: capability gating,
//! binding resolution, runners and the gateway that ties them together.

pub mod bindings;
pub mod builtins;
pub mod gate;
pub mod gateway;
pub mod outcome;
pub mod runners;
pub mod schema;
