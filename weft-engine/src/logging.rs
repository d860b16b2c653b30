//! Process-wide log setup for hosts embedding the engine.
//!
//! The engine logs through the `log` facade; `init_logging` bridges those
//! records into a `tracing` fmt subscriber filtered by `RUST_LOG`
//! (default `weft_engine=info`). Calling it more than once is harmless.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "weft_engine=info";

static INIT: OnceCell<bool> = OnceCell::new();

/// Install the subscriber. Returns `false` when another subscriber was
/// already installed by the host.
pub fn init_logging() -> bool {
    *INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
        let bridged = tracing_log::LogTracer::init().is_ok();
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init()
            .is_ok();
        bridged && installed
    })
}
