//! Tracing initialization.
//!
//! Structured, async-aware logging via `tracing` + `tracing-subscriber`.
//! The filter honours `RUST_LOG` when set, otherwise the configured level.
//! Initialization is idempotent so library consumers and tests may call it
//! freely.

use crate::error::{DaqError, DaqResult};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Initialize the global tracing subscriber at the given level.
pub fn init(level: &str) -> DaqResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| DaqError::Configuration(format!("invalid log level '{level}': {e}")))?,
    };

    let fmt_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_thread_names(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .or_else(|e| {
            // A second init (tests, embedding applications) is not an error.
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(DaqError::Configuration(format!(
                    "failed to initialize tracing: {e}"
                )))
            }
        })
}
