//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=obs_scheduler=debug,status=info` works as expected.

use tracing_subscriber::EnvFilter;

use crate::error::{SchedError, SchedResult};

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(level: &str, json: bool) -> SchedResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| SchedError::Configuration(format!("invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| SchedError::Configuration(format!("logging already initialised: {e}")))
}
