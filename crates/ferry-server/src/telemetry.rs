use tracing_subscriber::EnvFilter;

use crate::error::{ServerError, ServerResult};

/// Install the process-wide fmt subscriber. `RUST_LOG` overrides
/// `default_filter`. Fails if a subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> ServerResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| ServerError::Config(format!("invalid log filter: {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| ServerError::Internal(e.to_string()))
}
