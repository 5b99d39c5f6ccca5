//! # Logging
//!
//! Subscriber setup for binaries and tests embedding the gateway. Library code
//! only emits `tracing` events and never installs a subscriber on its own.
//!
//! The filter comes from `RUST_LOG`; `LOG_FORMAT=json` switches to JSON lines,
//! anything else prints the human readable format.

use crate::error::GatewayError;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] when a global subscriber is already set.
pub fn init_tracing() -> Result<(), GatewayError> {
  let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

  let result = match format.as_str() {
    "json" => tracing_subscriber::fmt()
      .json()
      .with_env_filter(EnvFilter::from_default_env())
      .with_current_span(true)
      .with_span_list(true)
      .try_init(),
    _ => tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env())
      .with_target(true)
      .try_init(),
  };

  result.map_err(|e| GatewayError::Config(format!("tracing init failed: {e}")))
}
