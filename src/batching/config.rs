//! Dynamic batching configuration.

use crate::error::BatchQueueError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How one endpoint coalesces documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicBatchingConfig {
  /// Size of a sub-batch, in documents or in custom metric units.
  #[serde(default = "default_preferred_batch_size")]
  pub preferred_batch_size: usize,
  /// Milliseconds a document may wait for its batch to fill up.
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  /// Sends everything queued in one call instead of splitting it.
  #[serde(default)]
  pub flush_all: bool,
  /// Lets callers keep queueing while a flush runs.
  #[serde(default)]
  pub allow_concurrent: bool,
  /// Measures the batch with the executor's document metric instead of the
  /// document count.
  #[serde(default)]
  pub use_custom_metric: bool,
}

fn default_preferred_batch_size() -> usize {
  4
}

fn default_timeout() -> u64 {
  10_000
}

impl Default for DynamicBatchingConfig {
  fn default() -> Self {
    Self {
      preferred_batch_size: default_preferred_batch_size(),
      timeout: default_timeout(),
      flush_all: false,
      allow_concurrent: false,
      use_custom_metric: false,
    }
  }
}

impl DynamicBatchingConfig {
  /// Creates a configuration flushing at `preferred_batch_size` documents or
  /// after `timeout`.
  pub fn new(preferred_batch_size: usize, timeout: Duration) -> Self {
    Self {
      preferred_batch_size,
      timeout: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
      ..Self::default()
    }
  }

  /// Sets `flush_all`.
  #[must_use]
  pub fn with_flush_all(mut self, flush_all: bool) -> Self {
    self.flush_all = flush_all;
    self
  }

  /// Sets `allow_concurrent`.
  #[must_use]
  pub fn with_allow_concurrent(mut self, allow_concurrent: bool) -> Self {
    self.allow_concurrent = allow_concurrent;
    self
  }

  /// Sets `use_custom_metric`.
  #[must_use]
  pub fn with_custom_metric(mut self, use_custom_metric: bool) -> Self {
    self.use_custom_metric = use_custom_metric;
    self
  }

  /// Flush deadline.
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout)
  }

  /// Rejects configurations that could never flush by size.
  ///
  /// # Errors
  ///
  /// [`BatchQueueError::InvalidConfig`] for a zero batch size.
  pub fn validate(&self) -> Result<(), BatchQueueError> {
    if self.preferred_batch_size == 0 {
      return Err(BatchQueueError::InvalidConfig(
        "preferred_batch_size must be greater than zero".into(),
      ));
    }
    Ok(())
  }
}

/// Picks the batching configuration of an endpoint.
///
/// A configuration keyed by the endpoint path wins over one keyed by the
/// name of the function bound to it, which wins over the function's own
/// declaration.
pub fn resolve_batching<'a>(
  overrides: &'a BTreeMap<String, DynamicBatchingConfig>,
  endpoint: &str,
  function: &str,
  declared: Option<&'a DynamicBatchingConfig>,
) -> Option<&'a DynamicBatchingConfig> {
  overrides
    .get(endpoint)
    .or_else(|| overrides.get(function))
    .or(declared)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_defaults_and_partial_json() {
    let config: DynamicBatchingConfig =
      serde_json::from_value(json!({"preferred_batch_size": 8, "flush_all": true})).unwrap();
    assert_eq!(config.preferred_batch_size, 8);
    assert_eq!(config.timeout(), Duration::from_secs(10));
    assert!(config.flush_all);
    assert!(!config.allow_concurrent);
  }

  #[test]
  fn test_zero_batch_size_is_invalid() {
    let config = DynamicBatchingConfig::new(0, Duration::from_millis(5));
    assert!(matches!(config.validate(), Err(BatchQueueError::InvalidConfig(_))));
  }

  #[test]
  fn test_endpoint_overrides_function() {
    let declared = DynamicBatchingConfig::new(1, Duration::from_millis(1));
    let mut overrides = BTreeMap::new();
    overrides.insert("encode".to_string(), DynamicBatchingConfig::new(2, Duration::from_millis(1)));
    assert_eq!(
      resolve_batching(&overrides, "/foo", "encode", Some(&declared)).map(|c| c.preferred_batch_size),
      Some(2)
    );
    overrides.insert("/foo".to_string(), DynamicBatchingConfig::new(3, Duration::from_millis(1)));
    assert_eq!(
      resolve_batching(&overrides, "/foo", "encode", Some(&declared)).map(|c| c.preferred_batch_size),
      Some(3)
    );
    assert_eq!(
      resolve_batching(&BTreeMap::new(), "/foo", "encode", Some(&declared)).map(|c| c.preferred_batch_size),
      Some(1)
    );
    assert!(resolve_batching(&BTreeMap::new(), "/foo", "encode", None).is_none());
  }
}
