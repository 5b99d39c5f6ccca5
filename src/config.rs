//! # Configuration
//!
//! Serde structs for every configurable component. All structs have sensible
//! defaults so embedders only set what they need; JSON produced by
//! [`GatewayStreamerConfig::to_env_value`] can be read back by
//! [`GatewayStreamerConfig::from_env`].

use crate::batching::DynamicBatchingConfig;
use crate::error::GatewayError;
use crate::head::PollingConfig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable holding the gateway streamer arguments as JSON.
pub const STREAMER_ARGS_ENV: &str = "JINA_STREAMER_ARGS";

/// Compression applied to RPC request bodies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Compression {
  /// No compression.
  #[default]
  None,
  /// gzip.
  Gzip,
  /// deflate.
  Deflate,
}

impl Compression {
  /// Value of the `content-encoding` header, if any.
  pub fn content_encoding(self) -> Option<&'static str> {
    match self {
      Compression::None => None,
      Compression::Gzip => Some("gzip"),
      Compression::Deflate => Some("deflate"),
    }
  }
}

impl FromStr for Compression {
  type Err = GatewayError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "" | "none" | "identity" => Ok(Compression::None),
      "gzip" => Ok(Compression::Gzip),
      "deflate" => Ok(Compression::Deflate),
      other => Err(GatewayError::Config(format!("unknown compression `{other}`"))),
    }
  }
}

impl fmt::Display for Compression {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Compression::None => "NONE",
      Compression::Gzip => "gzip",
      Compression::Deflate => "deflate",
    })
  }
}

impl Serialize for Compression {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Compression {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
      None => Ok(Compression::None),
      Some(s) => s.parse().map_err(serde::de::Error::custom),
    }
  }
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct ConnectionPoolConfig {
  /// Compression of request bodies.
  pub compression: Compression,
  /// Default retry budget. Negative means `max(3, replicas)`.
  pub retries: i32,
  /// Delay before retrying a failed attempt.
  pub retry_delay: Duration,
  /// Grace period given to a channel when it is closed.
  pub close_grace: Duration,
  /// Timeout of connection establishment.
  pub connect_timeout: Duration,
  /// Upper bound of a warmup round.
  pub warmup_timeout: Duration,
}

impl Default for ConnectionPoolConfig {
  fn default() -> Self {
    Self {
      compression: Compression::None,
      retries: -1,
      retry_delay: Duration::from_millis(10),
      close_grace: Duration::from_millis(500),
      connect_timeout: Duration::from_secs(5),
      warmup_timeout: Duration::from_secs(300),
    }
  }
}

impl ConnectionPoolConfig {
  /// Sets the compression.
  #[must_use]
  pub fn with_compression(mut self, compression: Compression) -> Self {
    self.compression = compression;
    self
  }

  /// Sets the default retry budget.
  #[must_use]
  pub fn with_retries(mut self, retries: i32) -> Self {
    self.retries = retries;
    self
  }

  /// Sets the delay between retries.
  #[must_use]
  pub fn with_retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }
}

/// Addresses of one deployment, given as a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressList {
  /// One address.
  One(String),
  /// Several replicas.
  Many(Vec<String>),
}

impl AddressList {
  /// Addresses as a list.
  pub fn to_vec(&self) -> Vec<String> {
    match self {
      AddressList::One(a) => vec![a.clone()],
      AddressList::Many(v) => v.clone(),
    }
  }
}

fn default_retries() -> i32 {
  -1
}

fn default_runtime_name() -> String {
  "gateway".to_string()
}

/// Arguments of the gateway streamer facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStreamerConfig {
  /// `node -> [downstream nodes]`, with `start-gateway` and `end-gateway`
  /// as sentinels.
  #[serde(default)]
  pub graph_representation: BTreeMap<String, Vec<String>>,
  /// Head addresses of every deployment.
  #[serde(default)]
  pub executor_addresses: BTreeMap<String, AddressList>,
  /// Filter conditions by node.
  #[serde(default)]
  pub graph_conditions: BTreeMap<String, Value>,
  /// Metadata attached to the RPCs of a node.
  #[serde(default)]
  pub deployments_metadata: BTreeMap<String, BTreeMap<String, String>>,
  /// Nodes that do not reduce their partial inputs.
  #[serde(default)]
  pub deployments_no_reduce: Vec<String>,
  /// Per RPC timeout in milliseconds.
  #[serde(default)]
  pub timeout_send: Option<u64>,
  /// Retry budget of each RPC.
  #[serde(default = "default_retries")]
  pub retries: i32,
  /// Compression of request bodies.
  #[serde(default)]
  pub compression: Compression,
  /// In-flight window of the request streamer. Zero disables the bound.
  #[serde(default)]
  pub prefetch: usize,
  /// Name used in logs.
  #[serde(default = "default_runtime_name")]
  pub runtime_name: String,
}

impl Default for GatewayStreamerConfig {
  fn default() -> Self {
    Self {
      graph_representation: BTreeMap::new(),
      executor_addresses: BTreeMap::new(),
      graph_conditions: BTreeMap::new(),
      deployments_metadata: BTreeMap::new(),
      deployments_no_reduce: Vec::new(),
      timeout_send: None,
      retries: default_retries(),
      compression: Compression::None,
      prefetch: 0,
      runtime_name: default_runtime_name(),
    }
  }
}

impl GatewayStreamerConfig {
  /// Adds an edge `from -> to`.
  #[must_use]
  pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
    self
      .graph_representation
      .entry(from.into())
      .or_default()
      .push(to.into());
    self
  }

  /// Declares a node with no downstream, which makes it floating.
  #[must_use]
  pub fn with_leaf(mut self, node: impl Into<String>) -> Self {
    self.graph_representation.entry(node.into()).or_default();
    self
  }

  /// Sets the addresses of a deployment.
  #[must_use]
  pub fn with_addresses<I, S>(mut self, deployment: impl Into<String>, addresses: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.executor_addresses.insert(
      deployment.into(),
      AddressList::Many(addresses.into_iter().map(Into::into).collect()),
    );
    self
  }

  /// Sets the filter condition of a node.
  #[must_use]
  pub fn with_condition(mut self, node: impl Into<String>, condition: Value) -> Self {
    self.graph_conditions.insert(node.into(), condition);
    self
  }

  /// Sets the in-flight window.
  #[must_use]
  pub fn with_prefetch(mut self, prefetch: usize) -> Self {
    self.prefetch = prefetch;
    self
  }

  /// Sets the retry budget.
  #[must_use]
  pub fn with_retries(mut self, retries: i32) -> Self {
    self.retries = retries;
    self
  }

  /// Timeout of each RPC.
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_send.map(Duration::from_millis)
  }

  /// Reads the configuration from [`STREAMER_ARGS_ENV`].
  ///
  /// # Errors
  ///
  /// Fails when the variable is missing or is not valid JSON.
  pub fn from_env() -> Result<Self, GatewayError> {
    let raw = std::env::var(STREAMER_ARGS_ENV)
      .map_err(|_| GatewayError::Config(format!("{STREAMER_ARGS_ENV} is not set")))?;
    Self::from_json(&raw)
  }

  /// Parses the configuration from JSON.
  pub fn from_json(raw: &str) -> Result<Self, GatewayError> {
    serde_json::from_str(raw)
      .map_err(|e| GatewayError::Config(format!("invalid streamer arguments: {e}")))
  }

  /// JSON representation stored in [`STREAMER_ARGS_ENV`].
  pub fn to_env_value(&self) -> Result<String, GatewayError> {
    Ok(serde_json::to_string(self)?)
  }

  /// Stores the configuration in [`STREAMER_ARGS_ENV`] for worker processes
  /// spawned afterwards.
  pub fn set_env(&self) -> Result<(), GatewayError> {
    let value = self.to_env_value()?;
    // SAFETY: called during startup, before worker threads read the
    // environment.
    unsafe { std::env::set_var(STREAMER_ARGS_ENV, value) };
    Ok(())
  }
}

fn default_reduce() -> bool {
  true
}

/// Configuration of a deployment head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadConfig {
  /// Deployment name.
  pub name: String,
  /// Worker addresses by shard id.
  #[serde(default)]
  pub connection_list: BTreeMap<u32, Vec<String>>,
  /// Address of the executor run before the shards.
  #[serde(default)]
  pub uses_before: Option<String>,
  /// Address of the executor run after the shards.
  #[serde(default)]
  pub uses_after: Option<String>,
  /// Polling per endpoint.
  #[serde(default)]
  pub polling: PollingConfig,
  /// Whether shard responses are reduced.
  #[serde(default = "default_reduce")]
  pub reduce: bool,
  /// Per RPC timeout in milliseconds.
  #[serde(default)]
  pub timeout_send: Option<u64>,
  /// Retry budget.
  #[serde(default = "default_retries")]
  pub retries: i32,
  /// Compression of request bodies.
  #[serde(default)]
  pub compression: Compression,
}

impl HeadConfig {
  /// Creates a head configuration for `name` without shards.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      connection_list: BTreeMap::new(),
      uses_before: None,
      uses_after: None,
      polling: PollingConfig::default(),
      reduce: true,
      timeout_send: None,
      retries: default_retries(),
      compression: Compression::None,
    }
  }

  /// Adds a replica to a shard.
  #[must_use]
  pub fn with_shard_replica(mut self, shard_id: u32, address: impl Into<String>) -> Self {
    self.connection_list.entry(shard_id).or_default().push(address.into());
    self
  }

  /// Sets the polling configuration.
  #[must_use]
  pub fn with_polling(mut self, polling: PollingConfig) -> Self {
    self.polling = polling;
    self
  }

  /// Sets the uses_before address.
  #[must_use]
  pub fn with_uses_before(mut self, address: impl Into<String>) -> Self {
    self.uses_before = Some(address.into());
    self
  }

  /// Sets the uses_after address.
  #[must_use]
  pub fn with_uses_after(mut self, address: impl Into<String>) -> Self {
    self.uses_after = Some(address.into());
    self
  }

  /// Enables or disables reduction.
  #[must_use]
  pub fn with_reduce(mut self, reduce: bool) -> Self {
    self.reduce = reduce;
    self
  }

  /// Timeout of each RPC.
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_send.map(Duration::from_millis)
  }
}

/// Configuration of a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
  /// Deployment name, used to scope parameters and name results.
  pub name: String,
  /// Batching by endpoint path or by function name.
  #[serde(default)]
  pub dynamic_batching: BTreeMap<String, DynamicBatchingConfig>,
}

impl WorkerConfig {
  /// Creates a worker configuration for deployment `name`.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      dynamic_batching: BTreeMap::new(),
    }
  }

  /// Batches `key`, an endpoint path or a function name.
  #[must_use]
  pub fn with_batching(mut self, key: impl Into<String>, config: DynamicBatchingConfig) -> Self {
    self.dynamic_batching.insert(key.into(), config);
    self
  }
}

/// Configuration of the HTTP gateway.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
  /// Interval of SSE keep-alive comments.
  pub sse_keepalive: Duration,
  /// Enables `/ping` and `text/csv` request bodies.
  pub managed_inference: bool,
  /// Validates posted documents against discovered input schemas.
  pub validate_input: bool,
}

impl Default for HttpServerConfig {
  fn default() -> Self {
    Self {
      sse_keepalive: Duration::from_secs(15),
      managed_inference: false,
      validate_input: true,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_compression_parsing_is_case_insensitive() {
    assert_eq!("GZIP".parse::<Compression>().unwrap(), Compression::Gzip);
    assert_eq!("Deflate".parse::<Compression>().unwrap(), Compression::Deflate);
    assert_eq!("NONE".parse::<Compression>().unwrap(), Compression::None);
    assert!("brotli".parse::<Compression>().is_err());
  }

  #[test]
  fn test_streamer_config_from_json() {
    let raw = json!({
      "graph_representation": {"start-gateway": ["a"], "a": ["end-gateway"]},
      "executor_addresses": {"a": "grpc://127.0.0.1:1234", "b": ["x:1", "y:2"]},
      "compression": "gzip",
      "timeout_send": 250
    })
    .to_string();
    let cfg = GatewayStreamerConfig::from_json(&raw).unwrap();
    assert_eq!(cfg.compression, Compression::Gzip);
    assert_eq!(cfg.retries, -1);
    assert_eq!(cfg.timeout(), Some(Duration::from_millis(250)));
    assert_eq!(cfg.executor_addresses["a"].to_vec(), vec!["grpc://127.0.0.1:1234"]);
    assert_eq!(cfg.executor_addresses["b"].to_vec().len(), 2);
  }

  #[test]
  fn test_streamer_config_round_trips_through_env_value() {
    let cfg = GatewayStreamerConfig::default()
      .with_edge("start-gateway", "a")
      .with_edge("a", "end-gateway")
      .with_addresses("a", ["127.0.0.1:1"])
      .with_prefetch(4);
    let back = GatewayStreamerConfig::from_json(&cfg.to_env_value().unwrap()).unwrap();
    assert_eq!(back.graph_representation, cfg.graph_representation);
    assert_eq!(back.prefetch, 4);
  }

  #[test]
  fn test_head_config_shard_keys_from_strings() {
    let cfg: HeadConfig = serde_json::from_value(json!({
      "name": "enc",
      "connection_list": {"0": ["a:1"], "1": ["b:1", "c:1"]},
      "polling": "ALL"
    }))
    .unwrap();
    assert_eq!(cfg.connection_list[&1].len(), 2);
    assert!(cfg.reduce);
  }
}
