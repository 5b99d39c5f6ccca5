//! # Error Taxonomy
//!
//! Error types shared by every layer of the gateway: the transport
//! ([`RpcError`]), graph construction ([`GraphError`]), executors
//! ([`ExecutorError`]), dynamic batching ([`BatchQueueError`]) and the
//! crate-level aggregate [`GatewayError`].
//!
//! ## Classification
//!
//! - **Configuration**: cyclic graph, schema mismatch, duplicate edge, unknown
//!   deployment. Fatal at startup.
//! - **Transient network**: `Unavailable`. Retried by the connection pool.
//! - **Timeout**: `DeadlineExceeded`. Surfaced per node, never retried.
//! - **Not found**: the downstream is reachable but does not serve the call.
//! - **Executor**: structured `{name, args, stacks, executor}` failure.
//! - **Batch queue**: output length mismatch or wrong container type.
//! - **Cancellation**: propagated, never treated as failure.
//!
//! All errors are `Clone` so a single failure can be delivered to every
//! waiter of a shared graph task or a batch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Status codes carried by transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
  /// The destination could not be reached.
  Unavailable,
  /// The call did not complete before its deadline.
  DeadlineExceeded,
  /// The destination is reachable but does not serve the call.
  NotFound,
  /// The call was cancelled.
  Cancelled,
  /// Malformed request.
  InvalidArgument,
  /// Internal failure on the remote side.
  Internal,
  /// Anything that could not be classified.
  Unknown,
}

impl RpcCode {
  /// Only `Unavailable` is retried by the connection pool.
  pub fn is_retryable(self) -> bool {
    matches!(self, RpcCode::Unavailable)
  }

  /// Canonical upper-case name of the code.
  pub fn as_str(self) -> &'static str {
    match self {
      RpcCode::Unavailable => "UNAVAILABLE",
      RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
      RpcCode::NotFound => "NOT_FOUND",
      RpcCode::Cancelled => "CANCELLED",
      RpcCode::InvalidArgument => "INVALID_ARGUMENT",
      RpcCode::Internal => "INTERNAL",
      RpcCode::Unknown => "UNKNOWN",
    }
  }

  /// HTTP status used when a code crosses the RPC server boundary.
  pub fn http_status(self) -> u16 {
    match self {
      RpcCode::Unavailable => 503,
      RpcCode::DeadlineExceeded => 504,
      RpcCode::NotFound => 404,
      RpcCode::Cancelled => 499,
      RpcCode::InvalidArgument => 400,
      RpcCode::Internal | RpcCode::Unknown => 500,
    }
  }

  /// Inverse of [`RpcCode::http_status`], used by clients that did not get a
  /// structured error body.
  pub fn from_http_status(status: u16) -> Self {
    match status {
      503 | 502 => RpcCode::Unavailable,
      504 | 408 => RpcCode::DeadlineExceeded,
      404 => RpcCode::NotFound,
      499 => RpcCode::Cancelled,
      400 | 415 | 422 => RpcCode::InvalidArgument,
      500 => RpcCode::Internal,
      _ => RpcCode::Unknown,
    }
  }
}

impl fmt::Display for RpcCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A failed RPC, annotated with the addresses that were tried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {details}{}", format_dest(.dest_addr))]
pub struct RpcError {
  /// Classified status code.
  pub code: RpcCode,
  /// Human readable details, enriched as the error travels up.
  pub details: String,
  /// Every address that was contacted before giving up.
  #[serde(default)]
  pub dest_addr: Vec<String>,
  /// Request the failure belongs to, when known.
  #[serde(default)]
  pub request_id: Option<String>,
}

fn format_dest(addrs: &[String]) -> String {
  if addrs.is_empty() {
    String::new()
  } else {
    format!(" (address(es): {})", addrs.join(", "))
  }
}

impl RpcError {
  /// Creates an error with the given code and details.
  pub fn new(code: RpcCode, details: impl Into<String>) -> Self {
    Self {
      code,
      details: details.into(),
      dest_addr: Vec::new(),
      request_id: None,
    }
  }

  /// Shorthand for an `Unavailable` error.
  pub fn unavailable(details: impl Into<String>) -> Self {
    Self::new(RpcCode::Unavailable, details)
  }

  /// Shorthand for a `DeadlineExceeded` error.
  pub fn deadline_exceeded(details: impl Into<String>) -> Self {
    Self::new(RpcCode::DeadlineExceeded, details)
  }

  /// Shorthand for a `NotFound` error.
  pub fn not_found(details: impl Into<String>) -> Self {
    Self::new(RpcCode::NotFound, details)
  }

  /// Shorthand for an `Internal` error.
  pub fn internal(details: impl Into<String>) -> Self {
    Self::new(RpcCode::Internal, details)
  }

  /// Shorthand for an `InvalidArgument` error.
  pub fn invalid_argument(details: impl Into<String>) -> Self {
    Self::new(RpcCode::InvalidArgument, details)
  }

  /// Replaces the list of tried addresses.
  #[must_use]
  pub fn with_dest_addr<I, S>(mut self, addrs: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.dest_addr = addrs.into_iter().map(Into::into).collect();
    self
  }

  /// Attaches the id of the request that failed.
  #[must_use]
  pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
    let request_id = request_id.into();
    if !request_id.is_empty() {
      self.request_id = Some(request_id);
    }
    self
  }

  /// Appends context to the details.
  #[must_use]
  pub fn with_context(mut self, context: impl AsRef<str>) -> Self {
    self.details.push_str(context.as_ref());
    self
  }
}

/// A structured failure raised inside an executor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Error, Serialize, Deserialize)]
#[error("{name} raised by executor `{executor}`: {}", .args.join(", "))]
pub struct ExecutorError {
  /// Exception type name.
  pub name: String,
  /// Exception arguments.
  #[serde(default)]
  pub args: Vec<String>,
  /// Stack trace lines.
  #[serde(default)]
  pub stacks: Vec<String>,
  /// Name of the executor that raised it.
  #[serde(default)]
  pub executor: String,
}

impl ExecutorError {
  /// Creates an executor error with a single argument.
  pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      args: vec![message.into()],
      stacks: Vec::new(),
      executor: String::new(),
    }
  }

  /// Sets the executor the error is attributed to.
  #[must_use]
  pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
    self.executor = executor.into();
    self
  }

  /// Adds stack trace lines.
  #[must_use]
  pub fn with_stacks<I, S>(mut self, stacks: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.stacks = stacks.into_iter().map(Into::into).collect();
    self
  }
}

/// Errors detected while compiling or validating a topology graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  /// The graph description contains a cycle through the listed nodes.
  #[error("graph contains a cycle through: {}", .0.join(" -> "))]
  Cycle(Vec<String>),

  /// A condition, metadata entry or address refers to an unknown node.
  #[error("unknown deployment `{0}`")]
  UnknownNode(String),

  /// The same edge is declared twice.
  #[error("duplicate edge `{from}` -> `{to}`")]
  DuplicateEdge {
    /// Upstream node.
    from: String,
    /// Downstream node.
    to: String,
  },

  /// A node name collides with a reserved name.
  #[error("`{0}` is a reserved node name")]
  ReservedName(String),

  /// Adjacent nodes disagree on the document type of an endpoint.
  #[error(
    "schema mismatch on endpoint `{endpoint}`: output of `{upstream}` ({output}) is not compatible with input of `{downstream}` ({input})"
  )]
  SchemaMismatch {
    /// Endpoint the mismatch was found on.
    endpoint: String,
    /// Upstream deployment.
    upstream: String,
    /// Downstream deployment.
    downstream: String,
    /// Name of the upstream output model.
    output: String,
    /// Name of the downstream input model.
    input: String,
  },

  /// A filter condition could not be parsed.
  #[error("invalid filter condition for `{node}`: {reason}")]
  InvalidFilter {
    /// Node the condition belongs to.
    node: String,
    /// Why it was rejected.
    reason: String,
  },

  /// A target-executor pattern is not a valid regular expression.
  #[error("invalid target executor pattern `{pattern}`: {reason}")]
  InvalidPattern {
    /// The pattern as received.
    pattern: String,
    /// Compiler message.
    reason: String,
  },
}

/// Errors delivered to callers of a dynamic batch queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchQueueError {
  /// The user function returned a different number of documents.
  #[error(
    "dynamic batching function returned {actual} documents for a batch of {expected}; the output must have the same length as the input or be modified in place"
  )]
  OutputLengthMismatch {
    /// Documents in the sub-batch.
    expected: usize,
    /// Documents returned.
    actual: usize,
  },

  /// The user function returned something other than documents.
  #[error("dynamic batching function must return documents or modify them in place")]
  WrongOutputType,

  /// The user function failed.
  #[error(transparent)]
  Executor(#[from] ExecutorError),

  /// The queue was closed before the request could be flushed.
  #[error("batch queue is closed")]
  Closed,

  /// Invalid batching configuration.
  #[error("invalid dynamic batching configuration: {0}")]
  InvalidConfig(String),
}

/// Crate-level error.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
  /// Transport failure.
  #[error(transparent)]
  Rpc(#[from] RpcError),

  /// Graph configuration error.
  #[error(transparent)]
  Graph(#[from] GraphError),

  /// Structured executor failure.
  #[error(transparent)]
  Executor(#[from] ExecutorError),

  /// Dynamic batching failure.
  #[error(transparent)]
  BatchQueue(#[from] BatchQueueError),

  /// No worker produced a response.
  #[error("no response: {0}")]
  NoResponse(String),

  /// The operation was cancelled.
  #[error("operation cancelled")]
  Cancelled,

  /// A payload could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(String),

  /// Invalid configuration outside of the graph itself.
  #[error("configuration error: {0}")]
  Config(String),

  /// I/O failure.
  #[error("I/O error: {0}")]
  Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for GatewayError {
  fn from(err: std::io::Error) -> Self {
    GatewayError::Io(Arc::new(err))
  }
}

impl From<serde_json::Error> for GatewayError {
  fn from(err: serde_json::Error) -> Self {
    GatewayError::Serialization(err.to_string())
  }
}

impl GatewayError {
  /// HTTP status code used by the HTTP and SSE surfaces.
  pub fn http_status(&self) -> u16 {
    match self {
      GatewayError::Rpc(err) => match err.code {
        RpcCode::Unavailable => 503,
        RpcCode::DeadlineExceeded => 504,
        _ => 500,
      },
      GatewayError::Executor(_) => 499,
      GatewayError::BatchQueue(BatchQueueError::Executor(_)) => 499,
      _ => 500,
    }
  }

  /// Transport code of the error, if it came from the transport.
  pub fn rpc_code(&self) -> Option<RpcCode> {
    match self {
      GatewayError::Rpc(err) => Some(err.code),
      GatewayError::Cancelled => Some(RpcCode::Cancelled),
      _ => None,
    }
  }

  /// Converts the error into the transport representation.
  pub fn into_rpc(self) -> RpcError {
    match self {
      GatewayError::Rpc(err) => err,
      GatewayError::Cancelled => RpcError::new(RpcCode::Cancelled, "operation cancelled"),
      GatewayError::Serialization(msg) => RpcError::invalid_argument(msg),
      other => RpcError::internal(other.to_string()),
    }
  }

  /// Short name of the error kind, used as the exception name in envelopes.
  pub fn kind_name(&self) -> &'static str {
    match self {
      GatewayError::Rpc(_) => "InternalNetworkError",
      GatewayError::Graph(_) => "GraphError",
      GatewayError::Executor(_) => "ExecutorError",
      GatewayError::BatchQueue(_) => "BatchQueueError",
      GatewayError::NoResponse(_) => "NoResponseError",
      GatewayError::Cancelled => "Cancelled",
      GatewayError::Serialization(_) => "SerializationError",
      GatewayError::Config(_) => "ConfigError",
      GatewayError::Io(_) => "IoError",
    }
  }
}

/// Result alias used throughout the crate.
pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
