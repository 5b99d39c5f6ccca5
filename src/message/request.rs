//! # Request Envelopes
//!
//! Three envelopes travel over the RPC surface:
//!
//! - [`DataRequest`]: header, parameters, routes and a batch of documents.
//! - [`SingleDocumentRequest`]: the same header with exactly one document, used
//!   by server-streaming endpoints.
//! - [`ControlRequest`]: status and membership commands between runtimes.
//!
//! All envelopes serialize to JSON and round-trip losslessly.

use super::document::{DocBatch, Document, new_id};
use super::params::Parameters;
use super::schema::DEFAULT_ENDPOINT;
use super::status::{Route, Status, StatusCode};
use crate::error::{ExecutorError, GatewayError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Route name used by the gateway itself.
pub const GATEWAY_ROUTE: &str = "gateway";

/// Request header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
  /// Opaque id, unique within a client stream.
  #[serde(default)]
  pub request_id: String,
  /// Endpoint path such as `/search`. Empty means the default endpoint.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub exec_endpoint: String,
  /// Regular expression restricting which deployments process the request.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub target_executor: String,
  /// Processing outcome.
  #[serde(default)]
  pub status: Status,
}

/// Payload of a [`DataRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBody {
  /// Documents.
  #[serde(default)]
  pub docs: DocBatch,
}

/// A batch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
  /// Header.
  #[serde(default)]
  pub header: Header,
  /// Parameters, see [`crate::message::params`].
  #[serde(default)]
  pub parameters: Parameters,
  /// Executed hops, in order.
  #[serde(default)]
  pub routes: Vec<Route>,
  /// Documents.
  #[serde(default)]
  pub data: DataBody,
  /// Side-channel results returned by deployments, keyed by deployment name.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub results: BTreeMap<String, Value>,
}

impl DataRequest {
  /// Creates an empty request with a generated id.
  pub fn new() -> Self {
    let mut req = Self::default();
    req.header.request_id = new_id();
    req
  }

  /// Sets the documents.
  #[must_use]
  pub fn with_docs(mut self, docs: impl Into<DocBatch>) -> Self {
    self.data.docs = docs.into();
    self
  }

  /// Sets the endpoint.
  #[must_use]
  pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.header.exec_endpoint = endpoint.into();
    self
  }

  /// Sets the parameters.
  #[must_use]
  pub fn with_parameters(mut self, parameters: Parameters) -> Self {
    self.parameters = parameters;
    self
  }

  /// Sets the request id.
  #[must_use]
  pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
    self.header.request_id = request_id.into();
    self
  }

  /// Sets the target executor pattern.
  #[must_use]
  pub fn with_target_executor(mut self, pattern: impl Into<String>) -> Self {
    self.header.target_executor = pattern.into();
    self
  }

  /// Request id.
  pub fn request_id(&self) -> &str {
    &self.header.request_id
  }

  /// Generates a request id when none is set.
  pub fn ensure_request_id(&mut self) {
    if self.header.request_id.is_empty() {
      self.header.request_id = new_id();
    }
  }

  /// Endpoint, with the empty string mapped to the default endpoint.
  pub fn endpoint(&self) -> &str {
    if self.header.exec_endpoint.is_empty() {
      DEFAULT_ENDPOINT
    } else {
      &self.header.exec_endpoint
    }
  }

  /// Documents.
  pub fn docs(&self) -> &DocBatch {
    &self.data.docs
  }

  /// Documents, mutably.
  pub fn docs_mut(&mut self) -> &mut DocBatch {
    &mut self.data.docs
  }

  /// Replaces the documents, returning the previous ones.
  pub fn replace_docs(&mut self, docs: DocBatch) -> DocBatch {
    std::mem::replace(&mut self.data.docs, docs)
  }

  /// Whether the header reports an error.
  pub fn is_error(&self) -> bool {
    self.header.status.is_error()
  }

  /// Records a hop for `executor`, starting now, and returns it.
  pub fn add_route(&mut self, executor: impl Into<String>) -> &mut Route {
    self.routes.push(Route::start(executor));
    let last = self.routes.len() - 1;
    &mut self.routes[last]
  }

  /// The most recent route of `executor`.
  pub fn last_route_mut(&mut self, executor: &str) -> Option<&mut Route> {
    self.routes.iter_mut().rev().find(|r| r.executor == executor)
  }

  /// Marks the request as failed by `exception` and records it on the last
  /// route of `executor`, if any.
  pub fn add_exception(&mut self, exception: ExecutorError) {
    let status = Status::error(exception.clone());
    if let Some(route) = self.last_route_mut(&exception.executor) {
      route.status = Some(status.clone());
    }
    self.header.status = status;
  }

  /// Marks the request as failed by a gateway-side error.
  pub fn add_error(&mut self, err: &GatewayError, executor: &str) {
    let exception = match err {
      GatewayError::Executor(e) => e.clone(),
      other => ExecutorError::new(other.kind_name(), other.to_string()).with_executor(executor),
    };
    self.add_exception(exception);
  }

  /// Converts the structured error status into an [`ExecutorError`].
  pub fn executor_error(&self) -> Option<ExecutorError> {
    if self.header.status.code != StatusCode::Error {
      return None;
    }
    Some(self.header.status.exception.clone().unwrap_or_else(|| {
      ExecutorError::new("UnknownError", self.header.status.description.clone())
    }))
  }
}

/// Payload of a [`SingleDocumentRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleDocBody {
  /// The document.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub doc: Option<Document>,
}

/// A request carrying one document, used for server streaming.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleDocumentRequest {
  /// Header.
  #[serde(default)]
  pub header: Header,
  /// Parameters.
  #[serde(default)]
  pub parameters: Parameters,
  /// Executed hops.
  #[serde(default)]
  pub routes: Vec<Route>,
  /// The document.
  #[serde(default)]
  pub data: SingleDocBody,
}

impl SingleDocumentRequest {
  /// Creates a request for `doc` with a generated id.
  pub fn new(doc: Document) -> Self {
    let mut req = Self::default();
    req.header.request_id = new_id();
    req.data.doc = Some(doc);
    req
  }

  /// Sets the endpoint.
  #[must_use]
  pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.header.exec_endpoint = endpoint.into();
    self
  }

  /// Endpoint, with the empty string mapped to the default endpoint.
  pub fn endpoint(&self) -> &str {
    if self.header.exec_endpoint.is_empty() {
      DEFAULT_ENDPOINT
    } else {
      &self.header.exec_endpoint
    }
  }

  /// Whether the header reports an error.
  pub fn is_error(&self) -> bool {
    self.header.status.is_error()
  }
}

/// Command carried by a [`ControlRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
  /// Report status.
  Status,
  /// Add the related entities.
  Activate,
  /// Remove the related entities.
  Deactivate,
  /// Stop the runtime.
  Terminate,
}

/// A peer referenced by a control command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
  /// Entity id.
  pub id: String,
  /// Host.
  pub address: String,
  /// Port.
  pub port: u16,
  /// Shard the entity serves, if sharded.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub shard_id: Option<u32>,
}

impl RelatedEntity {
  /// `host:port` of the entity.
  pub fn host_port(&self) -> String {
    format!("{}:{}", self.address, self.port)
  }
}

/// A control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
  /// Header.
  #[serde(default)]
  pub header: Header,
  /// Command.
  pub command: ControlCommand,
  /// Entities the command refers to.
  #[serde(default)]
  pub related_entities: Vec<RelatedEntity>,
}

impl ControlRequest {
  /// Creates a control request.
  pub fn new(command: ControlCommand) -> Self {
    let mut header = Header::default();
    header.request_id = new_id();
    Self {
      header,
      command,
      related_entities: Vec::new(),
    }
  }
}

/// Answer to a `status` call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusInfo {
  /// Component versions.
  #[serde(rename = "jina_version_info", default)]
  pub version_info: BTreeMap<String, String>,
  /// Environment of the process.
  #[serde(default)]
  pub env_info: BTreeMap<String, String>,
}

impl StatusInfo {
  /// Status of the current process.
  pub fn current() -> Self {
    let mut version_info = BTreeMap::new();
    version_info.insert("flowgate".to_string(), env!("CARGO_PKG_VERSION").to_string());
    version_info.insert("os".to_string(), std::env::consts::OS.to_string());
    version_info.insert("arch".to_string(), std::env::consts::ARCH.to_string());

    let mut env_info = BTreeMap::new();
    for key in ["RUST_LOG", "LOG_FORMAT", "JINA_STREAMER_ARGS"] {
      env_info.insert(key.to_string(), std::env::var(key).unwrap_or_default());
    }
    Self {
      version_info,
      env_info,
    }
  }
}

/// Builds the envelope posted by HTTP clients: `{data, parameters, header}`.
pub fn request_from_parts(
  docs: DocBatch,
  parameters: Option<Map<String, Value>>,
  endpoint: &str,
  request_id: Option<String>,
  target_executor: Option<String>,
) -> DataRequest {
  let mut req = DataRequest::new()
    .with_docs(docs)
    .with_endpoint(endpoint)
    .with_parameters(parameters.unwrap_or_default());
  if let Some(id) = request_id.filter(|id| !id.is_empty()) {
    req.header.request_id = id;
  }
  if let Some(target) = target_executor {
    req.header.target_executor = target;
  }
  req
}
