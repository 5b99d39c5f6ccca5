//! # Executor
//!
//! The user code a worker hosts. An executor binds functions to endpoints and
//! is called with the documents and the (scoped) parameters of a request.

use crate::batching::DynamicBatchingConfig;
use crate::error::ExecutorError;
use crate::message::{DocBatch, Document, EndpointSchema, Parameters};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// Stream of documents yielded by a generator endpoint.
pub type GeneratedDocs = BoxStream<'static, Result<Document, ExecutorError>>;

/// What an executor function produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
  /// The documents were modified in place.
  InPlace,
  /// New documents replacing the input.
  Docs(DocBatch),
  /// A result map stored under the deployment name in the response results.
  Results(Value),
}

/// One endpoint bound by an executor.
#[derive(Debug, Clone)]
pub struct EndpointBinding {
  /// Endpoint path, e.g. `/encode`.
  pub endpoint: String,
  /// Name of the bound function.
  pub function: String,
  /// Declared input and output models.
  pub schema: EndpointSchema,
  /// Batching declared with the function.
  pub batching: Option<DynamicBatchingConfig>,
}

impl EndpointBinding {
  /// Binds `function` to `endpoint` with an empty schema.
  pub fn new(endpoint: impl Into<String>, function: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      function: function.into(),
      schema: EndpointSchema::default(),
      batching: None,
    }
  }

  /// Sets the declared schema.
  #[must_use]
  pub fn with_schema(mut self, schema: EndpointSchema) -> Self {
    self.schema = schema;
    self
  }

  /// Declares dynamic batching.
  #[must_use]
  pub fn with_batching(mut self, batching: DynamicBatchingConfig) -> Self {
    self.batching = Some(batching);
    self
  }
}

/// User code hosted by a worker.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
  /// Endpoints the executor binds.
  fn endpoints(&self) -> Vec<EndpointBinding>;

  /// Runs the function bound to `endpoint`.
  ///
  /// # Errors
  ///
  /// The failure is reported to the caller in `header.status`.
  async fn call(
    &self,
    endpoint: &str,
    docs: &mut DocBatch,
    parameters: &Parameters,
  ) -> Result<CallOutput, ExecutorError>;

  /// Runs a generator endpoint for one document.
  async fn stream_doc(
    &self,
    endpoint: &str,
    _doc: Document,
    _parameters: &Parameters,
  ) -> Result<GeneratedDocs, ExecutorError> {
    Err(ExecutorError::new(
      "NotImplementedError",
      format!("endpoint `{endpoint}` is not a generator"),
    ))
  }

  /// Weight of one document when batching with a custom metric.
  fn doc_metric(&self, _endpoint: &str, _doc: &Document) -> f64 {
    1.0
  }
}
