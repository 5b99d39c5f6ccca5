//! Direct client of one deployment, bypassing the topology graph.

use super::streamer::{DocItems, unpack_streamed};
use crate::config::ConnectionPoolConfig;
use crate::error::{GatewayError, RpcError};
use crate::message::{DataRequest, DocBatch, Document, Parameters, SingleDocumentRequest};
use crate::networking::{ChannelFactory, ConnectionPool, Role, SendOptions};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Client of the head of one deployment.
pub struct ExecutorStreamer {
  deployment: String,
  pool: ConnectionPool,
  timeout: Option<Duration>,
}

impl ExecutorStreamer {
  /// Connects to the head replicas of `deployment`.
  ///
  /// # Errors
  ///
  /// A malformed address.
  pub async fn new<I, S>(
    deployment: impl Into<String>,
    addresses: I,
    factory: Arc<dyn ChannelFactory>,
    config: ConnectionPoolConfig,
  ) -> Result<Self, RpcError>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let deployment = deployment.into();
    let pool = ConnectionPool::new(format!("client/{deployment}"), factory, config);
    for address in addresses {
      pool
        .add_connection(&deployment, address.as_ref(), Role::Head, None)
        .await?;
    }
    Ok(Self {
      deployment,
      pool,
      timeout: None,
    })
  }

  /// Sets the deadline of each call.
  #[must_use]
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  fn options(&self, endpoint: &str) -> SendOptions {
    SendOptions::default()
      .with_endpoint(endpoint)
      .with_timeout(self.timeout)
  }

  /// Sends `docs` to `endpoint` and returns the processed documents.
  ///
  /// # Errors
  ///
  /// Transport failures, and the executor failure reported by the response.
  pub async fn post(&self, endpoint: &str, docs: DocBatch, parameters: Parameters) -> Result<DocBatch, GatewayError> {
    let request = DataRequest::new()
      .with_endpoint(endpoint)
      .with_parameters(parameters)
      .with_docs(docs);
    debug!(deployment = %self.deployment, %endpoint, request_id = %request.request_id(), "posting to deployment");
    let (mut response, _) = self
      .pool
      .send_requests_once(vec![request], &self.deployment, self.options(endpoint))
      .await?;
    if let Some(exception) = response.executor_error() {
      return Err(GatewayError::Executor(exception));
    }
    Ok(response.replace_docs(DocBatch::new()))
  }

  /// Streams the documents generated by `endpoint` for `doc`.
  ///
  /// # Errors
  ///
  /// Transport failures until the stream is opened.
  pub async fn stream_doc(&self, doc: Document, endpoint: &str, parameters: Parameters) -> Result<DocItems, GatewayError> {
    let mut request = SingleDocumentRequest::new(doc).with_endpoint(endpoint);
    request.parameters = parameters;
    let items = self
      .pool
      .send_single_document_request(request, &self.deployment, self.options(endpoint))
      .await?;
    Ok(items.map(unpack_streamed).boxed())
  }

  /// Closes the channels.
  pub async fn close(&self) {
    self.pool.close().await;
  }
}
