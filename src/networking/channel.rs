//! # RPC Channels
//!
//! Two traits sit at the transport seam:
//!
//! - [`RpcService`] is the server side of the RPC surface. Heads, workers and
//!   the gateway itself implement it.
//! - [`RpcChannel`] is a client connection to one replica. The connection
//!   pool only ever talks to replicas through this trait, so the transport
//!   (in-process or HTTP/2) is chosen by the [`ChannelFactory`] handed to the
//!   pool.

use crate::config::Compression;
use crate::error::RpcError;
use crate::message::{DataRequest, EndpointsInfo, SingleDocumentRequest, StatusInfo};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Call and trailing metadata.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key carrying the endpoint of a call.
pub const ENDPOINT_KEY: &str = "endpoint";

/// Trailing metadata key set when the response carries an error status.
pub const IS_ERROR_KEY: &str = "is-error";

/// Stream of requests sent to [`RpcService::stream`].
pub type RequestStream = BoxStream<'static, DataRequest>;

/// Stream of responses returned by [`RpcService::stream`].
pub type ResponseStream = BoxStream<'static, Result<DataRequest, RpcError>>;

/// Stream of documents returned by a server-streaming endpoint.
pub type DocStream = BoxStream<'static, Result<SingleDocumentRequest, RpcError>>;

/// Server side of the RPC surface.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
  /// Processes the partial requests of one logical request.
  async fn process_data(
    &self,
    requests: Vec<DataRequest>,
    metadata: Metadata,
  ) -> Result<(DataRequest, Metadata), RpcError>;

  /// Processes a single request.
  async fn process_single_data(
    &self,
    request: DataRequest,
    metadata: Metadata,
  ) -> Result<(DataRequest, Metadata), RpcError> {
    self.process_data(vec![request], metadata).await
  }

  /// Processes a stream of requests one after the other.
  async fn stream(
    self: Arc<Self>,
    requests: RequestStream,
    metadata: Metadata,
  ) -> Result<ResponseStream, RpcError> {
    let service = self;
    let responses = requests.then(move |request| {
      let service = Arc::clone(&service);
      let metadata = metadata.clone();
      async move {
        service
          .process_single_data(request, metadata)
          .await
          .map(|(response, _)| response)
      }
    });
    Ok(responses.boxed())
  }

  /// Streams documents yielded for a single input document.
  async fn stream_single_document(
    &self,
    request: SingleDocumentRequest,
    _metadata: Metadata,
  ) -> Result<DocStream, RpcError> {
    Err(RpcError::not_found(format!(
      "endpoint `{}` does not stream documents",
      request.endpoint()
    )))
  }

  /// Lists bound endpoints and their schemas.
  async fn endpoint_discovery(&self) -> Result<EndpointsInfo, RpcError>;

  /// Reports version and environment information.
  async fn status(&self) -> Result<StatusInfo, RpcError> {
    Ok(StatusInfo::current())
  }
}

/// Options of one call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
  /// Endpoint, forwarded as call metadata.
  pub endpoint: Option<String>,
  /// Extra call metadata.
  pub metadata: Metadata,
  /// Deadline of the call.
  pub timeout: Option<Duration>,
  /// Compression of the request body.
  pub compression: Compression,
}

impl CallOptions {
  /// Call metadata including the endpoint.
  pub fn call_metadata(&self) -> Metadata {
    let mut metadata = self.metadata.clone();
    if let Some(endpoint) = &self.endpoint {
      metadata.insert(ENDPOINT_KEY.to_string(), endpoint.clone());
    }
    metadata
  }
}

/// Client connection to one replica.
#[async_trait]
pub trait RpcChannel: Send + Sync {
  /// Address the channel is connected to.
  fn address(&self) -> &str;

  /// Sends the partial requests of one logical request.
  async fn send_requests(
    &self,
    requests: Vec<DataRequest>,
    options: &CallOptions,
  ) -> Result<(DataRequest, Metadata), RpcError>;

  /// Opens a bidirectional request stream.
  async fn send_stream(
    &self,
    requests: RequestStream,
    options: &CallOptions,
  ) -> Result<ResponseStream, RpcError>;

  /// Opens a server stream for one document.
  async fn send_single_document(
    &self,
    request: SingleDocumentRequest,
    options: &CallOptions,
  ) -> Result<DocStream, RpcError>;

  /// Asks the replica which endpoints it binds.
  async fn send_discover_endpoint(&self, timeout: Option<Duration>) -> Result<EndpointsInfo, RpcError>;

  /// Asks the replica for its status.
  async fn send_status(&self, timeout: Option<Duration>) -> Result<StatusInfo, RpcError>;

  /// Closes the channel, waiting at most `grace` for in-flight calls.
  async fn close(&self, grace: Duration);
}

/// Creates channels for the connection pool.
pub trait ChannelFactory: Send + Sync {
  /// Opens a channel to `address` of `deployment`.
  ///
  /// Channels connect lazily; creation fails only for malformed addresses.
  fn create(&self, address: &str, deployment: &str) -> Result<Arc<dyn RpcChannel>, RpcError>;
}

/// Host and port of an address, without scheme or trailing path.
///
/// # Examples
///
/// ```
/// use flowgate::networking::host_port;
///
/// assert_eq!(host_port("grpc://10.0.0.1:8080"), "10.0.0.1:8080");
/// assert_eq!(host_port("10.0.0.1:8080/"), "10.0.0.1:8080");
/// ```
pub fn host_port(address: &str) -> &str {
  let without_scheme = match address.find("://") {
    Some(pos) => &address[pos + 3..],
    None => address,
  };
  without_scheme.trim_end_matches('/')
}

/// Whether the address asks for TLS.
pub fn is_tls_address(address: &str) -> bool {
  address.starts_with("https://") || address.starts_with("grpcs://")
}

/// Awaits `call` within `timeout`, mapping expiry to `DeadlineExceeded`.
pub async fn with_deadline<T, F>(timeout: Option<Duration>, address: &str, call: F) -> Result<T, RpcError>
where
  F: std::future::Future<Output = Result<T, RpcError>>,
{
  match timeout {
    None => call.await,
    Some(limit) => match tokio::time::timeout(limit, call).await {
      Ok(result) => result,
      Err(_) => Err(
        RpcError::deadline_exceeded(format!("no response from {address} within {limit:?}"))
          .with_dest_addr([address]),
      ),
    },
  }
}
