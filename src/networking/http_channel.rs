//! # HTTP/2 Transport (client)
//!
//! Channels speaking the JSON-over-HTTP/2 RPC protocol served by
//! [`crate::networking::server`]. Each channel owns its own `hyper` client, so
//! resetting a channel drops its connections.

use super::channel::{
  CallOptions, ChannelFactory, DocStream, Metadata, RequestStream, ResponseStream, RpcChannel,
  host_port, is_tls_address, with_deadline,
};
use super::compression::compress;
use super::wire::{
  NDJSON, RpcBody, StreamLine, empty, encode_line, error_from_response, full, insert_metadata,
  metadata_from_headers, split_lines, streaming,
};
use crate::config::ConnectionPoolConfig;
use crate::error::{RpcCode, RpcError};
use crate::message::{DataRequest, EndpointsInfo, SingleDocumentRequest, StatusInfo};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Factory of HTTP/2 channels.
#[derive(Debug, Clone, Default)]
pub struct HttpChannelFactory {
  connect_timeout: Option<Duration>,
}

impl HttpChannelFactory {
  /// Creates a factory using the pool's connect timeout.
  pub fn new(config: &ConnectionPoolConfig) -> Self {
    Self {
      connect_timeout: Some(config.connect_timeout),
    }
  }
}

impl ChannelFactory for HttpChannelFactory {
  fn create(&self, address: &str, _deployment: &str) -> Result<Arc<dyn RpcChannel>, RpcError> {
    if is_tls_address(address) {
      return Err(RpcError::invalid_argument(format!(
        "`{address}` requires TLS, which the HTTP/2 transport does not provide"
      )));
    }
    let host_port = host_port(address);
    if host_port.is_empty() {
      return Err(RpcError::invalid_argument("empty address"));
    }
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.set_connect_timeout(self.connect_timeout);
    let client = Client::builder(TokioExecutor::new())
      .http2_only(true)
      .build(connector);
    Ok(Arc::new(HttpChannel {
      address: host_port.to_string(),
      base: format!("http://{host_port}"),
      client,
      closed: AtomicBool::new(false),
    }))
  }
}

/// Channel to one replica over HTTP/2.
pub struct HttpChannel {
  address: String,
  base: String,
  client: Client<HttpConnector, RpcBody>,
  closed: AtomicBool,
}

impl HttpChannel {
  fn check_open(&self) -> Result<(), RpcError> {
    if self.closed.load(Ordering::Acquire) {
      Err(RpcError::new(RpcCode::Cancelled, "channel closed").with_dest_addr([&self.address]))
    } else {
      Ok(())
    }
  }

  fn request(&self, path: &str, body: RpcBody, metadata: &Metadata) -> Result<Request<RpcBody>, RpcError> {
    let mut request = Request::builder()
      .method(Method::POST)
      .uri(format!("{}{path}", self.base))
      .header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
      .body(body)
      .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
    insert_metadata(request.headers_mut(), metadata);
    Ok(request)
  }

  async fn dispatch(&self, request: Request<RpcBody>) -> Result<Response<Incoming>, RpcError> {
    self.check_open()?;
    let response = self.client.request(request).await.map_err(|e| {
      let kind = if e.is_connect() { "connect" } else { "transport" };
      RpcError::unavailable(format!("{kind} error talking to {}: {e}", self.address))
        .with_dest_addr([&self.address])
    })?;
    if response.status().is_success() {
      return Ok(response);
    }
    let status = response.status().as_u16();
    let body = read_body(response.into_body(), &self.address).await?;
    Err(error_from_response(status, &body, &self.address))
  }

  async fn unary<T: DeserializeOwned>(
    &self,
    path: &str,
    body: Bytes,
    options: &CallOptions,
  ) -> Result<(T, Metadata), RpcError> {
    let body = compress(body, options.compression)
      .await
      .map_err(|e| RpcError::internal(format!("compression failed: {e}")))?;
    let mut request = self.request(path, full(body), &options.call_metadata())?;
    if let Some(encoding) = options.compression.content_encoding() {
      request
        .headers_mut()
        .insert(CONTENT_ENCODING, http::HeaderValue::from_static(encoding));
    }
    with_deadline(options.timeout, &self.address, async {
      let response = self.dispatch(request).await?;
      let metadata = metadata_from_headers(response.headers());
      let body = read_body(response.into_body(), &self.address).await?;
      let value = serde_json::from_slice(&body).map_err(|e| {
        RpcError::internal(format!("invalid response from {}: {e}", self.address))
          .with_dest_addr([&self.address])
      })?;
      Ok((value, metadata))
    })
    .await
  }

  fn line_stream<T>(&self, response: Response<Incoming>) -> futures::stream::BoxStream<'static, Result<T, RpcError>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    let address = self.address.clone();
    let chunks = response
      .into_body()
      .into_data_stream()
      .map(|chunk| chunk.map_err(|e| e.to_string()));
    split_lines(chunks)
      .map(move |line| {
        let line = line.map_err(|e| {
          RpcError::unavailable(format!("stream from {address} broke: {e}")).with_dest_addr([&address])
        })?;
        match serde_json::from_slice::<StreamLine<T>>(&line) {
          Ok(StreamLine::Item(item)) => Ok(item),
          Ok(StreamLine::Error { error }) => Err(error),
          Err(e) => Err(RpcError::internal(format!("invalid stream item from {address}: {e}"))),
        }
      })
      .boxed()
  }
}

async fn read_body(body: Incoming, address: &str) -> Result<Bytes, RpcError> {
  body
    .collect()
    .await
    .map(|collected| collected.to_bytes())
    .map_err(|e| {
      RpcError::unavailable(format!("failed reading body from {address}: {e}")).with_dest_addr([address])
    })
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes, RpcError> {
  serde_json::to_vec(value)
    .map(Bytes::from)
    .map_err(|e| RpcError::invalid_argument(format!("cannot encode request: {e}")))
}

#[async_trait]
impl RpcChannel for HttpChannel {
  fn address(&self) -> &str {
    &self.address
  }

  async fn send_requests(
    &self,
    requests: Vec<DataRequest>,
    options: &CallOptions,
  ) -> Result<(DataRequest, Metadata), RpcError> {
    if requests.len() == 1 {
      let body = encode(&requests[0])?;
      self.unary("/rpc/process_single_data", body, options).await
    } else {
      let body = encode(&requests)?;
      self.unary("/rpc/process_data", body, options).await
    }
  }

  async fn send_stream(
    &self,
    requests: RequestStream,
    options: &CallOptions,
  ) -> Result<ResponseStream, RpcError> {
    let lines = requests.filter_map(|request| async move {
      match encode_line(&request) {
        Ok(line) => Some(Ok(line)),
        Err(err) => {
          debug!(error = %err, "dropping request that cannot be encoded");
          None
        }
      }
    });
    let mut request = self.request("/rpc/stream", streaming(lines), &options.call_metadata())?;
    request
      .headers_mut()
      .insert(CONTENT_TYPE, http::HeaderValue::from_static(NDJSON));
    let response = self.dispatch(request).await?;
    Ok(self.line_stream(response))
  }

  async fn send_single_document(
    &self,
    request: SingleDocumentRequest,
    options: &CallOptions,
  ) -> Result<DocStream, RpcError> {
    let body = encode(&request)?;
    let request = self.request("/rpc/stream_single_document", full(body), &options.call_metadata())?;
    let response = with_deadline(options.timeout, &self.address, self.dispatch(request)).await?;
    Ok(self.line_stream(response))
  }

  async fn send_discover_endpoint(&self, timeout: Option<Duration>) -> Result<EndpointsInfo, RpcError> {
    let options = CallOptions {
      timeout,
      ..CallOptions::default()
    };
    self
      .unary("/rpc/endpoint_discovery", Bytes::from_static(b"{}"), &options)
      .await
      .map(|(info, _)| info)
  }

  async fn send_status(&self, timeout: Option<Duration>) -> Result<StatusInfo, RpcError> {
    let request = self.request("/rpc/status", empty(), &Metadata::new())?;
    with_deadline(timeout, &self.address, async {
      let response = self.dispatch(request).await?;
      let body = read_body(response.into_body(), &self.address).await?;
      serde_json::from_slice(&body)
        .map_err(|e| RpcError::internal(format!("invalid status from {}: {e}", self.address)))
    })
    .await
  }

  async fn close(&self, grace: Duration) {
    self.closed.store(true, Ordering::Release);
    debug!(address = %self.address, ?grace, "channel closed");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tls_addresses_are_rejected() {
    let factory = HttpChannelFactory::default();
    let err = factory.create("grpcs://host:443", "d").err().unwrap();
    assert_eq!(err.code, RpcCode::InvalidArgument);
    assert!(factory.create("grpc://host:80", "d").is_ok());
  }

  #[tokio::test]
  async fn test_refused_connection_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let channel = HttpChannelFactory::default().create(&address, "d").unwrap();
    let err = channel.send_status(Some(Duration::from_secs(2))).await.unwrap_err();
    assert_eq!(err.code, RpcCode::Unavailable);
  }
}
