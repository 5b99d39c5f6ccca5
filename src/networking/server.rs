//! # HTTP/2 Transport (server)
//!
//! Serves an [`RpcService`] over the JSON-over-HTTP/2 protocol:
//!
//! | Path | Body | Answer |
//! |---|---|---|
//! | `/rpc/process_single_data` | request | response |
//! | `/rpc/process_data` | request list | response |
//! | `/rpc/stream` | NDJSON requests | NDJSON responses |
//! | `/rpc/stream_single_document` | single-document request | NDJSON documents |
//! | `/rpc/endpoint_discovery` | none | endpoints and schemas |
//! | `/rpc/status` | none | version and environment |
//!
//! Trailing metadata of unary calls come back as `x-flowgate-meta-*` headers.
//! Failures are answered with the HTTP status of their code and the
//! serialized [`RpcError`] as body.

use super::channel::{Metadata, RpcService};
use super::compression::decompress;
use super::wire::{
  NDJSON, RpcBody, StreamLine, encode_line, full, insert_metadata, metadata_from_headers,
  split_lines, streaming,
};
use crate::error::RpcError;
use crate::message::{DataRequest, SingleDocumentRequest};
use futures::{Stream, StreamExt};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Serves `service` on `listener` until `shutdown` fires, then waits for open
/// connections to finish.
pub async fn serve(
  listener: TcpListener,
  service: Arc<dyn RpcService>,
  shutdown: CancellationToken,
) -> std::io::Result<()> {
  serve_with(listener, shutdown, "rpc", move |request| {
    handle(Arc::clone(&service), request)
  })
  .await
}

/// Accept loop shared by the RPC and gateway surfaces. Every connection is
/// served by `handler`, with HTTP/1 upgrades enabled.
pub async fn serve_with<F, Fut>(
  listener: TcpListener,
  shutdown: CancellationToken,
  surface: &'static str,
  handler: F,
) -> std::io::Result<()>
where
  F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
  Fut: Future<Output = Result<Response<RpcBody>, Infallible>> + Send + 'static,
{
  let local = listener.local_addr()?;
  info!(address = %local, %surface, "server listening");
  let connections = TaskTracker::new();

  loop {
    let (stream, peer) = tokio::select! {
      accepted = listener.accept() => accepted?,
      _ = shutdown.cancelled() => break,
    };
    let handler = handler.clone();
    let shutdown = shutdown.clone();
    connections.spawn(async move {
      let svc = service_fn(handler);
      let builder = Builder::new(TokioExecutor::new());
      let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
      tokio::pin!(connection);
      tokio::select! {
        result = connection.as_mut() => {
          if let Err(err) = result {
            debug!(%peer, %surface, error = %err, "connection ended with error");
          }
        }
        _ = shutdown.cancelled() => {
          connection.as_mut().graceful_shutdown();
          if let Err(err) = connection.await {
            debug!(%peer, %surface, error = %err, "connection ended during shutdown");
          }
        }
      }
    });
  }

  connections.close();
  connections.wait().await;
  info!(address = %local, %surface, "server stopped");
  Ok(())
}

/// Handles one RPC request.
pub async fn handle(
  service: Arc<dyn RpcService>,
  request: Request<Incoming>,
) -> Result<Response<RpcBody>, Infallible> {
  let path = request.uri().path().to_string();
  let result = match path.as_str() {
    "/rpc/process_single_data" => process_single_data(service, request).await,
    "/rpc/process_data" => process_data(service, request).await,
    "/rpc/stream" => stream(service, request).await,
    "/rpc/stream_single_document" => stream_single_document(service, request).await,
    "/rpc/endpoint_discovery" => match service.endpoint_discovery().await {
      Ok(info) => json_response(&info, &Metadata::new()),
      Err(err) => Err(err),
    },
    "/rpc/status" => match service.status().await {
      Ok(info) => json_response(&info, &Metadata::new()),
      Err(err) => Err(err),
    },
    _ => Err(RpcError::not_found(format!("unknown rpc `{path}`"))),
  };
  Ok(result.unwrap_or_else(|err| {
    warn!(%path, error = %err, "rpc failed");
    error_response(&err)
  }))
}

async fn process_single_data(
  service: Arc<dyn RpcService>,
  request: Request<Incoming>,
) -> Result<Response<RpcBody>, RpcError> {
  let metadata = metadata_from_headers(request.headers());
  let body: DataRequest = read_json(request).await?;
  let (response, trailing) = service.process_single_data(body, metadata).await?;
  json_response(&response, &trailing)
}

async fn process_data(
  service: Arc<dyn RpcService>,
  request: Request<Incoming>,
) -> Result<Response<RpcBody>, RpcError> {
  let metadata = metadata_from_headers(request.headers());
  let body: Vec<DataRequest> = read_json(request).await?;
  if body.is_empty() {
    return Err(RpcError::invalid_argument("process_data needs at least one request"));
  }
  let (response, trailing) = service.process_data(body, metadata).await?;
  json_response(&response, &trailing)
}

async fn stream(
  service: Arc<dyn RpcService>,
  request: Request<Incoming>,
) -> Result<Response<RpcBody>, RpcError> {
  let metadata = metadata_from_headers(request.headers());
  let chunks = request
    .into_body()
    .into_data_stream()
    .map(|chunk| chunk.map_err(|e| e.to_string()));
  let requests = split_lines(chunks)
    .filter_map(|line| async move {
      let line = match line {
        Ok(line) => line,
        Err(err) => {
          debug!(error = %err, "request stream broke");
          return None;
        }
      };
      match serde_json::from_slice::<DataRequest>(&line) {
        Ok(request) => Some(request),
        Err(err) => {
          warn!(error = %err, "skipping malformed streamed request");
          None
        }
      }
    })
    .boxed();
  let responses = service.stream(requests, metadata).await?;
  Ok(ndjson_response(responses))
}

async fn stream_single_document(
  service: Arc<dyn RpcService>,
  request: Request<Incoming>,
) -> Result<Response<RpcBody>, RpcError> {
  let metadata = metadata_from_headers(request.headers());
  let body: SingleDocumentRequest = read_json(request).await?;
  let docs = service.stream_single_document(body, metadata).await?;
  Ok(ndjson_response(docs))
}

async fn read_json<T: DeserializeOwned>(request: Request<Incoming>) -> Result<T, RpcError> {
  let encoding = request
    .headers()
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string);
  let body = request
    .into_body()
    .collect()
    .await
    .map_err(|e| RpcError::invalid_argument(format!("cannot read body: {e}")))?
    .to_bytes();
  let body = decompress(body, encoding.as_deref())
    .await
    .map_err(|e| RpcError::invalid_argument(format!("cannot decompress body: {e}")))?;
  serde_json::from_slice(&body).map_err(|e| RpcError::invalid_argument(format!("malformed body: {e}")))
}

fn json_response<T: Serialize>(value: &T, metadata: &Metadata) -> Result<Response<RpcBody>, RpcError> {
  let body = serde_json::to_vec(value)
    .map_err(|e| RpcError::internal(format!("cannot encode response: {e}")))?;
  let mut response = Response::new(full(body));
  response.headers_mut().insert(
    CONTENT_TYPE,
    HeaderValue::from_static(mime::APPLICATION_JSON.as_ref()),
  );
  insert_metadata(response.headers_mut(), metadata);
  Ok(response)
}

fn ndjson_response<S, T>(items: S) -> Response<RpcBody>
where
  S: Stream<Item = Result<T, RpcError>> + Send + 'static,
  T: Serialize + Send + 'static,
{
  let lines = items.map(|item| {
    let line = match item {
      Ok(item) => encode_line(&StreamLine::Item(item)),
      Err(error) => encode_line(&StreamLine::<T>::Error { error }),
    };
    line.map_err(std::io::Error::other)
  });
  let mut response = Response::new(streaming(lines));
  response
    .headers_mut()
    .insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON));
  response
}

fn error_response(err: &RpcError) -> Response<RpcBody> {
  let body = serde_json::to_vec(err).unwrap_or_else(|_| err.to_string().into_bytes());
  let mut response = Response::new(full(body));
  *response.status_mut() =
    StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  response.headers_mut().insert(
    CONTENT_TYPE,
    HeaderValue::from_static(mime::APPLICATION_JSON.as_ref()),
  );
  response
}
