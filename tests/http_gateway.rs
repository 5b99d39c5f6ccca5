//! The HTTP gateway in front of a worker served over TCP.

mod support;

use bytes::Bytes;
use flowgate::config::{ConnectionPoolConfig, GatewayStreamerConfig, HttpServerConfig, WorkerConfig};
use flowgate::gateway::{GatewayStreamer, HttpGateway};
use flowgate::networking::{HttpChannelFactory, serve};
use flowgate::worker::WorkerRequestHandler;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use support::Recorder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Harness {
  address: SocketAddr,
  client: Client<HttpConnector, Full<Bytes>>,
  shutdown: CancellationToken,
  streamer: Arc<GatewayStreamer>,
}

impl Harness {
  async fn start() -> Self {
    let _ = flowgate::logging::init_tracing();
    let shutdown = CancellationToken::new();

    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_address = worker_listener.local_addr().unwrap();
    let worker = WorkerRequestHandler::new(WorkerConfig::new("a"), Recorder::new("a"));
    tokio::spawn(serve(worker_listener, Arc::new(worker), shutdown.clone()));

    let config = GatewayStreamerConfig::default()
      .with_edge("start-gateway", "a")
      .with_edge("a", "end-gateway")
      .with_addresses("a", [worker_address.to_string()]);
    let factory = Arc::new(HttpChannelFactory::new(&ConnectionPoolConfig::default()));
    let streamer = Arc::new(GatewayStreamer::new(config, factory).await.unwrap());

    let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = gateway_listener.local_addr().unwrap();
    let gateway = Arc::new(HttpGateway::new(Arc::clone(&streamer), HttpServerConfig::default()));
    tokio::spawn(gateway.serve(gateway_listener, shutdown.clone()));

    Self {
      address,
      client: Client::builder(TokioExecutor::new()).build_http(),
      shutdown,
      streamer,
    }
  }

  async fn call(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Bytes) {
    let body = body.map(|b| Bytes::from(b.to_string())).unwrap_or_default();
    let request = Request::builder()
      .method(method)
      .uri(format!("http://{}{path}", self.address))
      .header("content-type", "application/json")
      .body(Full::new(body))
      .unwrap();
    let response = self.client.request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
  }

  async fn json(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, body) = self.call(method, path, body).await;
    (status, serde_json::from_slice(&body).unwrap())
  }

  async fn stop(self) {
    self.streamer.close().await;
    self.shutdown.cancel();
  }
}

#[tokio::test]
async fn test_post_to_endpoint_returns_processed_documents() {
  let harness = Harness::start().await;
  let body = json!({"data": [{"id": "x", "text": "hi"}], "header": {"request_id": "r-1"}});
  let (status, response) = harness.json(Method::POST, "/default", Some(body)).await;

  assert_eq!(status, StatusCode::OK);
  assert_eq!(response["data"][0]["id"], "x");
  assert_eq!(response["data"][0]["seen_a"], true);
  assert_eq!(response["header"]["request_id"], "r-1");
  harness.stop().await;
}

#[tokio::test]
async fn test_post_envelope_uses_exec_endpoint() {
  let harness = Harness::start().await;
  let body = json!({"exec_endpoint": "/fail", "data": [{"id": "x"}]});
  let (status, response) = harness.json(Method::POST, "/post", Some(body)).await;

  assert_eq!(status.as_u16(), 499);
  assert_eq!(response["header"]["status"]["exception"]["name"], "ValueError");
  harness.stop().await;
}

#[tokio::test]
async fn test_unknown_endpoint_is_not_found() {
  let harness = Harness::start().await;
  let (status, response) = harness.json(Method::POST, "/missing", Some(json!({}))).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert_eq!(response["detail"], "Not Found");
  harness.stop().await;
}

#[tokio::test]
async fn test_status_and_dry_run() {
  let harness = Harness::start().await;
  let (status, info) = harness.json(Method::GET, "/status", None).await;
  assert_eq!(status, StatusCode::OK);
  assert!(info.is_object());

  let (status, dry_run) = harness.json(Method::GET, "/dry_run", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(dry_run["code"], "SUCCESS");
  harness.stop().await;
}

#[tokio::test]
async fn test_generator_endpoint_answers_server_sent_events() {
  let harness = Harness::start().await;
  let (status, body) = harness
    .call(Method::GET, "/generate?id=q&text=one%20two", None)
    .await;
  let text = String::from_utf8(body.to_vec()).unwrap();

  assert_eq!(status, StatusCode::OK);
  assert_eq!(text.matches("event: update").count(), 2);
  assert!(text.contains("\"text\":\"one\""));
  assert!(text.ends_with("event: end\r\n\r\n"));
  harness.stop().await;
}

#[tokio::test]
async fn test_generator_post_forwards_parameters() {
  let harness = Harness::start().await;
  let body = json!({
    "data": {"id": "q", "text": "one two"},
    "parameters": {"prefix": ">"},
    "header": {"request_id": "r-gen"},
  });
  let (status, body) = harness.call(Method::POST, "/generate", Some(body)).await;
  let text = String::from_utf8(body.to_vec()).unwrap();

  assert_eq!(status, StatusCode::OK);
  assert_eq!(text.matches("event: update").count(), 2);
  assert!(text.contains("\"text\":\">one\""));
  assert!(text.contains("\"text\":\">two\""));
  harness.stop().await;
}
