//! WebSocket clients of the HTTP gateway.

mod support;

use flowgate::config::{GatewayStreamerConfig, HttpServerConfig};
use flowgate::gateway::{GatewayStreamer, HttpGateway};
use flowgate::message::{DataRequest, Document};
use flowgate::networking::LocalChannelFactory;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use support::{Recorder, deploy};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_each_frame_gets_one_response() {
  let factory = LocalChannelFactory::new();
  let a = deploy(&factory, Recorder::new("a"), 1).await;
  let config = GatewayStreamerConfig::default()
    .with_edge("start-gateway", "a")
    .with_edge("a", "end-gateway")
    .with_addresses("a", [a]);
  let streamer = Arc::new(GatewayStreamer::new(config, Arc::new(factory)).await.unwrap());

  let shutdown = CancellationToken::new();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let address = listener.local_addr().unwrap();
  let gateway = Arc::new(HttpGateway::new(Arc::clone(&streamer), HttpServerConfig::default()));
  tokio::spawn(gateway.serve(listener, shutdown.clone()));

  let (mut socket, _) = connect_async(format!("ws://{address}/ws")).await.unwrap();
  for id in ["r0", "r1", "r2"] {
    let request = DataRequest::new()
      .with_request_id(id)
      .with_endpoint("/default")
      .with_docs(vec![Document::with_id(format!("{id}-doc"))]);
    let text = serde_json::to_string(&request).unwrap();
    socket.send(Message::Text(text)).await.unwrap();
  }

  let mut seen = BTreeSet::new();
  while seen.len() < 3 {
    let Some(frame) = socket.next().await else { break };
    let Message::Text(text) = frame.unwrap() else { continue };
    let response: DataRequest = serde_json::from_str(&text).unwrap();
    assert!(!response.is_error());
    assert!(response.docs()[0].get("seen_a").is_some());
    seen.insert(response.request_id().to_string());
  }
  socket.close(None).await.unwrap();
  assert_eq!(seen, BTreeSet::from(["r0".to_string(), "r1".into(), "r2".into()]));

  streamer.close().await;
  shutdown.cancel();
}
