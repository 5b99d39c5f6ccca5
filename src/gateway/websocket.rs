//! # WebSocket Surface
//!
//! `GET /ws` upgrades to a WebSocket. Each text (or binary) frame carries one
//! JSON request; responses are written back in completion order, one frame
//! each. A close frame from the client ends the request stream; responses
//! still in flight at that point are dropped.

use super::streamer::GatewayStreamer;
use crate::error::{GatewayError, RpcError};
use crate::message::{DataRequest, GATEWAY_ROUTE};
use crate::networking::wire::RpcBody;
use futures::{SinkExt, StreamExt, future};
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::{HyperWebsocket, upgrade};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether `request` asks for a WebSocket upgrade.
pub fn is_upgrade_request(request: &Request<Incoming>) -> bool {
  hyper_tungstenite::is_upgrade_request(request)
}

/// Answers the upgrade and serves the socket in the background.
///
/// # Errors
///
/// A malformed upgrade request.
pub fn accept(streamer: Arc<GatewayStreamer>, mut request: Request<Incoming>) -> Result<Response<RpcBody>, RpcError> {
  let (response, websocket) = upgrade(&mut request, None)
    .map_err(|err| RpcError::invalid_argument(format!("websocket upgrade failed: {err}")))?;
  tokio::spawn(serve_socket(streamer, websocket));
  let (parts, body) = response.into_parts();
  Ok(Response::from_parts(
    parts,
    body.map_err(|never| match never {}).boxed_unsync(),
  ))
}

async fn serve_socket(streamer: Arc<GatewayStreamer>, websocket: HyperWebsocket) {
  let socket = match websocket.await {
    Ok(socket) => socket,
    Err(err) => {
      warn!(error = %err, "websocket handshake failed");
      return;
    }
  };
  info!("websocket client connected");
  let (mut sink, source) = socket.split();

  let requests = source
    .take_while(|frame| future::ready(matches!(frame, Ok(message) if !message.is_close())))
    .filter_map(|frame| async move {
      let payload = match frame {
        Ok(Message::Text(text)) => text.into_bytes(),
        Ok(Message::Binary(bytes)) => bytes,
        _ => return None,
      };
      match serde_json::from_slice::<DataRequest>(&payload) {
        Ok(request) => Some(request),
        Err(err) => {
          warn!(error = %err, "skipping malformed websocket request");
          None
        }
      }
    });

  let mut responses = streamer.rpc_stream(requests, false);
  while let Some(item) = responses.next().await {
    let response = item.unwrap_or_else(|err| error_envelope(&err));
    let text = match serde_json::to_string(&response) {
      Ok(text) => text,
      Err(err) => {
        warn!(error = %err, "cannot encode websocket response");
        continue;
      }
    };
    if let Err(err) = sink.send(Message::Text(text)).await {
      debug!(error = %err, "websocket client went away");
      return;
    }
  }
  if let Err(err) = sink.send(Message::Close(None)).await {
    debug!(error = %err, "websocket closed before the close frame");
  }
  info!("websocket client disconnected");
}

fn error_envelope(err: &GatewayError) -> DataRequest {
  let mut envelope = DataRequest::new();
  if let GatewayError::Rpc(RpcError {
    request_id: Some(id), ..
  }) = err
  {
    envelope.header.request_id = id.clone();
  }
  envelope.add_error(err, GATEWAY_ROUTE);
  envelope
}
