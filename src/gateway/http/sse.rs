//! Server-sent events for generator endpoints.
//!
//! Every generated document is sent as an `update` event, the stream ends
//! with an `end` event and comment pings keep idle connections open.

use crate::error::GatewayError;
use crate::gateway::streamer::DocItems;
use async_stream::stream;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

/// Content type of an event stream.
pub const EVENT_STREAM: &str = "text/event-stream";

const SEPARATOR: &str = "\r\n";

/// One server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerSentEvent {
  /// Event type.
  pub event: Option<String>,
  /// JSON payload.
  pub data: Option<Value>,
  /// Comment line.
  pub comment: Option<String>,
}

impl ServerSentEvent {
  /// An `update` event carrying `data`.
  pub fn update(data: Value) -> Self {
    Self {
      event: Some("update".into()),
      data: Some(data),
      comment: None,
    }
  }

  /// The terminal `end` event.
  pub fn end() -> Self {
    Self {
      event: Some("end".into()),
      ..Self::default()
    }
  }

  /// An `error` event describing `err`.
  pub fn error(err: &GatewayError) -> Self {
    Self {
      event: Some("error".into()),
      data: Some(json!({"type": err.kind_name(), "message": err.to_string()})),
      comment: None,
    }
  }

  /// A keep-alive comment.
  pub fn ping() -> Self {
    Self {
      comment: Some(format!("ping - {}", Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"))),
      ..Self::default()
    }
  }

  /// Wire encoding, terminated by an empty line.
  pub fn encode(&self) -> Bytes {
    let mut out = String::new();
    if let Some(comment) = &self.comment {
      for line in comment.lines() {
        out.push_str(&format!(": {line}{SEPARATOR}"));
      }
    }
    if let Some(event) = &self.event {
      out.push_str(&format!("event: {}{SEPARATOR}", event.replace(['\r', '\n'], "")));
    }
    if let Some(data) = &self.data {
      out.push_str(&format!("data: {data}{SEPARATOR}"));
    }
    out.push_str(SEPARATOR);
    Bytes::from(out)
  }
}

/// Encodes `docs` as an event stream with a ping every `keepalive`.
pub fn event_stream(mut docs: DocItems, keepalive: Duration) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
  stream! {
    let mut pings = interval_at(Instant::now() + keepalive, keepalive);
    pings.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      let next = tokio::select! {
        item = docs.next() => Some(item),
        _ = pings.tick() => None,
      };
      match next {
        None => yield Ok(ServerSentEvent::ping().encode()),
        Some(None) => break,
        Some(Some(Ok(doc))) => yield Ok(ServerSentEvent::update(doc.to_value()).encode()),
        Some(Some(Err(err))) => {
          debug!(error = %err, "document stream failed");
          yield Ok(ServerSentEvent::error(&err).encode());
          break;
        }
      }
    }
    yield Ok(ServerSentEvent::end().encode());
  }
}
