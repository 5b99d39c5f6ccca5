//! Wire helpers shared by the HTTP/2 client and server: bodies, NDJSON
//! framing, metadata headers and error bodies.

use super::channel::Metadata;
use crate::error::{RpcCode, RpcError};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use serde::{Deserialize, Serialize};

/// Prefix of metadata headers.
pub const META_PREFIX: &str = "x-flowgate-meta-";

/// Content type of NDJSON streams.
pub const NDJSON: &str = "application/x-ndjson";

/// Body type used on both sides of the transport.
pub type RpcBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Body with a single chunk.
pub fn full(bytes: impl Into<Bytes>) -> RpcBody {
  Full::new(bytes.into())
    .map_err(|never| match never {})
    .boxed_unsync()
}

/// Body without content.
pub fn empty() -> RpcBody {
  Empty::<Bytes>::new()
    .map_err(|never| match never {})
    .boxed_unsync()
}

/// Body streaming `chunks`.
pub fn streaming<S>(chunks: S) -> RpcBody
where
  S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
  StreamBody::new(chunks.map(|chunk| chunk.map(Frame::data))).boxed_unsync()
}

/// One NDJSON line of a response stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamLine<T> {
  /// The stream failed.
  Error {
    /// The failure.
    error: RpcError,
  },
  /// One item.
  Item(T),
}

/// Serializes `value` followed by a newline.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
  let mut buf = serde_json::to_vec(value)?;
  buf.push(b'\n');
  Ok(Bytes::from(buf))
}

/// Re-chunks a byte stream into lines, without the trailing newline. Empty
/// lines are skipped.
pub fn split_lines<S, E>(chunks: S) -> impl Stream<Item = Result<Bytes, E>> + Send
where
  S: Stream<Item = Result<Bytes, E>> + Send + 'static,
  E: Send + 'static,
{
  async_stream::stream! {
    let mut chunks = Box::pin(chunks);
    let mut buf = BytesMut::new();
    let mut failed = false;
    while let Some(chunk) = chunks.next().await {
      match chunk {
        Ok(chunk) => {
          buf.extend_from_slice(&chunk);
          while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line = buf.split_to(pos + 1).freeze().slice(..pos);
            if !line.is_empty() {
              yield Ok(line);
            }
          }
        }
        Err(err) => {
          failed = true;
          yield Err(err);
          break;
        }
      }
    }
    if !failed && !buf.is_empty() {
      yield Ok(buf.freeze());
    }
  }
}

/// Reads `x-flowgate-meta-*` headers.
pub fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
  headers
    .iter()
    .filter_map(|(name, value)| {
      let key = name.as_str().strip_prefix(META_PREFIX)?;
      let value = value.to_str().ok()?;
      Some((key.to_string(), value.to_string()))
    })
    .collect()
}

/// Writes `metadata` as `x-flowgate-meta-*` headers, skipping entries that are
/// not valid header text.
pub fn insert_metadata(headers: &mut HeaderMap, metadata: &Metadata) {
  for (key, value) in metadata {
    let name = format!("{META_PREFIX}{}", key.to_ascii_lowercase());
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.insert(name, value);
    }
  }
}

/// Rebuilds an [`RpcError`] from an error response.
pub fn error_from_response(status: u16, body: &[u8], address: &str) -> RpcError {
  match serde_json::from_slice::<RpcError>(body) {
    Ok(err) => err,
    Err(_) => RpcError::new(
      RpcCode::from_http_status(status),
      format!(
        "{address} answered HTTP {status}: {}",
        String::from_utf8_lossy(body)
      ),
    ),
  }
  .with_dest_addr([address])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::DataRequest;

  #[tokio::test]
  async fn test_split_lines_across_chunks() {
    let chunks = futures::stream::iter(vec![
      Ok::<_, std::io::Error>(Bytes::from_static(b"{\"a\":1}\n{\"b\"")),
      Ok(Bytes::from_static(b":2}\n\n{\"c\":3}")),
    ]);
    let lines: Vec<Bytes> = split_lines(chunks).map(|l| l.unwrap()).collect().await;
    assert_eq!(
      lines,
      vec![
        Bytes::from_static(b"{\"a\":1}"),
        Bytes::from_static(b"{\"b\":2}"),
        Bytes::from_static(b"{\"c\":3}"),
      ]
    );
  }

  #[test]
  fn test_metadata_headers_round_trip() {
    let mut metadata = Metadata::new();
    metadata.insert("endpoint".into(), "/search".into());
    metadata.insert("is-error".into(), "true".into());
    metadata.insert("bad".into(), "line\nbreak".into());
    let mut headers = HeaderMap::new();
    insert_metadata(&mut headers, &metadata);
    let back = metadata_from_headers(&headers);
    assert_eq!(back.get("endpoint").map(String::as_str), Some("/search"));
    assert_eq!(back.get("is-error").map(String::as_str), Some("true"));
    assert!(!back.contains_key("bad"));
  }

  #[test]
  fn test_stream_line_distinguishes_errors() {
    let line = encode_line(&StreamLine::<DataRequest>::Error {
      error: RpcError::internal("boom"),
    })
    .unwrap();
    let parsed: StreamLine<DataRequest> = serde_json::from_slice(&line).unwrap();
    assert!(matches!(parsed, StreamLine::Error { .. }));

    let item = encode_line(&StreamLine::Item(DataRequest::new())).unwrap();
    let parsed: StreamLine<DataRequest> = serde_json::from_slice(&item).unwrap();
    assert!(matches!(parsed, StreamLine::Item(_)));
  }

  #[test]
  fn test_error_from_plain_body() {
    let err = error_from_response(503, b"overloaded", "h:1");
    assert_eq!(err.code, RpcCode::Unavailable);
    assert_eq!(err.dest_addr, vec!["h:1"]);
  }
}
