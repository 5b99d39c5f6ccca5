//! Body compression for the HTTP/2 transport.

use crate::config::Compression;
use async_compression::tokio::bufread::{DeflateDecoder, DeflateEncoder, GzipDecoder, GzipEncoder};
use bytes::Bytes;
use tokio::io::AsyncReadExt;

/// Compresses `body` with `compression`.
pub async fn compress(body: Bytes, compression: Compression) -> std::io::Result<Bytes> {
  let mut out = Vec::with_capacity(body.len() / 2);
  match compression {
    Compression::None => return Ok(body),
    Compression::Gzip => {
      GzipEncoder::new(&body[..]).read_to_end(&mut out).await?;
    }
    Compression::Deflate => {
      DeflateEncoder::new(&body[..]).read_to_end(&mut out).await?;
    }
  }
  Ok(Bytes::from(out))
}

/// Decompresses `body` according to a `content-encoding` header value.
pub async fn decompress(body: Bytes, content_encoding: Option<&str>) -> std::io::Result<Bytes> {
  let compression = match content_encoding {
    None => return Ok(body),
    Some(raw) => raw
      .parse::<Compression>()
      .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?,
  };
  let mut out = Vec::with_capacity(body.len() * 2);
  match compression {
    Compression::None => return Ok(body),
    Compression::Gzip => {
      GzipDecoder::new(&body[..]).read_to_end(&mut out).await?;
    }
    Compression::Deflate => {
      DeflateDecoder::new(&body[..]).read_to_end(&mut out).await?;
    }
  }
  Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_gzip_and_deflate_restore_the_body() {
    let body = Bytes::from(r#"{"data":{"docs":[{"id":"a","text":"aaaaaaaaaaaaaaaaaaaa"}]}}"#);
    for compression in [Compression::Gzip, Compression::Deflate] {
      let packed = compress(body.clone(), compression).await.unwrap();
      assert_ne!(packed, body);
      let unpacked = decompress(packed, compression.content_encoding()).await.unwrap();
      assert_eq!(unpacked, body);
    }
  }

  #[tokio::test]
  async fn test_identity_passes_through() {
    let body = Bytes::from_static(b"plain");
    assert_eq!(compress(body.clone(), Compression::None).await.unwrap(), body);
    assert_eq!(decompress(body.clone(), None).await.unwrap(), body);
    assert!(decompress(body, Some("br")).await.is_err());
  }
}
