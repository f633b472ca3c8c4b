//! Streaming request/response body.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};

/// A one-directional byte stream. Dropping the body closes it, so ownership
/// guarantees it is closed exactly once.
pub struct Body {
    inner: BoxStream<'static, io::Result<Bytes>>,
}

impl Body {
    pub fn empty() -> Self { Self::from_stream(stream::empty()) }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self { inner: stream.boxed() }
    }

    /// Read the whole body, failing once more than `limit` bytes arrive.
    pub async fn collect(mut self, limit: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("body exceeds {limit} bytes"),
                ));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Read at most `limit` bytes from the front of the body. Anything past
    /// the limit in the last chunk is discarded.
    pub async fn read_prefix(&mut self, limit: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while buf.len() < limit {
            match self.inner.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    let take = chunk.len().min(limit - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                None => break,
            }
        }
        Ok(buf.freeze())
    }

    /// Read and discard the rest of the body, then close it. Gives up after
    /// `timeout`; the body is closed either way. Returns the bytes discarded.
    pub async fn drain(mut self, timeout: Duration) -> u64 {
        let mut discarded = 0u64;
        let read_all = async {
            while let Some(Ok(chunk)) = self.inner.next().await {
                discarded += chunk.len() as u64;
            }
        };
        let _ = tokio::time::timeout(timeout, read_all).await;
        discarded
    }
}

impl Default for Body {
    fn default() -> Self { Self::empty() }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Body") }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self::from_stream(stream::once(async move { Ok(bytes) }))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self { Bytes::from(v).into() }
}

impl From<String> for Body {
    fn from(s: String) -> Self { Bytes::from(s).into() }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self { Bytes::from_static(s.as_bytes()).into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(parts: &[&'static str]) -> Body {
        let items: Vec<io::Result<Bytes>> = parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        Body::from_stream(stream::iter(items))
    }

    #[tokio::test]
    async fn collect_joins_chunks() {
        let body = chunked(&["ab", "cd", "e"]);
        assert_eq!(body.collect(16).await.expect("collect"), Bytes::from_static(b"abcde"));
    }

    #[tokio::test]
    async fn collect_enforces_limit() {
        let body = chunked(&["abc", "def"]);
        let err = body.collect(4).await.expect_err("limit");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn read_prefix_truncates() {
        let mut body = chunked(&["hello ", "world"]);
        let prefix = body.read_prefix(8).await.expect("prefix");
        assert_eq!(prefix, Bytes::from_static(b"hello wo"));
    }

    #[tokio::test]
    async fn drain_counts_remaining_bytes() {
        let body = chunked(&["12345", "678"]);
        assert_eq!(body.drain(Duration::from_secs(1)).await, 8);
    }

    #[tokio::test]
    async fn drain_gives_up_on_endless_body() {
        let body = Body::from_stream(stream::pending());
        let started = std::time::Instant::now();
        assert_eq!(body.drain(Duration::from_millis(20)).await, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
