//! Merged response framing and optional compression.

use std::io::{self, Write};
use std::mem;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING};
use shardq_core::{ResultItem, ENCODING_SNAPPY_FRAMED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    SnappyFramed,
}

impl ContentEncoding {
    /// Snappy framing when any `Accept-Encoding` token names it; quality
    /// parameters are ignored.
    pub fn from_accept_encoding(headers: &HeaderMap) -> Self {
        let wanted = headers
            .get_all(ACCEPT_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(|token| token.split(';').next())
            .any(|token| token.trim().eq_ignore_ascii_case(ENCODING_SNAPPY_FRAMED));
        if wanted { Self::SnappyFramed } else { Self::Identity }
    }

    /// `Content-Encoding` value to advertise, if any.
    pub fn header_value(&self) -> Option<HeaderValue> {
        match self {
            Self::Identity => None,
            Self::SnappyFramed => Some(HeaderValue::from_static(ENCODING_SNAPPY_FRAMED)),
        }
    }
}

enum Sink {
    Identity(Vec<u8>),
    Snappy(snap::write::FrameEncoder<Vec<u8>>),
}

impl Sink {
    fn buffer(&mut self) -> &mut Vec<u8> {
        match self {
            Sink::Identity(buf) => buf,
            Sink::Snappy(enc) => enc.get_mut(),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Identity(out) => out.write(buf),
            Sink::Snappy(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Identity(_) => Ok(()),
            Sink::Snappy(enc) => enc.flush(),
        }
    }
}

/// Writes `{"data":[item,...]}` plus an optional error trailer into an
/// in-memory buffer that the caller drains with [`ResponseWriter::take_chunk`].
pub struct ResponseWriter {
    sink: Sink,
    items: u64,
    // uncompressed bytes written since the last take_chunk
    pending: usize,
}

impl ResponseWriter {
    pub fn new(encoding: ContentEncoding) -> Self {
        let sink = match encoding {
            ContentEncoding::Identity => Sink::Identity(Vec::new()),
            ContentEncoding::SnappyFramed => Sink::Snappy(snap::write::FrameEncoder::new(Vec::new())),
        };
        Self { sink, items: 0, pending: 0 }
    }

    pub fn begin(&mut self) -> io::Result<()> { self.put(br#"{"data":["#) }

    pub fn write_item(&mut self, item: &ResultItem) -> io::Result<()> {
        if self.items > 0 {
            self.put(b",")?;
        }
        let encoded = serde_json::to_vec(item)?;
        self.put(&encoded)?;
        self.items += 1;
        Ok(())
    }

    /// Close the array and the top-level object. With `error`, the document
    /// gains `"status":"error"` and an `"error"` message after the data.
    pub fn finish(&mut self, error: Option<&str>) -> io::Result<()> {
        self.put(b"]")?;
        if let Some(msg) = error {
            let msg = serde_json::to_string(&format!("error merging partial responses: {msg}"))?;
            self.put(br#","status":"error","error":"#)?;
            self.put(msg.as_bytes())?;
        }
        self.put(b"}")
    }

    pub fn items(&self) -> u64 { self.items }

    /// Uncompressed bytes written since the last chunk was taken.
    pub fn pending(&self) -> usize { self.pending }

    /// Everything encoded so far. Flushing the compressor emits a frame per
    /// call, so callers should batch.
    pub fn take_chunk(&mut self) -> io::Result<Bytes> {
        self.sink.flush()?;
        self.pending = 0;
        Ok(Bytes::from(mem::take(self.sink.buffer())))
    }

    /// Final chunk. The compressor is released before the chunk is returned.
    pub fn close(mut self) -> io::Result<Bytes> {
        let chunk = self.take_chunk()?;
        drop(self.sink);
        Ok(chunk)
    }

    fn put(&mut self, buf: &[u8]) -> io::Result<()> {
        self.sink.write_all(buf)?;
        self.pending += buf.len();
        Ok(())
    }
}
