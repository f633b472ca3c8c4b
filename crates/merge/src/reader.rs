//! Pull-style JSON reader over a chunked byte stream.
//!
//! Only the bytes of the token being read are kept in memory; consumed input
//! is released at token boundaries. Object and array iteration follow the
//! "call until it returns nothing" shape: the first call consumes the opening
//! bracket, later calls consume the separator or the closing bracket.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};

use crate::MergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Object,
    Array,
    String,
    Number,
    Bool,
    Null,
}

pub struct JsonReader<S> {
    src: S,
    buf: BytesMut,
    pos: usize,
    // absolute input offset of buf[0]
    base: u64,
    eof: bool,
}

impl<S> JsonReader<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    pub fn new(src: S) -> Self {
        Self { src, buf: BytesMut::new(), pos: 0, base: 0, eof: false }
    }

    /// Give back the underlying stream; buffered, unread input is discarded.
    pub fn into_inner(self) -> S { self.src }

    pub fn offset(&self) -> u64 { self.base + self.pos as u64 }

    /// Up to 64 bytes of unread input, for error messages.
    pub fn snippet(&self) -> String {
        let end = self.buf.len().min(self.pos + 64);
        String::from_utf8_lossy(&self.buf[self.pos..end]).into_owned()
    }

    /// Kind of the next value, without consuming it.
    pub async fn what_is_next(&mut self) -> Result<ValueKind, MergeError> {
        match self.peek().await? {
            Some(b'{') => Ok(ValueKind::Object),
            Some(b'[') => Ok(ValueKind::Array),
            Some(b'"') => Ok(ValueKind::String),
            Some(b'-' | b'0'..=b'9') => Ok(ValueKind::Number),
            Some(b't' | b'f') => Ok(ValueKind::Bool),
            Some(b'n') => Ok(ValueKind::Null),
            Some(b) => Err(self.unexpected(b, "a value")),
            None => Err(self.eof_error()),
        }
    }

    /// Next key of the current object, or `None` once it is closed.
    pub async fn next_object_key(&mut self) -> Result<Option<String>, MergeError> {
        match self.peek().await? {
            Some(b'{') => {
                self.pos += 1;
                if self.peek().await? == Some(b'}') {
                    self.pos += 1;
                    return Ok(None);
                }
            }
            Some(b',') => self.pos += 1,
            Some(b'}') => {
                self.pos += 1;
                return Ok(None);
            }
            Some(b) => return Err(self.unexpected(b, "'{', ',' or '}'")),
            None => return Err(self.eof_error()),
        }
        let key = self.read_string().await?;
        self.expect(b':').await?;
        Ok(Some(key))
    }

    /// Whether the current array has another element; consumes the closing
    /// bracket when it does not.
    pub async fn next_array_element(&mut self) -> Result<bool, MergeError> {
        match self.peek().await? {
            Some(b'[') => {
                self.pos += 1;
                if self.peek().await? == Some(b']') {
                    self.pos += 1;
                    return Ok(false);
                }
                Ok(true)
            }
            Some(b',') => {
                self.pos += 1;
                Ok(true)
            }
            Some(b']') => {
                self.pos += 1;
                Ok(false)
            }
            Some(b) => Err(self.unexpected(b, "'[', ',' or ']'")),
            None => Err(self.eof_error()),
        }
    }

    pub async fn read_string(&mut self) -> Result<String, MergeError> {
        match self.peek().await? {
            Some(b'"') => {}
            Some(b) => return Err(self.unexpected(b, "a string")),
            None => return Err(self.eof_error()),
        }
        let end = self.scan_string().await?;
        let decoded: String = serde_json::from_slice(&self.buf[self.pos..end]).map_err(|e| self.syntax(e.to_string()))?;
        self.pos = end;
        Ok(decoded)
    }

    /// Skip the next value of any kind. Nested containers are only checked
    /// for bracket balance.
    pub async fn skip_value(&mut self) -> Result<(), MergeError> {
        match self.peek().await? {
            None => Err(self.eof_error()),
            Some(b'"') => {
                self.pos = self.scan_string().await?;
                Ok(())
            }
            Some(b'{' | b'[') => self.skip_container().await,
            Some(_) => self.skip_scalar().await,
        }
    }

    /// Next non-whitespace byte, without consuming it.
    async fn peek(&mut self) -> Result<Option<u8>, MergeError> {
        self.release();
        loop {
            while let Some(&b) = self.buf.get(self.pos) {
                if !matches!(b, b' ' | b'\t' | b'\n' | b'\r') {
                    return Ok(Some(b));
                }
                self.pos += 1;
            }
            self.release();
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    async fn expect(&mut self, want: u8) -> Result<(), MergeError> {
        match self.peek().await? {
            Some(b) if b == want => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(self.unexpected(b, &format!("{:?}", want as char))),
            None => Err(self.eof_error()),
        }
    }

    /// Index one past the closing quote of the string starting at `pos`.
    async fn scan_string(&mut self) -> Result<usize, MergeError> {
        let mut i = self.pos + 1;
        let mut escaped = false;
        loop {
            let Some(&b) = self.buf.get(i) else {
                if !self.fill().await? {
                    return Err(self.eof_error());
                }
                continue;
            };
            i += 1;
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                return Ok(i);
            }
        }
    }

    async fn skip_container(&mut self) -> Result<(), MergeError> {
        let mut i = self.pos;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        loop {
            let Some(&b) = self.buf.get(i) else {
                if !self.fill().await? {
                    return Err(self.eof_error());
                }
                continue;
            };
            i += 1;
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos = i;
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    async fn skip_scalar(&mut self) -> Result<(), MergeError> {
        let mut i = self.pos;
        loop {
            match self.buf.get(i) {
                Some(&b) if b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.') => i += 1,
                Some(_) => break,
                None => {
                    if !self.fill().await? {
                        break;
                    }
                }
            }
        }
        if i == self.pos {
            let b = self.buf[self.pos];
            return Err(self.unexpected(b, "a value"));
        }
        serde_json::from_slice::<serde_json::Value>(&self.buf[self.pos..i]).map_err(|e| self.syntax(e.to_string()))?;
        self.pos = i;
        Ok(())
    }

    /// Append the next non-empty chunk. Never moves buffered bytes, so indexes
    /// taken before a fill stay valid.
    async fn fill(&mut self) -> Result<bool, MergeError> {
        while !self.eof {
            match self.src.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    if !chunk.is_empty() {
                        self.buf.extend_from_slice(&chunk);
                        return Ok(true);
                    }
                }
                None => self.eof = true,
            }
        }
        Ok(false)
    }

    /// Drop consumed input. Only called between tokens.
    fn release(&mut self) {
        if self.pos > 0 {
            self.buf.advance(self.pos);
            self.base += self.pos as u64;
            self.pos = 0;
        }
    }

    fn syntax(&self, msg: impl Into<String>) -> MergeError {
        MergeError::Syntax { offset: self.offset(), msg: msg.into() }
    }

    fn unexpected(&self, b: u8, expected: &str) -> MergeError {
        self.syntax(format!("unexpected {:?}, expected {expected}", b as char))
    }

    fn eof_error(&self) -> MergeError { self.syntax("unexpected end of input") }
}
