//! Streaming merge of sharded `{"data": [...]}` responses.
//!
//! Shard bodies are decoded incrementally with a pull-style JSON reader and
//! handed one item at a time to a single writer task, which frames the merged
//! document and optionally compresses it on the way out.

#![forbid(unsafe_code)]

use std::io;

mod decode;
mod pipeline;
mod reader;
mod writer;

pub use decode::ShardDecoder;
pub use pipeline::{merge_responses, MergeOptions};
pub use reader::{JsonReader, ValueKind};
pub use writer::{ContentEncoding, ResponseWriter};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("error in partial response: {0}")]
    PartialResponse(String),
    #[error("expected data field at top level, found {0}")]
    MissingData(String),
    #[error("expected data field to contain an array")]
    DataNotArray,
    #[error("invalid json at offset {offset}: {msg}")]
    Syntax { offset: u64, msg: String },
    #[error("reading partial response: {0}")]
    Io(#[from] io::Error),
    #[error("context canceled")]
    Canceled,
    #[error("merge worker failed: {0}")]
    Worker(String),
}
