//! Decoder for one shard's `{"data": [{...}, ...]}` response body.

use std::io;

use bytes::Bytes;
use futures::Stream;
use shardq_core::ResultItem;

use crate::reader::{JsonReader, ValueKind};
use crate::MergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    InData,
    Done,
}

/// Yields the items of a shard's `data` array one at a time.
///
/// Top-level fields before `data` are skipped, except `error`, which fails the
/// shard with its message. Fields after the array are never read.
pub struct ShardDecoder<S> {
    reader: JsonReader<S>,
    state: State,
}

impl<S> ShardDecoder<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    pub fn new(body: S) -> Self { Self { reader: JsonReader::new(body), state: State::Start } }

    /// Next item, or `None` once the array is exhausted.
    pub async fn next_item(&mut self) -> Result<Option<ResultItem>, MergeError> {
        match self.state {
            State::Done => return Ok(None),
            State::Start => {
                self.seek_data().await?;
                self.state = State::InData;
            }
            State::InData => {}
        }
        if !self.reader.next_array_element().await? {
            self.state = State::Done;
            return Ok(None);
        }
        self.read_item().await.map(Some)
    }

    /// The body, for draining whatever was not read.
    pub fn into_inner(self) -> S { self.reader.into_inner() }

    async fn seek_data(&mut self) -> Result<(), MergeError> {
        if self.reader.what_is_next().await? != ValueKind::Object {
            return Err(MergeError::MissingData(self.reader.snippet()));
        }
        while let Some(field) = self.reader.next_object_key().await? {
            match field.as_str() {
                "error" => {
                    let msg = self.reader.read_string().await?;
                    return Err(MergeError::PartialResponse(msg));
                }
                "data" => {
                    if self.reader.what_is_next().await? != ValueKind::Array {
                        return Err(MergeError::DataNotArray);
                    }
                    return Ok(());
                }
                _ => self.reader.skip_value().await?,
            }
        }
        Err(MergeError::MissingData("end of object".into()))
    }

    async fn read_item(&mut self) -> Result<ResultItem, MergeError> {
        let kind = self.reader.what_is_next().await?;
        if kind != ValueKind::Object {
            return Err(MergeError::Syntax {
                offset: self.reader.offset(),
                msg: format!("expected data item to be an object, found {kind:?}"),
            });
        }
        let mut item = ResultItem::new();
        while let Some(name) = self.reader.next_object_key().await? {
            let value = self.reader.read_string().await?;
            item.push(name, value);
        }
        Ok(item)
    }
}
