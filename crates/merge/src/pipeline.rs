//! Producer/consumer merge: one decoder task per shard body feeding a single
//! writer task through a depth-1 channel.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use metrics::counter;
use shardq_core::{Body, ResultItem, Response};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::writer::{ContentEncoding, ResponseWriter};
use crate::{MergeError, ShardDecoder};

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub encoding: ContentEncoding,
    /// Uncompressed bytes buffered before a chunk is pushed to the client
    /// while items are still arriving back to back.
    pub flush_bytes: usize,
    /// Upper bound on draining a shard body that was not read to the end.
    pub drain_timeout: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self { encoding: ContentEncoding::Identity, flush_bytes: 4096, drain_timeout: Duration::from_secs(1) }
    }
}

type FirstError = Arc<OnceLock<MergeError>>;

/// Merge the `data` arrays of `bodies` into one streaming 200 response.
///
/// Items are interleaved in arrival order; each shard's own order is kept. A
/// shard that fails to decode stops contributing but the others carry on, and
/// the output ends with an error trailer. Cancelling `cancel` stops every task
/// promptly; the writer also cancels it when the client stops reading.
///
/// Must be called from within a tokio runtime.
pub fn merge_responses(bodies: Vec<Body>, opts: MergeOptions, cancel: CancellationToken) -> Response {
    let (item_tx, item_rx) = mpsc::channel::<ResultItem>(1);
    let (out_tx, out_rx) = mpsc::channel::<io::Result<Bytes>>(1);
    let first_err: FirstError = Arc::new(OnceLock::new());

    let mut producers = JoinSet::new();
    for (shard, body) in bodies.into_iter().enumerate() {
        producers.spawn(produce(shard, body, item_tx.clone(), cancel.clone(), first_err.clone(), opts.drain_timeout));
    }
    drop(item_tx);

    let writer = MergeWriter {
        out: out_tx,
        cancel,
        flush_bytes: opts.flush_bytes.max(1),
        writer: ResponseWriter::new(opts.encoding),
    };
    tokio::spawn(writer.run(item_rx, producers, first_err));

    let body = Body::from_stream(futures::stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }));
    let mut resp = Response::new(body);
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(v) = opts.encoding.header_value() {
        resp.headers_mut().insert(CONTENT_ENCODING, v);
    }
    resp
}

async fn produce(
    shard: usize,
    body: Body,
    tx: mpsc::Sender<ResultItem>,
    cancel: CancellationToken,
    first_err: FirstError,
    drain_timeout: Duration,
) {
    let mut decoder = ShardDecoder::new(body);
    let outcome = forward(&mut decoder, &tx, &cancel).await;
    drop(tx);
    match outcome {
        Ok(items) => debug!(shard, items, "shard merged"),
        Err(MergeError::Canceled) => debug!(shard, "shard merge canceled"),
        Err(e) => {
            warn!(shard, error = %e, "shard decode failed");
            let _ = first_err.set(e);
        }
    }
    let body = decoder.into_inner();
    if cancel.is_cancelled() {
        drop(body);
    } else {
        let discarded = body.drain(drain_timeout).await;
        if discarded > 0 {
            debug!(shard, discarded, "drained unread shard body");
        }
    }
}

async fn forward(
    decoder: &mut ShardDecoder<Body>,
    tx: &mpsc::Sender<ResultItem>,
    cancel: &CancellationToken,
) -> Result<u64, MergeError> {
    let mut items = 0u64;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(MergeError::Canceled),
            next = decoder.next_item() => next?,
        };
        let Some(item) = next else { return Ok(items) };
        tokio::select! {
            _ = cancel.cancelled() => return Err(MergeError::Canceled),
            sent = tx.send(item) => if sent.is_err() { return Err(MergeError::Canceled) },
        }
        items += 1;
    }
}

/// Sole owner of the output sink and its compressor.
struct MergeWriter {
    out: mpsc::Sender<io::Result<Bytes>>,
    cancel: CancellationToken,
    flush_bytes: usize,
    writer: ResponseWriter,
}

impl MergeWriter {
    async fn run(mut self, mut items: mpsc::Receiver<ResultItem>, mut producers: JoinSet<()>, first_err: FirstError) {
        let outcome = self.pump(&mut items).await;
        // producers blocked on the handoff see a closed channel and stop
        drop(items);
        while let Some(joined) = producers.join_next().await {
            if let Err(e) = joined {
                let _ = first_err.set(MergeError::Worker(e.to_string()));
            }
        }
        counter!("shardq_merged_items_total", self.writer.items());

        // a shard's own failure explains more than the cancellation it caused
        let message = first_err.get().map(ToString::to_string).or_else(|| outcome.err().map(|e| e.to_string()));
        if let Some(msg) = &message {
            error!(error = %msg, items = self.writer.items(), "error merging partial responses");
        }
        let MergeWriter { out, cancel, writer: mut w, .. } = self;
        let last = w.finish(message.as_deref()).and_then(|_| w.close());
        // an idle client may never free the slot; once canceled only offer the trailer
        if cancel.is_cancelled() {
            let _ = out.try_send(last);
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = out.send(last) => {}
            }
        }
    }

    async fn pump(&mut self, items: &mut mpsc::Receiver<ResultItem>) -> Result<(), MergeError> {
        self.writer.begin()?;
        loop {
            let item = match items.try_recv() {
                Ok(item) => Some(item),
                Err(TryRecvError::Disconnected) => None,
                Err(TryRecvError::Empty) => {
                    // nothing ready: hand the client what we have before waiting
                    if self.writer.pending() > 0 {
                        self.send_chunk().await?;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(MergeError::Canceled),
                        item = items.recv() => item,
                    }
                }
            };
            let Some(item) = item else { return Ok(()) };
            self.writer.write_item(&item)?;
            if self.writer.pending() >= self.flush_bytes {
                self.send_chunk().await?;
            }
        }
    }

    async fn send_chunk(&mut self) -> Result<(), MergeError> {
        let chunk = self.writer.take_chunk()?;
        if chunk.is_empty() {
            return Ok(());
        }
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MergeError::Canceled),
            sent = self.out.send(Ok(chunk)) => sent,
        };
        if sent.is_err() {
            self.cancel.cancel();
            return Err(MergeError::Canceled);
        }
        Ok(())
    }
}
