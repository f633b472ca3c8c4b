//! Concurrent fan-out of sub-requests with fail-fast cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use http::{Method, StatusCode};
use metrics::{counter, histogram};
use shardq_core::{Body, QueryStats, Request, RoundTripper};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("shard count too low")]
    ShardCountTooLow,
    #[error("received unexpected response from upstream: status {status}, body: {body}")]
    Upstream { status: u16, body: String },
    #[error("{0:#}")]
    Transport(anyhow::Error),
    #[error("context canceled")]
    Canceled,
    #[error("unsupported method: {0}")]
    UnsupportedMethod(Method),
    #[error("building sub-request: {0}")]
    Build(String),
    #[error("shard worker failed: {0}")]
    Worker(String),
}

impl ShardError {
    fn reason(&self) -> &'static str {
        match self {
            ShardError::ShardCountTooLow => "too_low",
            ShardError::Upstream { .. } => "status",
            ShardError::Transport(_) => "transport",
            ShardError::Canceled => "canceled",
            ShardError::UnsupportedMethod(_) | ShardError::Build(_) => "request",
            ShardError::Worker(_) => "worker",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub error_snippet_bytes: usize,
    pub drain_timeout: Duration,
}

/// Send every request concurrently and return the 200 bodies in request
/// order, still streaming.
///
/// Each shard runs with its own [`QueryStats`] and `cancel`'s token in its
/// request extensions; the stats are folded into `stats` when the shard
/// answers 200. The first failure cancels `cancel`, and every body obtained so
/// far is drained and closed before the error is returned.
pub async fn do_sharded_requests(
    reqs: Vec<Request>,
    upstream: Arc<dyn RoundTripper>,
    cancel: &CancellationToken,
    stats: &Arc<QueryStats>,
    opts: DispatchOptions,
) -> Result<Vec<Body>, ShardError> {
    let started = Instant::now();
    let count = reqs.len();
    let mut set = JoinSet::new();
    for (shard, req) in reqs.into_iter().enumerate() {
        let upstream = upstream.clone();
        let cancel = cancel.clone();
        let stats = stats.clone();
        set.spawn(async move { (shard, do_shard(req, upstream, cancel, stats, opts).await) });
    }

    let mut bodies: Vec<Option<Body>> = (0..count).map(|_| None).collect();
    let mut first_err: Option<ShardError> = None;
    while let Some(joined) = set.join_next().await {
        let (shard, outcome) = match joined {
            Ok(done) => done,
            Err(e) => (usize::MAX, Err(ShardError::Worker(e.to_string()))),
        };
        match outcome {
            Ok(body) => bodies[shard] = Some(body),
            Err(e) => {
                counter!("shardq_shard_failures_total", 1u64, "reason" => e.reason());
                if first_err.is_none() {
                    warn!(shard, error = %e, "shard request failed; canceling siblings");
                    cancel.cancel();
                    first_err = Some(e);
                } else {
                    debug!(shard, error = %e, "sibling shard stopped");
                }
            }
        }
    }
    histogram!("shardq_dispatch_ms", started.elapsed().as_secs_f64() * 1000.0);

    if let Some(err) = first_err {
        join_all(bodies.into_iter().flatten().map(|b| b.drain(opts.drain_timeout))).await;
        return Err(err);
    }
    info!(shards = count, took_ms = started.elapsed().as_millis() as u64, "all shards answered");
    Ok(bodies.into_iter().flatten().collect())
}

async fn do_shard(
    mut req: Request,
    upstream: Arc<dyn RoundTripper>,
    cancel: CancellationToken,
    parent: Arc<QueryStats>,
    opts: DispatchOptions,
) -> Result<Body, ShardError> {
    counter!("shardq_shard_requests_total", 1u64);
    let partial = Arc::new(QueryStats::default());
    partial.add_sharded_queries(1);
    req.extensions_mut().insert(partial.clone());
    req.extensions_mut().insert(cancel.clone());

    let resp = tokio::select! {
        _ = cancel.cancelled() => return Err(ShardError::Canceled),
        resp = upstream.round_trip(req) => resp.map_err(ShardError::Transport)?,
    };
    let (parts, mut body) = resp.into_parts();
    match parts.status {
        StatusCode::OK => {
            debug!(fetched_series = partial.fetched_series(), "shard answered");
            parent.merge(&partial);
            Ok(body)
        }
        StatusCode::PAYLOAD_TOO_LARGE => {
            body.drain(opts.drain_timeout).await;
            Err(ShardError::ShardCountTooLow)
        }
        status => {
            let snippet = body.read_prefix(opts.error_snippet_bytes).await.unwrap_or_default();
            body.drain(opts.drain_timeout).await;
            Err(ShardError::Upstream { status: status.as_u16(), body: String::from_utf8_lossy(&snippet).into_owned() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardq_core::Response;

    struct Status(u16, &'static str);

    #[async_trait::async_trait]
    impl RoundTripper for Status {
        async fn round_trip(&self, _req: Request) -> anyhow::Result<Response> {
            let mut resp = Response::new(Body::from(self.1));
            *resp.status_mut() = StatusCode::from_u16(self.0)?;
            Ok(resp)
        }
    }

    fn opts() -> DispatchOptions { DispatchOptions { error_snippet_bytes: 8, drain_timeout: Duration::from_millis(100) } }

    fn reqs(n: usize) -> Vec<Request> { (0..n).map(|_| Request::new(Body::empty())).collect() }

    #[tokio::test]
    async fn upstream_error_quotes_truncated_body() {
        let cancel = CancellationToken::new();
        let stats = Arc::new(QueryStats::default());
        let err = do_sharded_requests(reqs(2), Arc::new(Status(500, "internal failure details")), &cancel, &stats, opts())
            .await
            .expect_err("500");
        assert_eq!(err.to_string(), "received unexpected response from upstream: status 500, body: internal");
        assert!(cancel.is_cancelled());
        assert_eq!(stats.sharded_queries(), 0);
    }

    #[tokio::test]
    async fn payload_too_large_means_too_few_shards() {
        let err = do_sharded_requests(reqs(3), Arc::new(Status(413, "")), &CancellationToken::new(), &Arc::default(), opts())
            .await
            .expect_err("413");
        assert!(matches!(err, ShardError::ShardCountTooLow));
    }

    #[tokio::test]
    async fn success_merges_stats() {
        let stats = Arc::new(QueryStats::default());
        let bodies = do_sharded_requests(reqs(5), Arc::new(Status(200, "{}")), &CancellationToken::new(), &stats, opts())
            .await
            .expect("ok");
        assert_eq!(bodies.len(), 5);
        assert_eq!(stats.sharded_queries(), 5);
    }
}
