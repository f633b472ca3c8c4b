//! Sharding for active series queries.
//!
//! [`ShardActiveSeries`] wraps an upstream [`RoundTripper`]. A request whose
//! effective shard count is two or more is split into one sub-request per
//! shard, the sub-requests are sent concurrently, and their `data` arrays are
//! merged into a single streaming response.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use metrics::counter;
use shardq_api::{tenant_id, ApiError, Limits};
use shardq_core::{QueryStats, Request, Response, RoundTripper};
use shardq_merge::{merge_responses, ContentEncoding};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod config;
mod dispatch;
mod negotiate;
mod request;

pub use config::ProxyConfig;
pub use dispatch::{do_sharded_requests, DispatchOptions, ShardError};
pub use negotiate::{negotiate, shard_count_from_headers, Negotiation};
pub use request::{build_sharded_requests, parse_selector};

pub struct ShardActiveSeries {
    upstream: Arc<dyn RoundTripper>,
    limits: Arc<dyn Limits>,
    config: ProxyConfig,
}

impl ShardActiveSeries {
    pub fn new(upstream: Arc<dyn RoundTripper>, limits: Arc<dyn Limits>) -> Self {
        Self { upstream, limits, config: ProxyConfig::default() }
    }

    pub fn with_config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    async fn shard(&self, mut req: Request) -> Result<Response> {
        counter!("shardq_requests_total", 1u64);
        let tenant = tenant_id(req.headers())?;
        let count = match negotiate(self.limits.as_ref(), &tenant, req.headers())? {
            Negotiation::PassThrough => {
                debug!(tenant = %tenant, "query sharding disabled for request");
                counter!("shardq_passthrough_total", 1u64);
                return self.upstream.round_trip(req).await;
            }
            Negotiation::Shard(count) => count,
        };

        let selector = parse_selector(&mut req, self.config.max_form_bytes).await?;
        debug!(tenant = %tenant, shards = count, selector = %selector, "sharding active series query");

        let encoding = ContentEncoding::from_accept_encoding(req.headers());
        let cancel = req.extensions().get::<CancellationToken>().cloned().unwrap_or_default();
        let stats = QueryStats::from_extensions(req.extensions()).unwrap_or_default();
        let (parts, _body) = req.into_parts();

        let reqs = build_sharded_requests(&parts, &selector, count).map_err(api_error)?;
        let dispatch_opts = DispatchOptions {
            error_snippet_bytes: self.config.error_snippet_bytes,
            drain_timeout: self.config.drain_timeout,
        };
        // failing shards cancel their siblings, not the caller
        let shard_cancel = cancel.child_token();
        let bodies = do_sharded_requests(reqs, self.upstream.clone(), &shard_cancel, &stats, dispatch_opts)
            .await
            .map_err(api_error)?;

        Ok(merge_responses(bodies, self.config.merge_options(encoding), shard_cancel))
    }
}

#[async_trait::async_trait]
impl RoundTripper for ShardActiveSeries {
    async fn round_trip(&self, req: Request) -> Result<Response> { self.shard(req).await }
}

fn api_error(err: ShardError) -> ApiError {
    match err {
        ShardError::ShardCountTooLow => ApiError::bad_data(format!("{err}: try increasing the requested shard count")),
        ShardError::Canceled => ApiError::canceled(err.to_string()),
        ShardError::UnsupportedMethod(_) => ApiError::bad_data(err.to_string()),
        ShardError::Upstream { .. } | ShardError::Transport(_) | ShardError::Build(_) | ShardError::Worker(_) => {
            ApiError::internal(err.to_string())
        }
    }
}
