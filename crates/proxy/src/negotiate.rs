//! Effective shard count for one request.

use http::HeaderMap;
use shardq_api::{ApiError, Limits};
use shardq_core::SHARDING_CONTROL_HEADER;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Fewer than two shards: forward the request untouched.
    PassThrough,
    Shard(usize),
}

/// First `Sharding-Control` value that parses as a non-negative base-10
/// 32-bit integer, else `default`. Header occurrences are scanned in order;
/// malformed and negative values are skipped.
pub fn shard_count_from_headers(default: usize, headers: &HeaderMap) -> usize {
    for value in headers.get_all(SHARDING_CONTROL_HEADER) {
        let Some(n) = value.to_str().ok().and_then(|s| s.parse::<i32>().ok()) else { continue };
        if let Ok(n) = usize::try_from(n) {
            debug!(shards = n, header = SHARDING_CONTROL_HEADER, "using shard count from header");
            return n;
        }
    }
    default
}

/// Resolve the shard count for `tenant` from its limits and the request
/// headers. Counts above the tenant maximum are rejected as bad input.
pub fn negotiate(limits: &dyn Limits, tenant: &str, headers: &HeaderMap) -> Result<Negotiation, ApiError> {
    let count = shard_count_from_headers(limits.query_sharding_total_shards(tenant), headers);
    if count < 2 {
        return Ok(Negotiation::PassThrough);
    }
    let max = limits.query_sharding_max_sharded_queries(tenant);
    if count > max {
        return Err(ApiError::bad_data(format!("shard count {count} exceeds allowed maximum ({max})")));
    }
    Ok(Negotiation::Shard(count))
}
