//! Request-scoped query statistics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Counters accumulated while serving one request.
///
/// Shared as `Arc<QueryStats>` through request extensions. Every shard gets an
/// isolated instance which is merged into the parent when the shard succeeds;
/// merges may run concurrently.
#[derive(Debug, Default)]
pub struct QueryStats {
    sharded_queries: AtomicU32,
    fetched_series: AtomicU64,
}

impl QueryStats {
    pub fn from_extensions(ext: &http::Extensions) -> Option<Arc<QueryStats>> {
        ext.get::<Arc<QueryStats>>().cloned()
    }

    pub fn add_sharded_queries(&self, n: u32) { self.sharded_queries.fetch_add(n, Ordering::Relaxed); }
    pub fn add_fetched_series(&self, n: u64) { self.fetched_series.fetch_add(n, Ordering::Relaxed); }
    pub fn sharded_queries(&self) -> u32 { self.sharded_queries.load(Ordering::Relaxed) }
    pub fn fetched_series(&self) -> u64 { self.fetched_series.load(Ordering::Relaxed) }

    pub fn merge(&self, other: &QueryStats) {
        self.add_sharded_queries(other.sharded_queries());
        self.add_fetched_series(other.fetched_series());
    }
}
