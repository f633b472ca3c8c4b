//! shardq core types shared by the selector, merge and proxy crates.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use smallvec::SmallVec;

mod body;
mod shard;
mod stats;

pub use body::Body;
pub use shard::{stable_hash, ShardLabelError, ShardSelector};
pub use stats::QueryStats;

/// Request header carrying a per-request shard count override.
pub const SHARDING_CONTROL_HEADER: &str = "Sharding-Control";
/// Request header carrying the tenant id.
pub const ORG_ID_HEADER: &str = "X-Scope-OrgID";
/// Synthetic label used to route a selector to one shard.
pub const SHARD_LABEL: &str = "__query_shard__";
/// `Accept-Encoding` / `Content-Encoding` token for the Snappy framing format.
pub const ENCODING_SNAPPY_FRAMED: &str = "x-snappy-framed";

pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

pub mod prelude {
    pub use super::{Body, QueryStats, Request, Response, ResultItem, RoundTripper, ShardSelector};
}

/// Sends one request and yields one response whose body is still streaming.
///
/// Non-2xx statuses are returned as responses, not errors; `Err` is reserved
/// for transport failures.
#[async_trait::async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: Request) -> anyhow::Result<Response>;
}

#[async_trait::async_trait]
impl<T: RoundTripper + ?Sized> RoundTripper for Arc<T> {
    async fn round_trip(&self, req: Request) -> anyhow::Result<Response> {
        (**self).round_trip(req).await
    }
}

/// One entry of an upstream `data` array: field/value pairs in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResultItem {
    fields: SmallVec<[(String, String); 8]>,
}

impl ResultItem {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize { self.fields.len() }
    pub fn is_empty(&self) -> bool { self.fields.is_empty() }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResultItem {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

impl Serialize for ResultItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
