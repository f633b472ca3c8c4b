use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-tenant sharding limits consumed by the proxy.
pub trait Limits: Send + Sync {
    /// Shard count used when the request carries no override.
    fn query_sharding_total_shards(&self, tenant: &str) -> usize;
    /// Largest shard count a request may ask for.
    fn query_sharding_max_sharded_queries(&self, tenant: &str) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantLimits {
    pub query_sharding_total_shards: usize,
    pub query_sharding_max_sharded_queries: usize,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self { query_sharding_total_shards: 16, query_sharding_max_sharded_queries: 128 }
    }
}

/// Override entry; unset fields fall back to [`StaticLimits::defaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsOverride {
    pub query_sharding_total_shards: Option<usize>,
    pub query_sharding_max_sharded_queries: Option<usize>,
}

/// Limits from configuration: global defaults plus per-tenant overrides.
///
/// ```yaml
/// defaults:
///   query_sharding_total_shards: 16
///   query_sharding_max_sharded_queries: 128
/// overrides:
///   tenant-a:
///     query_sharding_total_shards: 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticLimits {
    pub defaults: TenantLimits,
    pub overrides: HashMap<String, LimitsOverride>,
}

impl StaticLimits {
    pub fn new(defaults: TenantLimits) -> Self {
        Self { defaults, overrides: HashMap::new() }
    }

    pub fn with_override(mut self, tenant: impl Into<String>, o: LimitsOverride) -> Self {
        self.overrides.insert(tenant.into(), o);
        self
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).context("parsing limits yaml")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading limits file {}", path.display()))?;
        let limits = Self::from_yaml_str(&raw)?;
        tracing::info!(path = %path.display(), overrides = limits.overrides.len(), "loaded tenant limits");
        Ok(limits)
    }
}

impl Limits for StaticLimits {
    fn query_sharding_total_shards(&self, tenant: &str) -> usize {
        self.overrides
            .get(tenant)
            .and_then(|o| o.query_sharding_total_shards)
            .unwrap_or(self.defaults.query_sharding_total_shards)
    }

    fn query_sharding_max_sharded_queries(&self, tenant: &str) -> usize {
        self.overrides
            .get(tenant)
            .and_then(|o| o.query_sharding_max_sharded_queries)
            .unwrap_or(self.defaults.query_sharding_max_sharded_queries)
    }
}
