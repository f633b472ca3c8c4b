use std::time::Duration;

use shardq_merge::{ContentEncoding, MergeOptions};

/// Tunables for [`crate::ShardActiveSeries`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Largest POST form body read while looking for the selector.
    pub max_form_bytes: usize,
    /// How much of a failed shard's body is quoted in the error message.
    pub error_snippet_bytes: usize,
    /// Upper bound on draining an upstream body that will not be used.
    pub drain_timeout: Duration,
    /// Uncompressed output bytes buffered before a chunk goes to the client.
    pub flush_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_form_bytes: 1 << 20,
            error_snippet_bytes: 1024,
            drain_timeout: Duration::from_secs(1),
            flush_bytes: 4096,
        }
    }
}

impl ProxyConfig {
    /// Defaults overridden by `SHARDQ_MAX_FORM_BYTES`,
    /// `SHARDQ_ERROR_SNIPPET_BYTES`, `SHARDQ_DRAIN_TIMEOUT_MS` and
    /// `SHARDQ_FLUSH_BYTES`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_form_bytes: env_parse("SHARDQ_MAX_FORM_BYTES").unwrap_or(d.max_form_bytes),
            error_snippet_bytes: env_parse("SHARDQ_ERROR_SNIPPET_BYTES").unwrap_or(d.error_snippet_bytes),
            drain_timeout: env_parse("SHARDQ_DRAIN_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(d.drain_timeout),
            flush_bytes: env_parse("SHARDQ_FLUSH_BYTES").unwrap_or(d.flush_bytes),
        }
    }

    pub(crate) fn merge_options(&self, encoding: ContentEncoding) -> MergeOptions {
        MergeOptions { encoding, flush_bytes: self.flush_bytes, drain_timeout: self.drain_timeout }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
