// Queue configuration shared by the API, the worker and the CLI

use std::time::Duration;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub redis_url: String,
    /// TTL applied to a job record once it is terminal
    pub result_ttl_secs: u64,
    /// How long a claimed job stays owned without a lease renewal
    pub lease_ttl_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            result_ttl_secs: 86_400,
            lease_ttl_ms: 30_000,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `REDIS_URL`, `SKILLEVAL_RESULT_TTL_SECS`
    /// and `SKILLEVAL_LEASE_TTL_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("REDIS_URL").filter(|v| !v.trim().is_empty()) {
            config.redis_url = url;
        }
        if let Some(ttl) = lookup("SKILLEVAL_RESULT_TTL_SECS").and_then(|v| v.parse().ok()) {
            config.result_ttl_secs = ttl;
        }
        if let Some(lease) = lookup("SKILLEVAL_LEASE_TTL_MS").and_then(|v| v.parse().ok()) {
            config.lease_ttl_ms = lease;
        }
        config
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}
