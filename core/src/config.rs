use crate::types::RunKind;
use anyhow::{bail, Context};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound for every configured duration: 30 days.
pub const MAX_DURATION_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// Milliseconds as a signed duration, saturating at `MAX_DURATION_MS`.
pub(crate) fn bounded_millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_DURATION_MS) as i64)
}

/// Claim-loop timing for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Delay between claim attempts when the queue is empty.
    pub poll_interval_ms: u64,
    /// A claimed/running row whose `claimed_at` is older than this is
    /// reclaimable. Must exceed the heartbeat interval plus clock skew.
    pub stale_after_ms: u64,
    /// Minimum spacing between heartbeats sent while processing.
    pub heartbeat_interval_ms: u64,
    /// Tolerated clock skew between worker hosts.
    #[serde(default = "default_clock_skew_ms")]
    pub clock_skew_ms: u64,
}

fn default_clock_skew_ms() -> u64 {
    5_000
}

impl QueueConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        bounded_millis(self.stale_after_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        bounded_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one. 1 disables retries.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction in [0, 1] of each delay that is randomized away.
    #[serde(default)]
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    pub default_limit: u32,
    pub max_limit: u32,
}

/// External engine invoked for one run kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceConfigFile {
    queue: QueueConfig,
    retry: RetryConfig,
    #[serde(default = "default_pagination")]
    pagination: PaginationConfig,
    #[serde(default)]
    processors: BTreeMap<String, ProcessorCommand>,
}

fn default_pagination() -> PaginationConfig {
    PaginationConfig { default_limit: 50, max_limit: 200 }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub pagination: PaginationConfig,
    pub processors: BTreeMap<RunKind, ProcessorCommand>,
}

impl ServiceConfig {
    /// Load from a JSON config file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service config: {path}"))?;
        Self::from_json(&content).with_context(|| format!("Invalid service config: {path}"))
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let file: ServiceConfigFile = serde_json::from_str(content)?;
        let mut processors = BTreeMap::new();
        for (kind, command) in file.processors {
            let kind: RunKind = kind
                .parse()
                .with_context(|| format!("processors.{kind}"))?;
            processors.insert(kind, command);
        }
        let config = Self {
            queue: file.queue,
            retry: file.retry,
            pagination: file.pagination,
            processors,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let q = &self.queue;
        let r = &self.retry;
        for (field, ms) in [
            ("queue.poll_interval_ms", q.poll_interval_ms),
            ("queue.stale_after_ms", q.stale_after_ms),
            ("queue.heartbeat_interval_ms", q.heartbeat_interval_ms),
            ("queue.clock_skew_ms", q.clock_skew_ms),
            ("retry.backoff_base_ms", r.backoff_base_ms),
            ("retry.backoff_cap_ms", r.backoff_cap_ms),
        ] {
            if ms > MAX_DURATION_MS {
                bail!("{field} ({ms}) must not exceed {MAX_DURATION_MS}");
            }
        }
        if q.poll_interval_ms == 0 {
            bail!("queue.poll_interval_ms must be positive");
        }
        if q.heartbeat_interval_ms == 0 {
            bail!("queue.heartbeat_interval_ms must be positive");
        }
        if q.stale_after_ms <= q.heartbeat_interval_ms.saturating_add(q.clock_skew_ms) {
            bail!(
                "queue.stale_after_ms ({}) must exceed heartbeat_interval_ms + clock_skew_ms ({})",
                q.stale_after_ms,
                q.heartbeat_interval_ms.saturating_add(q.clock_skew_ms)
            );
        }
        if r.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if r.backoff_cap_ms < r.backoff_base_ms {
            bail!("retry.backoff_cap_ms must be >= backoff_base_ms");
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            bail!("retry.jitter must be within [0, 1]");
        }
        let p = &self.pagination;
        if p.default_limit == 0 || p.default_limit > p.max_limit {
            bail!("pagination.default_limit must be within [1, max_limit]");
        }
        Ok(())
    }

    /// Production-shaped defaults: 2s poll, 10 minute staleness.
    pub fn default_service() -> Self {
        Self {
            queue: QueueConfig {
                poll_interval_ms: 2_000,
                stale_after_ms: 10 * 60 * 1_000,
                heartbeat_interval_ms: 30_000,
                clock_skew_ms: default_clock_skew_ms(),
            },
            retry: RetryConfig {
                max_attempts: 3,
                backoff_base_ms: 5_000,
                backoff_cap_ms: 5 * 60 * 1_000,
                jitter: 0.2,
            },
            pagination: default_pagination(),
            processors: BTreeMap::new(),
        }
    }

    /// Fast, deterministic settings for tests.
    pub fn default_test() -> Self {
        Self {
            queue: QueueConfig {
                poll_interval_ms: 5,
                stale_after_ms: 60_000,
                heartbeat_interval_ms: 1_000,
                clock_skew_ms: 0,
            },
            retry: RetryConfig {
                max_attempts: 2,
                backoff_base_ms: 1_000,
                backoff_cap_ms: 8_000,
                jitter: 0.0,
            },
            pagination: default_pagination(),
            processors: BTreeMap::new(),
        }
    }
}
