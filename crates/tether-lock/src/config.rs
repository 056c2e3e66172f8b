use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default lock lifetime handed out by `LockFactory`, in seconds.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Pause between attempts when blocking on a store that cannot block itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub delay_ms: u64,
    /// Random spread applied in both directions around `delay_ms`
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay_ms: 100,
            jitter_ms: 10,
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::from_millis(self.delay_ms);
        }

        let low = self.delay_ms.saturating_sub(self.jitter_ms);
        let high = self.delay_ms.saturating_add(self.jitter_ms);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

/// Defaults applied to every lock created by a `LockFactory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lifetime of new locks; `None` creates locks that never expire
    pub default_ttl_secs: Option<u64>,
    /// Release locks still held when they are dropped
    pub auto_release: bool,
    pub retry: RetryPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: Some(DEFAULT_TTL_SECS),
            auto_release: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }
}
