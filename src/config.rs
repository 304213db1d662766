use std::time::Duration;

use callcore::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Timing and path-selection knobs for a call context.
///
/// Durations are stored in milliseconds so the config can be read straight
/// from JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Upper bound for one connect attempt against one path.
    pub attempt_timeout_ms: u64,
    /// Attempts per path, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Probe alternative candidates concurrently instead of one by one.
    pub parallel_alternatives: bool,
    /// After the first alternative answers, wait this long for a faster one.
    pub selection_window_ms: u64,
    /// Resend interval for connectivity probes within one attempt.
    pub probe_interval_ms: u64,
    /// Silence on an established path after which it is considered lost.
    pub loss_timeout_ms: u64,
    pub prefer_ipv6: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 3000,
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2000,
            parallel_alternatives: true,
            selection_window_ms: 100,
            probe_interval_ms: 250,
            loss_timeout_ms: 10_000,
            prefer_ipv6: false,
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn selection_window(&self) -> Duration {
        Duration::from_millis(self.selection_window_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn loss_timeout(&self) -> Duration {
        Duration::from_millis(self.loss_timeout_ms)
    }
}
