//! Recovery policy: opt-in handling of stuck installs and broken watches.
//!
//! Both hooks are off by default: a `running` install is only reported,
//! and a failed watch stops the gateway.

use std::time::Duration;

use div_core::config::GatewayConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Mark a `running` install `failed` once it has run this long. Checked
    /// on every install event and on a periodic sweep of stored installs.
    pub running_timeout: Option<Duration>,
    /// Reopen a watch whose stream failed instead of stopping.
    pub resubscribe_on_error: bool,
}

impl RecoveryPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            running_timeout: config.running_timeout(),
            resubscribe_on_error: config.resubscribe_on_error,
        }
    }

    /// How often stored installs are swept for timeouts: a quarter of the
    /// timeout, at least once a second. `None` without a timeout.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.running_timeout
            .map(|timeout| (timeout / 4).max(Duration::from_secs(1)))
    }

    /// Whether an install that started at `started_at` (unix seconds) has
    /// outlived the timeout at `now`. Never true without a timeout or a
    /// start time.
    pub fn timed_out(&self, started_at: Option<u64>, now: u64) -> bool {
        match (self.running_timeout, started_at) {
            (Some(timeout), Some(started)) => now.saturating_sub(started) >= timeout.as_secs(),
            _ => false,
        }
    }
}
