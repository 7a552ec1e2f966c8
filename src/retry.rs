//! Bounded retry with cooldown, shared by every fallible session operation.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// `max_attempts` consecutive failures trigger a `cooldown_delay` pause and
/// reset the counter; fewer failures wait `retry_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub cooldown_delay: Duration,
}

impl RetryPolicy {
    /// 3 attempts, 1 unit between them, 5 units of cooldown.
    pub fn with_unit(unit: Duration) -> Self {
        Self {
            max_attempts: 3,
            retry_delay: unit,
            cooldown_delay: unit * 5,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::with_unit(Duration::from_secs(1))
    }
}

/// What to wait after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Retry(Duration),
    Cooldown(Duration),
}

impl Delay {
    pub fn duration(self) -> Duration {
        match self {
            Delay::Retry(d) | Delay::Cooldown(d) => d,
        }
    }
}

/// Per-loop failure counter driven by a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn record_failure(&mut self) -> Delay {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            self.failures = 0;
            Delay::Cooldown(self.policy.cooldown_delay)
        } else {
            Delay::Retry(self.policy.retry_delay)
        }
    }

    /// Record a failure and sleep for the resulting delay. Returns early with
    /// `false` if the run stops while sleeping.
    pub async fn fail_and_wait(&mut self, label: &str, cancel: &CancellationToken) -> bool {
        let delay = self.record_failure();
        if let Delay::Cooldown(d) = delay {
            warn!(
                "{}: {} consecutive failures, cooling down for {:?}",
                label, self.policy.max_attempts, d
            );
        }
        sleep_or_cancel(delay.duration(), cancel).await
    }
}

/// Sleep for `duration`; `false` if cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
