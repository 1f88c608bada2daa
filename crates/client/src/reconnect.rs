//! Retry delays and attempt ceiling shared by both transports.

use std::time::Duration;

/// Exponential backoff: `min(base * 2^attempt, cap)`, at most `max_attempts`
/// retries between two successful connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub cap_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, cap_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            cap_delay,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.cap_delay)
            .min(self.cap_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// How a push channel ended, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// We closed it on purpose (cancel, terminal job). Never retried.
    Intentional,
    /// Network or server drop. Retried per policy.
    Abnormal,
}

/// Attempt counter driven by one transport.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a close. Returns the delay before the next attempt, or `None`
    /// when the close was intentional or the budget is spent.
    pub fn on_close(&mut self, kind: CloseKind) -> Option<Duration> {
        if kind == CloseKind::Intentional || !self.policy.should_retry(self.attempt) {
            return None;
        }
        let delay = self.policy.next_delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// A connection succeeded; the budget starts over.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
