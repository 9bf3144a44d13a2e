//! Retry policy for sync attempts that fail on the network

use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::VitalsError;

/// What to do after a failed sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry once after `delay`
    RetryAfter { attempt: u32, delay: Duration },
    /// Offline: hold the retry until the network comes back
    WaitForNetwork,
    /// Attempt budget exhausted; counter has been reset
    GiveUp { attempts: u32 },
    /// Application error, never retried automatically
    NotRetryable,
}

/// Linear backoff over network-classified failures.
///
/// Failures while offline do not consume the attempt budget. Giving up and
/// non-network errors both reset the counter, so the next failure starts
/// the sequence again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay multiplied by the attempt number
    base_delay: Duration,
    /// Network failures tolerated while online
    max_attempts: u32,
    /// Consecutive network failures while online
    attempts: u32,
    /// A retry is owed once the network returns
    pending: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 3)
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts: max_attempts.max(1),
            attempts: 0,
            pending: false,
        }
    }

    pub fn from_config(cfg: &NetworkConfig) -> Self {
        Self::new(cfg.retry_base_delay, cfg.max_retry_attempts)
    }

    /// Record a failed attempt and decide what happens next
    pub fn on_failure(&mut self, err: &VitalsError, online: bool) -> RetryDecision {
        if !err.is_network() {
            self.reset();
            return RetryDecision::NotRetryable;
        }

        if !online {
            self.pending = true;
            return RetryDecision::WaitForNetwork;
        }

        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            let attempts = self.attempts;
            self.reset();
            return RetryDecision::GiveUp { attempts };
        }

        self.pending = true;
        RetryDecision::RetryAfter {
            attempt: self.attempts,
            delay: self.base_delay * self.attempts,
        }
    }

    /// Handle a successful sync - reset all retry state
    pub fn on_success(&mut self) {
        self.reset();
    }

    /// Consume the pending flag when a retry is actually started
    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_error() -> VitalsError {
        VitalsError::Network("connection refused".to_string())
    }

    #[test]
    fn test_linear_backoff() {
        let mut policy = RetryPolicy::new(Duration::from_secs(5), 4);

        assert_eq!(
            policy.on_failure(&network_error(), true),
            RetryDecision::RetryAfter {
                attempt: 1,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            policy.on_failure(&network_error(), true),
            RetryDecision::RetryAfter {
                attempt: 2,
                delay: Duration::from_secs(10)
            }
        );
        assert_eq!(
            policy.on_failure(&network_error(), true),
            RetryDecision::RetryAfter {
                attempt: 3,
                delay: Duration::from_secs(15)
            }
        );
    }

    #[test]
    fn test_gives_up_after_max_attempts_and_resets() {
        let mut policy = RetryPolicy::default();

        assert!(matches!(
            policy.on_failure(&network_error(), true),
            RetryDecision::RetryAfter { attempt: 1, .. }
        ));
        assert!(matches!(
            policy.on_failure(&network_error(), true),
            RetryDecision::RetryAfter { attempt: 2, .. }
        ));
        assert_eq!(
            policy.on_failure(&network_error(), true),
            RetryDecision::GiveUp { attempts: 3 }
        );
        assert_eq!(policy.attempts(), 0);
        assert!(!policy.is_pending());

        // A fresh failure starts the sequence again
        assert_eq!(
            policy.on_failure(&network_error(), true),
            RetryDecision::RetryAfter {
                attempt: 1,
                delay: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_offline_failures_do_not_count() {
        let mut policy = RetryPolicy::default();

        for _ in 0..10 {
            assert_eq!(
                policy.on_failure(&network_error(), false),
                RetryDecision::WaitForNetwork
            );
        }
        assert_eq!(policy.attempts(), 0);
        assert!(policy.take_pending());
        assert!(!policy.take_pending());
    }

    #[test]
    fn test_application_errors_reset_and_are_not_retried() {
        let mut policy = RetryPolicy::default();
        policy.on_failure(&network_error(), true);
        assert_eq!(policy.attempts(), 1);

        let decision = policy.on_failure(&VitalsError::invalid_response("garbage"), true);
        assert_eq!(decision, RetryDecision::NotRetryable);
        assert_eq!(policy.attempts(), 0);
        assert!(!policy.is_pending());
    }

    #[test]
    fn test_success_resets() {
        let mut policy = RetryPolicy::default();
        policy.on_failure(&network_error(), true);
        policy.on_success();
        assert_eq!(policy.attempts(), 0);
        assert!(!policy.is_pending());
    }
}
