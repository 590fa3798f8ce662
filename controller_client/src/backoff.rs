use crate::config::ReconnectPolicy;
use std::time::Duration;

/// Exponential reconnect delays: `base * 2^n`, capped at `max_delay`.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }

    /// `None` once the retry budget is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let factor = 1u32 << self.attempt.min(16);
        let delay = self
            .policy
            .base_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts,
        }
    }

    #[test]
    fn delays_double_then_cap() {
        let mut b = Backoff::new(policy(None));
        let delays: Vec<u64> = (0..7)
            .map(|_| b.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn never_overflows_on_long_outages() {
        let mut b = Backoff::new(policy(None));
        for _ in 0..10_000 {
            assert!(b.next_delay().unwrap() <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn budget_is_enforced_and_reset_restores_it() {
        let mut b = Backoff::new(policy(Some(2)));
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempts(), 2);

        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn zero_budget_never_retries() {
        let mut b = Backoff::new(policy(Some(0)));
        assert_eq!(b.next_delay(), None);
    }
}
