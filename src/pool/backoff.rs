//! Pure reconnection timing
//!
//! Maps the number of retries already fired and the time since the first
//! failure onto either a wait duration or a give-up decision. No clocks are read
//! here; callers pass the elapsed time in.

use std::time::Duration;

/// Capped exponential backoff with a bounded recovery window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for attempt 0
    pub base_delay: Duration,
    /// Exponent cap; the delay never exceeds `base_delay * 2^max_exponent`
    pub max_exponent: u32,
    /// Give up once this much time has passed since the first failure
    pub max_recovery_window: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_exponent: 8,
            max_recovery_window: Duration::from_secs(600),
        }
    }
}

/// Decision result for a pending reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then fire retry number `attempt + 1`
    Proceed { attempt: u32, delay: Duration },
    /// Recovery window exhausted
    GiveUp { elapsed: Duration },
}

impl BackoffPolicy {
    /// Delay before the retry that follows `attempt` fired retries
    ///
    /// `base * 2^min(attempt, max_exponent)`: 1s, 2s, 4s ... 256s with defaults.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_exponent).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Decide whether to schedule another retry (pure function)
    pub fn decide(&self, attempt: u32, since_first_failure: Duration) -> ReconnectionDecision {
        if since_first_failure > self.max_recovery_window {
            return ReconnectionDecision::GiveUp {
                elapsed: since_first_failure,
            };
        }

        ReconnectionDecision::Proceed {
            attempt,
            delay: self.delay_for(attempt),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("base_delay must be greater than 0".to_string());
        }
        if self.max_recovery_window.is_zero() {
            return Err("max_recovery_window must be greater than 0".to_string());
        }
        if self.max_exponent > 31 {
            return Err("max_exponent must be at most 31".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_delays_double_then_cap() {
        let policy = BackoffPolicy::default();

        let delays: Vec<u64> = (0..11).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 256, 256]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(256));
    }

    #[test]
    fn test_decide_proceeds_inside_window() {
        let policy = BackoffPolicy::default();

        assert_eq!(
            policy.decide(0, Duration::ZERO),
            ReconnectionDecision::Proceed {
                attempt: 0,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.decide(2, Duration::from_secs(3)),
            ReconnectionDecision::Proceed {
                attempt: 2,
                delay: Duration::from_secs(4)
            }
        );
        // Boundary is inclusive
        assert!(matches!(
            policy.decide(9, Duration::from_secs(600)),
            ReconnectionDecision::Proceed { .. }
        ));
    }

    #[test]
    fn test_decide_gives_up_after_window() {
        let policy = BackoffPolicy::default();
        let elapsed = Duration::from_secs(601);

        assert_eq!(
            policy.decide(0, elapsed),
            ReconnectionDecision::GiveUp { elapsed }
        );
    }

    #[test]
    fn test_validate() {
        assert!(BackoffPolicy::default().validate().is_ok());

        let zero_base = BackoffPolicy {
            base_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_base.validate().is_err());

        let zero_window = BackoffPolicy {
            max_recovery_window: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_window.validate().is_err());

        let huge_exponent = BackoffPolicy {
            max_exponent: 40,
            ..Default::default()
        };
        assert!(huge_exponent.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_delay_is_monotonic(attempt in 0u32..1000) {
            let policy = BackoffPolicy::default();
            prop_assert!(policy.delay_for(attempt) <= policy.delay_for(attempt + 1));
        }

        #[test]
        fn prop_delay_never_exceeds_cap(attempt in any::<u32>()) {
            let policy = BackoffPolicy::default();
            prop_assert!(policy.delay_for(attempt) <= Duration::from_secs(256));
            prop_assert!(policy.delay_for(attempt) >= Duration::from_secs(1));
        }

        #[test]
        fn prop_window_decides_give_up(attempt in 0u32..64, elapsed_secs in 0u64..2000) {
            let policy = BackoffPolicy::default();
            let decision = policy.decide(attempt, Duration::from_secs(elapsed_secs));
            let gave_up = matches!(decision, ReconnectionDecision::GiveUp { .. });
            prop_assert_eq!(gave_up, elapsed_secs > 600);
        }
    }
}
