//! Back-off policy: decides how long a failed task waits before its next claim.

use std::time::Duration;

use crate::domain::SpindleError;

/// Maps a failed-attempt count to the delay before the next retry.
///
/// Implementations must be pure: same input, same output, never zero.
pub trait BackOffPolicy: Send + Sync {
    fn next_delay(&self, attempts: u32) -> Duration;
}

/// Exponential delay starting at `base`, growing by `multiplier`, capped at `cap`.
///
/// `delay = min(base * multiplier^(attempts - 1), cap)`, with `attempts = 0`
/// treated like the first failure.
///
/// Example with base=2min, multiplier=2.0, cap=24h:
/// - attempt 1 (first failure): 2min
/// - attempt 2: 4min
/// - attempt 3: 8min
/// - ...
/// - attempt 11 and later: 24h
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandingBackOff {
    base: Duration,
    multiplier: f64,
    cap: Duration,
}

impl ExpandingBackOff {
    pub fn new(base: Duration, multiplier: f64, cap: Duration) -> Result<Self, SpindleError> {
        if base.is_zero() {
            return Err(SpindleError::Config("backoff base must be positive".into()));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(SpindleError::Config(format!(
                "backoff multiplier must be a finite number >= 1.0, got {multiplier}"
            )));
        }
        if cap < base {
            return Err(SpindleError::Config(format!(
                "backoff cap ({cap:?}) must not be below base ({base:?})"
            )));
        }
        Ok(Self {
            base,
            multiplier,
            cap,
        })
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl Default for ExpandingBackOff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2 * 60),
            multiplier: 2.0,
            cap: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackOffPolicy for ExpandingBackOff {
    fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let cap_ms = self.cap.as_millis() as f64;
        let delay_ms = self.base.as_millis() as f64 * self.multiplier.powi(exponent);

        let delay = if !delay_ms.is_finite() || delay_ms >= cap_ms {
            self.cap
        } else {
            Duration::from_millis(delay_ms.round() as u64)
        };
        delay.max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn default_policy_matches_production_values() {
        let policy = ExpandingBackOff::default();
        assert_eq!(policy.base(), Duration::from_secs(120));
        assert_eq!(policy.multiplier(), 2.0);
        assert_eq!(policy.cap(), Duration::from_secs(86_400));
    }

    #[rstest]
    #[case::never_failed(0, secs(1))]
    #[case::first_failure(1, secs(1))]
    #[case::second_failure(2, secs(2))]
    #[case::third_failure(3, secs(4))]
    #[case::fourth_failure(4, secs(8))]
    #[case::capped(5, secs(10))]
    #[case::far_past_cap(40, secs(10))]
    #[case::u32_max(u32::MAX, secs(10))]
    fn exponential_backoff_is_capped(#[case] attempts: u32, #[case] expected: Duration) {
        let policy = ExpandingBackOff::new(secs(1), 2.0, secs(10)).unwrap();
        assert_eq!(policy.next_delay(attempts), expected);
    }

    #[test]
    fn delays_are_monotonic_and_bounded() {
        let policy = ExpandingBackOff::new(Duration::from_millis(250), 1.5, secs(60)).unwrap();
        let mut previous = Duration::ZERO;
        for attempts in 0..200 {
            let delay = policy.next_delay(attempts);
            assert!(delay >= previous, "attempt {attempts}: {delay:?} < {previous:?}");
            assert!(delay <= secs(60));
            assert!(!delay.is_zero());
            previous = delay;
        }
        assert_eq!(policy.next_delay(0), Duration::from_millis(250));
    }

    #[test]
    fn multiplier_of_one_is_constant() {
        let policy = ExpandingBackOff::new(secs(5), 1.0, secs(5)).unwrap();
        assert_eq!(policy.next_delay(1), secs(5));
        assert_eq!(policy.next_delay(100), secs(5));
    }

    #[rstest]
    #[case::zero_base(Duration::ZERO, 2.0, secs(10))]
    #[case::shrinking(secs(1), 0.5, secs(10))]
    #[case::nan(secs(1), f64::NAN, secs(10))]
    #[case::cap_below_base(secs(10), 2.0, secs(1))]
    fn invalid_parameters_are_rejected(
        #[case] base: Duration,
        #[case] multiplier: f64,
        #[case] cap: Duration,
    ) {
        assert!(matches!(
            ExpandingBackOff::new(base, multiplier, cap),
            Err(SpindleError::Config(_))
        ));
    }
}
