// Reconnect backoff policy for upstream sessions.
//
// Delay doubles per consecutive failure from `base_delay`, capped at
// `max_delay`. Once the failure count reaches `failure_ceiling` the delay is
// pinned to `max_delay` instead of growing further.

use std::time::Duration;

/// Reconnection parameters for one tenant's upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which the delay stays at `max_delay`.
    pub failure_ceiling: u32,
    /// Proxy failures tolerated before switching to direct transport.
    pub proxy_failure_threshold: u32,
    /// Delay applied after a failure while in direct fallback mode.
    pub fallback_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(60 * 60),
            failure_ceiling: 10,
            proxy_failure_threshold: 5,
            fallback_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff delay for the given consecutive failure count.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures >= self.failure_ceiling {
            return self.max_delay;
        }
        // 2^31 already saturates any realistic base; clamp the shift.
        let exp = failures.min(31);
        let delay = DurationSaturatingMul::saturating_mul(self.base_delay, 1u64 << exp);
        delay.min(self.max_delay)
    }
}

trait DurationSaturatingMul {
    fn saturating_mul(self, rhs: u64) -> Self;
}

impl DurationSaturatingMul for Duration {
    fn saturating_mul(self, rhs: u64) -> Self {
        let nanos = self.as_nanos().saturating_mul(rhs as u128);
        if nanos > u64::MAX as u128 {
            Duration::from_secs(u64::MAX)
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_production_constants() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(15));
        assert_eq!(policy.max_delay, Duration::from_secs(3600));
        assert_eq!(policy.failure_ceiling, 10);
        assert_eq!(policy.proxy_failure_threshold, 5);
        assert_eq!(policy.fallback_delay, Duration::from_secs(900));
    }

    #[test]
    fn delay_doubles_per_failure() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(15));
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
    }

    #[test]
    fn delay_is_monotonic_and_capped() {
        let policy = ReconnectPolicy::default();
        let mut previous = Duration::ZERO;
        for failures in 0..64 {
            let delay = policy.delay_for(failures);
            assert!(delay >= previous, "delay shrank at failure {failures}");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn ceiling_pins_to_max_delay() {
        let policy = ReconnectPolicy { failure_ceiling: 3, ..Default::default() };
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), policy.max_delay);
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }

    #[test]
    fn huge_base_saturates_instead_of_overflowing() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(u64::MAX / 2),
            max_delay: Duration::from_secs(u64::MAX),
            failure_ceiling: u32::MAX,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(40), Duration::from_secs(u64::MAX));
    }
}
