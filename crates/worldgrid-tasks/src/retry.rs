//! Exponential backoff for redelivered tasks.

use std::time::Duration;

use worldgrid_core::config::TaskConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first redelivery.
    pub base_delay: Duration,
    pub multiplier: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Deliveries allowed before a task is dead-lettered.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            base_delay: config.reconcile_delay(),
            multiplier: config.backoff_multiplier.max(1),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Delay before redelivering a task that has failed `attempts` times.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TaskConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(30),
            multiplier: 2,
            max_delay: Duration::from_secs(600),
            max_attempts: 5,
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_secs(30));
        assert_eq!(p.delay_for(2), Duration::from_secs(60));
        assert_eq!(p.delay_for(3), Duration::from_secs(120));
        assert_eq!(p.delay_for(6), Duration::from_secs(600));
        assert_eq!(p.delay_for(40), Duration::from_secs(600));
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let p = policy();
        assert!(!p.is_exhausted(4));
        assert!(p.is_exhausted(5));
    }

    #[test]
    fn from_config_uses_reconcile_delay_as_base() {
        let p = RetryPolicy::default();
        assert_eq!(p.base_delay, Duration::from_secs(30));
        assert_eq!(p.max_attempts, 20);
    }
}
