use std::time::Duration;

/// Longest step timeout honoured; larger values are clamped.
pub const MAX_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 86_400);

/// Tunables shared by the orchestrator, the workers and the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaSettings {
    /// How long a step may stay in flight before the sweep acts.
    pub step_timeout: Duration,
    /// Re-issues of one step before the order is cancelled as timed out.
    pub max_reissues: u32,
    pub sweep_interval: Duration,
    /// Expired contexts handled per sweep.
    pub sweep_batch: usize,
    /// TTL of the cached profile snapshot.
    pub cache_ttl: Duration,
    pub workers_per_topic: usize,
    /// Backoff before a failed message is handed back: `retry_base`
    /// doubled per attempt, at most `retry_cap`.
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl SagaSettings {
    pub fn step_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.step_timeout.min(MAX_STEP_TIMEOUT))
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Backoff before redelivering a message on its `attempt`-th failure.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.retry_base
            .saturating_mul(1u32 << shift)
            .min(self.retry_cap)
    }
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            max_reissues: 3,
            sweep_interval: Duration::from_secs(5),
            sweep_batch: 100,
            cache_ttl: Duration::from_secs(86_400),
            workers_per_topic: 4,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = SagaSettings::default();
        assert_eq!(settings.backoff(1), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(200));
        assert_eq!(settings.backoff(4), Duration::from_millis(800));
        assert_eq!(settings.backoff(50), Duration::from_secs(5));
    }

    #[test]
    fn test_step_timeout_converts() {
        let settings = SagaSettings::default();
        assert_eq!(settings.step_timeout_chrono(), chrono::Duration::seconds(30));
    }

    #[test]
    fn test_huge_step_timeout_is_clamped() {
        let settings = SagaSettings {
            step_timeout: Duration::from_secs(u64::MAX / 2),
            ..SagaSettings::default()
        };
        assert_eq!(settings.step_timeout_chrono(), chrono::Duration::days(30));
    }
}
