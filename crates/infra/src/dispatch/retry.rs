//! Redelivery policy: how long to wait before a failed message is delivered
//! again, and when to give up and dead-letter it.

use std::time::Duration;

use waypoint_core::CommandError;

/// Backoff strategy for redeliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Fixed delay between deliveries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// What the runtime does with a delivery once its command has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Redeliver(Duration),
    DeadLetter(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total deliveries allowed, including the first (1 = never redeliver).
    pub max_deliveries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Dead-letter on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_deliveries: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_deliveries: u32, delay: Duration) -> Self {
        Self {
            max_deliveries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_deliveries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_deliveries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before redelivering after failed delivery `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so redeliveries of many messages do not line up.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// Whether delivery `attempt` may be followed by another one.
    pub fn should_redeliver(&self, attempt: u32) -> bool {
        attempt < self.max_deliveries
    }

    /// Decide the fate of a delivery from its command outcome.
    pub fn disposition(&self, attempt: u32, outcome: &Result<(), CommandError>) -> Disposition {
        match outcome {
            Ok(()) => Disposition::Ack,
            Err(e) if !e.is_retryable() => Disposition::DeadLetter(e.to_string()),
            Err(e) if !self.should_redeliver(attempt) => Disposition::DeadLetter(format!(
                "gave up after {attempt} deliveries: {e}"
            )),
            Err(_) => Disposition::Redeliver(self.delay_for_attempt(attempt)),
        }
    }
}
