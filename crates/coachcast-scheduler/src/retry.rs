//! Retry and fallback decisions after a failed send.

use chrono::{DateTime, Duration, Utc};
use coachcast_core::config::RetryConfig;
use coachcast_core::error::CoachcastError;
use coachcast_core::types::DeliveryJob;
use rand::Rng;

/// What to do with a job whose last attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Try the same channel again at `at`.
    Retry { at: DateTime<Utc> },
    /// Move on to the channel at this position in the preference list.
    Fallback { channel_index: u32 },
    GiveUp,
}

/// Upper bound on any single retry delay (one week).
const DELAY_CEILING_SECS: u64 = 7 * 86_400;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts_per_channel: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts_per_channel: config.max_attempts_per_channel.max(1),
            base_delay_secs: config.base_delay_secs.min(DELAY_CEILING_SECS),
            max_delay_secs: config.max_delay_secs.min(DELAY_CEILING_SECS),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// `base * 2^attempt`, capped. `attempt` is zero for the first retry.
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_delay_secs.saturating_mul(factor).min(self.max_delay_secs)
    }

    /// Delay before the next attempt. A provider hint wins over backoff.
    pub fn delay(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        if let Some(secs) = retry_after {
            return Duration::seconds(secs.min(self.max_delay_secs).min(DELAY_CEILING_SECS) as i64);
        }
        let backoff = self.backoff_secs(attempt).min(DELAY_CEILING_SECS) as f64;
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - self.jitter)..=1.0)
        } else {
            1.0
        };
        Duration::milliseconds((backoff * factor * 1000.0) as i64)
    }

    /// Decide the next step for `job`, whose `attempts` already counts the failure.
    ///
    /// `reachable[i]` says whether the i-th preferred channel is configured
    /// and has an address for the subscriber.
    pub fn next_step(
        &self,
        job: &DeliveryJob,
        err: &CoachcastError,
        reachable: &[bool],
        now: DateTime<Utc>,
    ) -> NextStep {
        if err.is_retryable() && job.attempts < self.max_attempts_per_channel {
            let delay = self.delay(job.attempts.saturating_sub(1), err.retry_after());
            return NextStep::Retry { at: now + delay };
        }

        let next = reachable
            .iter()
            .enumerate()
            .skip(job.channel_index as usize + 1)
            .find(|(_, ok)| **ok)
            .map(|(i, _)| i as u32);
        match next {
            Some(channel_index) => NextStep::Fallback { channel_index },
            None => NextStep::GiveUp,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
