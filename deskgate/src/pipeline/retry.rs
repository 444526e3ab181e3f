//! Restart policy and backoff between stage attempts.
//!
//! A stage that fails its probe (or dies while running) may be spawned
//! again if its [`RestartPolicy`] allows. The pause between attempts comes
//! from a [`BackoffConfig`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    Exponential,
    /// delay = base * (attempt + 1)
    #[default]
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent restart storms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Delay settings between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            strategy: BackoffStrategy::Linear,
            jitter: JitterStrategy::None,
        }
    }
}

impl BackoffConfig {
    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Whether a failed stage may be spawned again.
///
/// `OnFailure { max_attempts: n }` allows `n` spawns in total; `Never`
/// allows exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    Never,
    /// Restart on failure, up to a bound.
    OnFailure {
        /// Total spawn attempts allowed.
        max_attempts: u32,
        /// Delay between attempts.
        #[serde(default)]
        backoff: BackoffConfig,
    },
}

impl RestartPolicy {
    /// On-failure policy with the default backoff.
    #[must_use]
    pub fn on_failure(max_attempts: u32) -> Self {
        Self::OnFailure {
            max_attempts,
            backoff: BackoffConfig::default(),
        }
    }

    /// Replaces the backoff. No effect on `Never`.
    #[must_use]
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        if let Self::OnFailure { backoff, .. } = &mut self {
            *backoff = config;
        }
        self
    }

    /// Total spawn attempts allowed (at least one).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Never => 1,
            Self::OnFailure { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Restarts allowed after a running stage dies, over the pipeline's
    /// lifetime. Each restart gets a fresh `max_attempts` spawn budget.
    #[must_use]
    pub fn runtime_budget(&self) -> u32 {
        match self {
            Self::Never => 0,
            Self::OnFailure { max_attempts, .. } => *max_attempts,
        }
    }

    /// Returns the backoff settings.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        match self {
            Self::Never => BackoffConfig::default(),
            Self::OnFailure { backoff, .. } => *backoff,
        }
    }
}

/// Attempt bookkeeping for one stage.
#[derive(Debug, Default, Clone)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempts: u32,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a spawn attempt.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Returns true if the policy allows another attempt.
    #[must_use]
    pub fn has_remaining(&self, policy: &RestartPolicy) -> bool {
        self.attempts < policy.max_attempts()
    }

    /// Calculates the delay before the next attempt.
    #[must_use]
    pub fn next_delay(&mut self, config: &BackoffConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        // Zero-based index of the retry about to happen.
        let retry = self.attempts.saturating_sub(1);

        let delay = match config.strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        self.previous_delay_ms = Some(jittered);
        Duration::from_millis(jittered)
    }
}
