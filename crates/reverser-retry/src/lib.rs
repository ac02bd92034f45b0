//! Backoff policy for the Branch Worker's Recovering state.
//!
//! When a push fails, the worker holds its commits locally and retries
//! with exponential backoff, capped, while continuing to accept new
//! events. This crate computes the delay; the worker (`reverser-worker`)
//! owns the retry loop itself, since retries there must interleave with
//! incoming events rather than block a dedicated thread.
//!
//! # Example
//!
//! ```
//! use reverser_retry::{RetryPolicy, calculate_delay};
//!
//! let config = RetryPolicy::Default.to_config();
//! let delay = calculate_delay(&config, 2);
//! assert!(delay.as_secs() > 0);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately.
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt.
    Linear,
    /// Constant delay: same delay every attempt.
    Constant,
}

/// Predefined retry policies for push backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Balanced default: suits most Git remotes.
    #[default]
    Default,
    /// Aggressive: more attempts, faster recovery, for flaky local test remotes.
    Aggressive,
    /// Conservative: fewer attempts, longer delays, for rate-limited remotes.
    Conservative,
    /// Fully custom configuration via an explicit `RetryStrategyConfig`.
    Custom,
}

impl RetryPolicy {
    pub fn to_config(self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 0, // push retries run until Recovering clears; see is_capped()
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
            RetryPolicy::Aggressive => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 0,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.3,
            },
            RetryPolicy::Conservative => RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 0,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
                jitter: 0.1,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Configuration for a retry strategy. `max_attempts == 0` means "retry
/// indefinitely" — the Branch Worker never gives up on a push the way a
/// one-shot CLI publish would; it just keeps Recovering until the remote
/// accepts the push or the worker is torn down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 0,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter: 0.5,
        }
    }
}

impl RetryStrategyConfig {
    /// Whether a given attempt number has exceeded the configured cap.
    /// `max_attempts == 0` means uncapped.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}

/// Classification of a Git failure, returned by every fallible Git call
/// instead of being recovered from a bare error by pattern-matching
/// stderr at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitFailureKind {
    /// Network/auth-transient. The worker stays in Recovering and retries
    /// with the configured backoff.
    #[default]
    Retryable,
    /// The remote branch diverged in a way a rebase cannot safely resolve
    /// (a force-pushed history, most commonly). Treated as permanent: the
    /// worker abandons its clone and re-initializes from scratch rather
    /// than retrying the same rebase forever.
    Permanent,
    /// Remote gained commits since the worker's last fetch. Resolved
    /// inline by rebasing onto the remote tip and force-pushing only this
    /// worker's own unpushed commits — never a blanket overwrite of
    /// history the worker doesn't own.
    Conflict,
}

/// Growth multiplier applied to `base_delay` for attempt `attempt`
/// (1-indexed). Shifts rather than exponentiates, and clamps the shift
/// count itself rather than the resulting power, so it can never
/// overflow regardless of how many attempts a worker has made.
fn growth_multiplier(strategy: RetryStrategyType, attempt: u32) -> u32 {
    match strategy {
        RetryStrategyType::Exponential => {
            let shift = attempt.saturating_sub(1).min(30);
            1u32.checked_shl(shift).unwrap_or(u32::MAX)
        }
        RetryStrategyType::Linear => attempt.max(1),
        RetryStrategyType::Constant | RetryStrategyType::Immediate => 1,
    }
}

/// Calculate the delay before the next retry attempt (1-indexed).
///
/// ```
/// use reverser_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
/// use std::time::Duration;
///
/// let config = RetryStrategyConfig {
///     strategy: RetryStrategyType::Exponential,
///     base_delay: Duration::from_secs(1),
///     max_delay: Duration::from_secs(60),
///     jitter: 0.0,
///     max_attempts: 0,
/// };
/// assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
/// assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
/// ```
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    if config.strategy == RetryStrategyType::Immediate {
        return Duration::ZERO;
    }

    let multiplier = growth_multiplier(config.strategy, attempt);
    let uncapped = config.base_delay.checked_mul(multiplier).unwrap_or(config.max_delay);
    let bounded = uncapped.min(config.max_delay);

    spread(bounded, config.jitter)
}

/// Randomize `delay` within `±factor` of itself by sampling uniformly
/// from the resulting window, rather than scaling a single random draw.
/// A factor of 0 (or below) leaves the delay untouched.
fn spread(delay: Duration, factor: f64) -> Duration {
    use rand::RngExt;

    if factor <= 0.0 {
        return delay;
    }

    let center_ms = delay.as_millis() as f64;
    let half_width = center_ms * factor.min(1.0);
    let lower = (center_ms - half_width).max(0.0);
    let upper = center_ms + half_width;

    let sampled = if upper > lower { rand::rng().random_range(lower..=upper) } else { center_ms };
    Duration::from_millis(sampled.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_uncapped() {
        let config = RetryPolicy::Default.to_config();
        assert!(!config.is_exhausted(10_000));
    }

    fn no_jitter(strategy: RetryStrategyType, base: Duration, max: Duration) -> RetryStrategyConfig {
        RetryStrategyConfig { strategy, base_delay: base, max_delay: max, jitter: 0.0, max_attempts: 0 }
    }

    /// Each strategy's growth curve at a handful of attempt numbers,
    /// table-driven so adding a fifth strategy later is one more row.
    #[test]
    fn delay_grows_per_strategy_and_caps_at_max_delay() {
        let cases: &[(RetryStrategyType, u32, Duration)] = &[
            (RetryStrategyType::Exponential, 1, Duration::from_secs(1)),
            (RetryStrategyType::Exponential, 2, Duration::from_secs(2)),
            (RetryStrategyType::Exponential, 3, Duration::from_secs(4)),
            (RetryStrategyType::Exponential, 10, Duration::from_secs(60)),
            (RetryStrategyType::Linear, 1, Duration::from_secs(1)),
            (RetryStrategyType::Linear, 5, Duration::from_secs(5)),
            (RetryStrategyType::Linear, 100, Duration::from_secs(60)),
            (RetryStrategyType::Constant, 1, Duration::from_secs(1)),
            (RetryStrategyType::Constant, 40, Duration::from_secs(1)),
        ];

        for (strategy, attempt, expected) in cases.iter().copied() {
            let config = no_jitter(strategy, Duration::from_secs(1), Duration::from_secs(60));
            assert_eq!(calculate_delay(&config, attempt), expected, "strategy={strategy:?} attempt={attempt}");
        }
    }

    #[test]
    fn immediate_strategy_ignores_base_delay_and_jitter() {
        let mut config = no_jitter(RetryStrategyType::Immediate, Duration::from_secs(9), Duration::from_secs(9));
        config.jitter = 0.9;
        assert_eq!(calculate_delay(&config, 1), Duration::ZERO);
        assert_eq!(calculate_delay(&config, 50), Duration::ZERO);
    }

    #[test]
    fn exponential_shift_never_overflows_far_past_the_cap() {
        let config = no_jitter(RetryStrategyType::Exponential, Duration::from_secs(1), Duration::from_secs(60));
        // Attempt numbers this large exist only after weeks of a remote
        // staying unreachable; the cap must hold regardless.
        assert_eq!(calculate_delay(&config, 500), Duration::from_secs(60));
    }

    #[test]
    fn spread_keeps_delay_within_jitter_window_and_respects_cap() {
        let mut config = no_jitter(RetryStrategyType::Constant, Duration::from_secs(10), Duration::from_secs(60));
        config.jitter = 0.5;
        for _ in 0..200 {
            let delay = calculate_delay(&config, 1);
            assert!(delay >= Duration::from_millis(5000), "{delay:?} below jitter floor");
            assert!(delay <= Duration::from_millis(15000), "{delay:?} above jitter ceiling");
        }

        // max_delay bounds the pre-jitter value, not the final one: jitter
        // is applied after capping, so it can still spread the result
        // above max_delay by up to the jitter factor.
        let mut at_cap = no_jitter(RetryStrategyType::Constant, Duration::from_secs(60), Duration::from_secs(60));
        at_cap.jitter = 0.5;
        for _ in 0..200 {
            assert!(calculate_delay(&at_cap, 1) <= Duration::from_secs(60) + Duration::from_millis(30_000));
        }
    }

    #[test]
    fn zero_jitter_factor_is_exact() {
        let config = no_jitter(RetryStrategyType::Constant, Duration::from_secs(3), Duration::from_secs(10));
        for _ in 0..20 {
            assert_eq!(calculate_delay(&config, 1), Duration::from_secs(3));
        }
    }

    #[test]
    fn retryable_git_failures_are_the_default_classification() {
        assert_eq!(GitFailureKind::default(), GitFailureKind::Retryable);
    }

    #[test]
    fn is_exhausted_respects_cap_but_zero_means_unbounded() {
        let mut config = RetryStrategyConfig::default();
        assert!(!config.is_exhausted(10_000), "max_attempts == 0 must never report exhausted");

        config.max_attempts = 3;
        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
        assert!(config.is_exhausted(4));
    }
}
