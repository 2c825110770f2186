//! Exponential backoff policy.
//!
//! `delay(n) = initial * multiplier^(n-1)`, capped at `max_delay`, then
//! optionally jittered by up to 30% in either direction and clamped to
//! `[0, max_delay]` again.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Fraction of the capped delay used as the jitter spread.
pub const JITTER_FRACTION: f64 = 0.3;

/// Retry budget for mirror attempts.
pub const MIRROR_MAX_RETRIES: u32 = 2;

/// Invalid backoff parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackoffConfigError {
    /// The cap is below the first delay.
    #[error("max delay {max:?} is shorter than initial delay {initial:?}")]
    MaxBelowInitial {
        /// Initial delay.
        initial: Duration,
        /// Maximum delay.
        max: Duration,
    },

    /// The multiplier would shrink delays or is not a number.
    #[error("multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),
}

/// Retry and backoff parameters. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Creates a configuration builder.
    pub fn builder() -> BackoffConfigBuilder {
        BackoffConfigBuilder::default()
    }

    /// Default policy with the reduced mirror retry budget.
    pub fn mirror() -> Self {
        Self {
            max_retries: MIRROR_MAX_RETRIES,
            ..Self::default()
        }
    }

    /// Number of retries after the first attempt.
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the first retry.
    pub const fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Upper bound for any delay.
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Growth factor between consecutive delays.
    pub const fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Whether delays are jittered.
    pub const fn jitter(&self) -> bool {
        self.jitter
    }
}

/// Builder for [`BackoffConfig`]. Unset fields take the defaults.
#[derive(Debug, Default)]
pub struct BackoffConfigBuilder {
    max_retries: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<bool>,
}

impl BackoffConfigBuilder {
    /// Sets the retry budget.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the first delay.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = Some(enabled);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Fails if `max_delay < initial_delay` or the multiplier is below 1 or not finite.
    pub fn build(self) -> Result<BackoffConfig, BackoffConfigError> {
        let defaults = BackoffConfig::default();
        let config = BackoffConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        };

        if config.max_delay < config.initial_delay {
            return Err(BackoffConfigError::MaxBelowInitial {
                initial: config.initial_delay,
                max: config.max_delay,
            });
        }
        if !config.multiplier.is_finite() || config.multiplier < 1.0 {
            return Err(BackoffConfigError::InvalidMultiplier(config.multiplier));
        }
        Ok(config)
    }
}

/// Delay before retry number `attempt` (1-based), using the thread-local RNG.
pub fn delay(attempt: u32, config: &BackoffConfig) -> Duration {
    delay_with(attempt, config, &mut rand::thread_rng())
}

/// Delay before retry number `attempt` (1-based), drawing jitter from `rng`.
///
/// Attempt `0` is treated as `1`.
pub fn delay_with<R: Rng + ?Sized>(attempt: u32, config: &BackoffConfig, rng: &mut R) -> Duration {
    let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
    let max = config.max_delay.as_secs_f64();
    let raw = config.initial_delay.as_secs_f64() * config.multiplier.powi(exponent);
    let capped = if raw.is_finite() { raw.min(max) } else { max };

    let seconds = if config.jitter && capped > 0.0 {
        let spread = capped * JITTER_FRACTION;
        (capped + rng.gen_range(-spread..=spread)).clamp(0.0, max)
    } else {
        capped
    };

    // Caps near Duration::MAX round up past its range as f64.
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig::builder().jitter(false).build().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.initial_delay(), Duration::from_secs(1));
        assert_eq!(config.max_delay(), Duration::from_secs(30));
        assert!((config.multiplier() - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter());
        assert_eq!(BackoffConfig::mirror().max_retries(), 2);
    }

    #[test]
    fn test_builder_rejects_max_below_initial() {
        let err = BackoffConfig::builder()
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, BackoffConfigError::MaxBelowInitial { .. }));
    }

    #[test]
    fn test_builder_rejects_bad_multiplier() {
        for m in [0.5, f64::NAN, f64::INFINITY] {
            assert!(BackoffConfig::builder().multiplier(m).build().is_err());
        }
    }

    #[test]
    fn test_exponential_sequence() {
        let config = no_jitter();
        let delays: Vec<u64> = (1..=7).map(|n| delay(n, &config).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_attempt_zero_is_first_delay() {
        assert_eq!(delay(0, &no_jitter()), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        assert_eq!(delay(u32::MAX, &no_jitter()), Duration::from_secs(30));
    }

    #[test]
    fn test_unbounded_cap_saturates() {
        let config = BackoffConfig::builder()
            .max_delay(Duration::MAX)
            .jitter(false)
            .build()
            .unwrap();
        assert_eq!(delay(200, &config), Duration::MAX);
        assert_eq!(delay(u32::MAX, &config), Duration::MAX);

        let jittered = BackoffConfig::builder().max_delay(Duration::MAX).build().unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            assert!(delay_with(200, &jittered, &mut rng) > Duration::from_secs(1 << 40));
        }
    }

    #[test]
    fn test_jitter_within_thirty_percent() {
        let config = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = delay_with(2, &config, &mut rng).as_secs_f64();
            assert!((1.4..=2.6).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn test_jitter_deterministic_for_seed() {
        let config = BackoffConfig::default();
        let a = delay_with(3, &config, &mut StdRng::seed_from_u64(42));
        let b = delay_with(3, &config, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_initial_delay() {
        let config = BackoffConfig::builder()
            .initial_delay(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(delay(4, &config), Duration::ZERO);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn delays_never_exceed_max(
                attempt in 0u32..64,
                initial_ms in 0u64..5_000,
                extra_ms in 0u64..60_000,
                multiplier in 1.0f64..4.0,
                seed in any::<u64>(),
            ) {
                let config = BackoffConfig::builder()
                    .initial_delay(Duration::from_millis(initial_ms))
                    .max_delay(Duration::from_millis(initial_ms + extra_ms))
                    .multiplier(multiplier)
                    .build()
                    .unwrap();
                let d = delay_with(attempt, &config, &mut StdRng::seed_from_u64(seed));
                prop_assert!(d <= config.max_delay());
            }

            #[test]
            fn delays_monotonic_without_jitter(
                attempt in 1u32..40,
                initial_ms in 0u64..5_000,
                extra_ms in 0u64..60_000,
                multiplier in 1.0f64..4.0,
            ) {
                let config = BackoffConfig::builder()
                    .initial_delay(Duration::from_millis(initial_ms))
                    .max_delay(Duration::from_millis(initial_ms + extra_ms))
                    .multiplier(multiplier)
                    .jitter(false)
                    .build()
                    .unwrap();
                prop_assert!(delay(attempt, &config) <= delay(attempt + 1, &config));
            }
        }
    }
}
