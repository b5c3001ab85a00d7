//! Retry delay curves for failed reconciliation passes.
//!
//! When the external reservation database is unreachable, consecutive
//! automatic passes back off according to one of these curves. The exact
//! curve is a policy parameter, not a correctness requirement.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between retries.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let delay_secs =
                    initial_delay.as_secs_f64() * multiplier.powi((attempt - 1) as i32);
                let delay = Duration::from_secs_f64(delay_secs.min(max_delay.as_secs_f64()));
                delay.min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = *initial_delay + *increment * (attempt - 1);
                delay.min(*max_delay)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let config = BackoffConfig::Fixed {
            delay: Duration::from_secs(5),
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff() {
        let config = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(30), Duration::from_secs(60));
    }

    #[test]
    fn test_linear_backoff() {
        let config = BackoffConfig::Linear {
            initial_delay: Duration::from_secs(10),
            increment: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_attempt_zero_is_clamped() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.delay_for_attempt(1));
    }

    #[test]
    fn test_parses_from_toml() {
        let config: BackoffConfig = toml::from_str(
            r#"
            type = "exponential"
            initial_delay = "2s"
            max_delay = "5m"
            "#,
        )
        .unwrap();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(300));
    }
}
