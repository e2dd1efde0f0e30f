//! Retry policy configuration
//!
//! A `RetryPolicy` is fixed when the root proxy is built and shared, read-only,
//! by every proxy derived from it.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{Backoff, PolicyError};

/// Additional attempts after the first failed one
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Pause before the first retry
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Factor applied to the pause after each failed retry
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Whether the client is reset once retries are exhausted
pub const DEFAULT_DISCONNECT_ON_TIMEOUT: bool = true;

/// Retry configuration for a proxy chain.
///
/// Can be embedded in an application config file; every field is optional
/// and falls back to the defaults above.
///
/// ```toml
/// max_retries = 3
/// delay_ms = 500
/// backoff_multiplier = 1.5
/// disconnect_on_timeout = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Upper bound on attempts after the first
    max_retries: u32,
    /// Base pause before the first retry
    #[serde(rename = "delay_ms", with = "crate::millis")]
    delay: Duration,
    /// Growth factor for the pause between consecutive retries
    #[serde(deserialize_with = "deserialize_multiplier")]
    backoff_multiplier: f64,
    /// Reset the underlying connection once retries are exhausted
    disconnect_on_timeout: bool,
}

impl RetryPolicy {
    /// Create a policy with the given retry bound and default timing.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Parse a policy from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, PolicyError> {
        let policy: Self = toml::from_str(source)?;
        tracing::debug!(
            max_retries = policy.max_retries,
            delay = ?policy.delay,
            backoff_multiplier = policy.backoff_multiplier,
            "loaded retry policy"
        );
        Ok(policy)
    }

    /// Set the retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base pause.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the backoff multiplier.
    ///
    /// # Panics
    ///
    /// Panics if `multiplier` is negative, NaN or infinite.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        assert!(
            is_valid_multiplier(multiplier),
            "backoff multiplier must be finite and non-negative, got {}",
            multiplier
        );
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set whether the client is reset after retries run out.
    pub fn with_disconnect_on_timeout(mut self, disconnect: bool) -> Self {
        self.disconnect_on_timeout = disconnect;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn disconnect_on_timeout(&self) -> bool {
        self.disconnect_on_timeout
    }

    /// Pause schedule for one invocation: `delay`, `delay * m`, `delay * m^2`, ...
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.delay(), self.backoff_multiplier)
    }

    /// Sum of the pauses taken before a call that fails `failures` times
    /// and then succeeds. Only the first `max_retries` failures pause.
    pub fn total_delay(&self, failures: u32) -> Duration {
        self.backoff()
            .take(failures.min(self.max_retries) as usize)
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            disconnect_on_timeout: DEFAULT_DISCONNECT_ON_TIMEOUT,
        }
    }
}

fn is_valid_multiplier(multiplier: f64) -> bool {
    multiplier.is_finite() && multiplier >= 0.0
}

fn deserialize_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let multiplier = f64::deserialize(deserializer)?;
    if is_valid_multiplier(multiplier) {
        Ok(multiplier)
    } else {
        Err(serde::de::Error::custom(PolicyError::InvalidMultiplier(
            multiplier,
        )))
    }
}
