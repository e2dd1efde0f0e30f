//! Error types for mongo-proxy
//!
//! Errors raised by the wrapped client are never converted; they reach the
//! caller as-is. The types here cover configuration and the durable cursor.

use std::time::Duration;

use thiserror::Error;

/// Invalid retry configuration
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("backoff multiplier must be finite and non-negative, got {0}")]
    InvalidMultiplier(f64),

    #[error("Configuration error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure of a `DurableCursor` iteration
#[derive(Error, Debug)]
pub enum DurableError<E> {
    /// An error the cursor does not recover from, as raised by the client
    #[error(transparent)]
    Query(E),

    /// The replica set did not come back within the reconnect budget
    #[error("replica set reconnect failed after {attempts} attempts ({elapsed:?} elapsed)")]
    ReconnectFailure { attempts: u32, elapsed: Duration },
}

impl<E> DurableError<E> {
    /// Returns `true` when iteration stopped because reconnecting gave up.
    pub fn is_reconnect_failure(&self) -> bool {
        matches!(self, DurableError::ReconnectFailure { .. })
    }

    /// Unwrap the client error, if this is one.
    pub fn into_query(self) -> Option<E> {
        match self {
            DurableError::Query(err) => Some(err),
            DurableError::ReconnectFailure { .. } => None,
        }
    }
}
