//! Best-effort connection reset
//!
//! After the retry budget is spent the proxy can ask the root client to drop
//! its sockets so that the next operation starts from a fresh topology scan.

use std::sync::Arc;

/// Error type returned by `Disconnect`. Never shown to callers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A client handle that can close or invalidate its connections.
///
/// The handle must stay usable afterwards: the next operation reconnects.
pub trait Disconnect: Send + Sync {
    /// Close the underlying connections.
    fn disconnect(&self) -> Result<(), BoxError>;
}

impl<T: Disconnect + ?Sized> Disconnect for Arc<T> {
    fn disconnect(&self) -> Result<(), BoxError> {
        (**self).disconnect()
    }
}

impl<T: Disconnect + ?Sized> Disconnect for Box<T> {
    fn disconnect(&self) -> Result<(), BoxError> {
        (**self).disconnect()
    }
}

/// Run `disconnect`, logging and discarding any error.
///
/// Returns whether the reset succeeded.
pub(crate) fn disconnect_quietly(target: &dyn Disconnect) -> bool {
    match target.disconnect() {
        Ok(()) => {
            tracing::debug!("disconnected client after exhausting retries");
            true
        }
        Err(err) => {
            tracing::debug!(error = %err, "ignoring error while disconnecting client");
            false
        }
    }
}
