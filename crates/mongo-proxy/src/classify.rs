//! Transient error classification
//!
//! The retry loop only acts on errors that say "the replica set has no
//! reachable primary right now". Everything else is surfaced immediately.

use std::io;

/// Classifies errors raised by a wrapped client.
///
/// Implement this for the client's error type. Classification must be based
/// on error kinds or codes, not on message text.
pub trait Transient {
    /// Returns `true` for the AutoReconnect condition: the primary is
    /// unreachable or an election is in progress.
    fn is_transient_reconnect(&self) -> bool;

    /// Returns `true` when a cursor may be re-opened after this error and
    /// resume where it stopped.
    ///
    /// Defaults to `is_transient_reconnect`. Clients usually widen this to
    /// cursor-expiry and server-side timeout errors.
    fn is_cursor_resumable(&self) -> bool {
        self.is_transient_reconnect()
    }
}

impl Transient for io::Error {
    fn is_transient_reconnect(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
                | io::ErrorKind::UnexpectedEof
        )
    }
}

impl<T: Transient + ?Sized> Transient for Box<T> {
    fn is_transient_reconnect(&self) -> bool {
        (**self).is_transient_reconnect()
    }

    fn is_cursor_resumable(&self) -> bool {
        (**self).is_cursor_resumable()
    }
}
