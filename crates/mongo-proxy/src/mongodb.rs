//! Error classification for the official MongoDB driver

use mongodb::error::{Error, ErrorKind, RETRYABLE_WRITE_ERROR, WriteFailure};

use crate::Transient;

/// Server error codes meaning the node cannot serve the request until a
/// primary is (re-)elected or the connection is re-established.
const RECONNECT_CODES: &[i32] = &[
    6,     // HostUnreachable
    7,     // HostNotFound
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    189,   // PrimarySteppedDown
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

/// Codes after which re-running a cursor's query is safe.
const CURSOR_RESUMABLE_CODES: &[i32] = &[
    43, // CursorNotFound
    50, // MaxTimeMSExpired
    64, // WriteConcernFailed (wtimeout)
];

fn server_code(err: &Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(concern)) => Some(concern.code),
        ErrorKind::Write(WriteFailure::WriteError(write)) => Some(write.code),
        _ => None,
    }
}

impl Transient for Error {
    fn is_transient_reconnect(&self) -> bool {
        if self.contains_label(RETRYABLE_WRITE_ERROR) {
            return true;
        }
        match self.kind.as_ref() {
            ErrorKind::Io(io) => io.is_transient_reconnect(),
            ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => true,
            _ => server_code(self).is_some_and(|code| RECONNECT_CODES.contains(&code)),
        }
    }

    fn is_cursor_resumable(&self) -> bool {
        self.is_transient_reconnect()
            || server_code(self).is_some_and(|code| CURSOR_RESUMABLE_CODES.contains(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_network_errors_are_transient() {
        let err = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(err.is_transient_reconnect());
        assert!(err.is_cursor_resumable());
    }

    #[test]
    fn test_other_io_errors_are_not_transient() {
        let err = Error::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_transient_reconnect());
        assert!(!err.is_cursor_resumable());
    }

    #[test]
    fn test_code_tables_do_not_overlap() {
        for code in CURSOR_RESUMABLE_CODES {
            assert!(!RECONNECT_CODES.contains(code));
        }
    }
}
