//! Error types for the worker runtime.

use std::fmt;

use worklink_core::{ConnectionError, RpcError, SessionError};

/// A refresh cycle that did not produce a new ticket.
///
/// Surfaced one cycle later; the current token stays valid and the next
/// cycle is scheduled regardless.
#[derive(Debug)]
pub enum RefreshError {
    /// The `refresh_ticket` call failed or its reply could not be decoded.
    Call(RpcError),
    /// The task applying the reply panicked or was aborted.
    Join(String),
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(e) => write!(f, "ticket refresh failed: {e}"),
            Self::Join(msg) => write!(f, "ticket refresh task did not finish: {msg}"),
        }
    }
}

impl std::error::Error for RefreshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Call(e) => Some(e),
            Self::Join(_) => None,
        }
    }
}

impl From<RpcError> for RefreshError {
    fn from(e: RpcError) -> Self {
        Self::Call(e)
    }
}

/// Why a worker stopped.
#[derive(Debug)]
pub enum WorkerError {
    /// Command line or environment was unusable.
    Options(String),
    /// The controller could not be reached or refused the handshake.
    Connection(ConnectionError),
    /// The established session failed.
    Session(SessionError),
    /// `run` was called on a worker that is already serving.
    AlreadyRunning,
}

impl WorkerError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Session(_) | Self::AlreadyRunning => 1,
            Self::Options(_) => 2,
            Self::Connection(_) => 3,
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Options(msg) => write!(f, "invalid options: {msg}"),
            Self::Connection(e) => write!(f, "could not connect to controller: {e}"),
            Self::Session(e) => write!(f, "controller session ended: {e}"),
            Self::AlreadyRunning => write!(f, "worker is already running"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Options(_) | Self::AlreadyRunning => None,
            Self::Connection(e) => Some(e),
            Self::Session(e) => Some(e),
        }
    }
}

impl From<ConnectionError> for WorkerError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::InvalidEndpoint(endpoint) => {
                Self::Options(format!("invalid endpoint `{endpoint}`"))
            }
            other => Self::Connection(other),
        }
    }
}

impl From<SessionError> for WorkerError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let options = WorkerError::from(ConnectionError::InvalidEndpoint("x:y".into()));
        let connection = WorkerError::from(ConnectionError::Protocol("bad".into()));
        let session = WorkerError::from(SessionError::PeerClosed);

        assert!(matches!(options, WorkerError::Options(_)));
        assert_eq!(options.exit_code(), 2);
        assert_eq!(connection.exit_code(), 3);
        assert_eq!(session.exit_code(), 1);
        assert_eq!(WorkerError::AlreadyRunning.exit_code(), 1);
    }
}
