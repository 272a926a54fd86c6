//! Error codes and error types.

use core::fmt;
use std::sync::Arc;

/// Error codes carried in `ERROR` frames.
///
/// Codes 0-99 align with gRPC for familiarity.
/// Codes 100+ are worklink-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    Cancelled = 1,
    DeadlineExceeded = 2,
    InvalidArgument = 3,
    NotFound = 4,
    PermissionDenied = 6,
    ResourceExhausted = 7,
    FailedPrecondition = 8,
    Unimplemented = 11,
    Internal = 12,
    Unavailable = 13,

    // worklink-specific (100+)
    SessionClosed = 101,
    HandshakeRejected = 102,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::DeadlineExceeded),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::NotFound),
            6 => Some(Self::PermissionDenied),
            7 => Some(Self::ResourceExhausted),
            8 => Some(Self::FailedPrecondition),
            11 => Some(Self::Unimplemented),
            12 => Some(Self::Internal),
            13 => Some(Self::Unavailable),
            101 => Some(Self::SessionClosed),
            102 => Some(Self::HandshakeRejected),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "not found"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::HandshakeRejected => write!(f, "handshake rejected"),
        }
    }
}

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    Closed,
    Io(std::io::Error),
    Encode(EncodeError),
    Decode(DecodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<EncodeError> for TransportError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Encoding errors.
#[derive(Debug)]
pub enum EncodeError {
    FrameTooLarge { len: usize, max: usize },
    Serialize(postcard::Error),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
            Self::Serialize(e) => write!(f, "serialize failed: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<postcard::Error> for EncodeError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialize(e)
    }
}

/// Decoding errors.
#[derive(Debug)]
pub enum DecodeError {
    FrameTooLarge { len: usize, max: usize },
    Deserialize(postcard::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge { len, max } => {
                write!(f, "announced frame of {len} bytes exceeds max {max}")
            }
            Self::Deserialize(e) => write!(f, "deserialize failed: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<postcard::Error> for DecodeError {
    fn from(e: postcard::Error) -> Self {
        Self::Deserialize(e)
    }
}

/// The session could not be established.
///
/// Reported to whoever called `connect`/`handshake`; never retried internally.
#[derive(Debug)]
pub enum ConnectionError {
    InvalidEndpoint(String),
    Unreachable {
        endpoint: String,
        source: std::io::Error,
    },
    Rejected {
        code: ErrorCode,
        message: String,
    },
    Protocol(String),
    Transport(TransportError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEndpoint(endpoint) => write!(f, "invalid endpoint: {endpoint}"),
            Self::Unreachable { endpoint, source } => {
                write!(f, "failed to connect to {endpoint}: {source}")
            }
            Self::Rejected { code, message } => write!(f, "handshake rejected ({code}): {message}"),
            Self::Protocol(msg) => write!(f, "handshake protocol violation: {msg}"),
            Self::Transport(e) => write!(f, "transport error during handshake: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unreachable { source, .. } => Some(source),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Terminal failure of an established session.
///
/// Cloned into every call that was still pending when the session went down.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// The controller closed the connection.
    PeerClosed,
    /// The session was shut down locally (or terminated by the controller).
    Closed,
    /// The handshake never completed; see the `ConnectionError` returned by it.
    HandshakeFailed,
    /// `run` was called before the handshake completed. Not terminal.
    NotEstablished,
    Transport(Arc<TransportError>),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::PeerClosed | Self::Closed => ErrorCode::SessionClosed,
            Self::HandshakeFailed => ErrorCode::HandshakeRejected,
            Self::NotEstablished => ErrorCode::FailedPrecondition,
            Self::Transport(_) => ErrorCode::Unavailable,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "session closed by peer"),
            Self::Closed => write!(f, "session closed"),
            Self::HandshakeFailed => write!(f, "session handshake failed"),
            Self::NotEstablished => write!(f, "session not established"),
            Self::Transport(e) => write!(f, "session failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => Self::PeerClosed,
            other => Self::Transport(Arc::new(other)),
        }
    }
}

/// A single call failed; the session and other calls are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub code: ErrorCode,
    pub message: String,
}

impl CallError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CallError {}

/// What a pending call resolves to when it does not succeed.
#[derive(Debug)]
pub enum RpcError {
    Session(SessionError),
    Call(CallError),
    Encode(EncodeError),
    Decode(DecodeError),
}

impl RpcError {
    /// Shorthand for a [`CallError`] with the given code.
    pub fn status(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Call(CallError::new(code, message))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Session(e) => e.code(),
            Self::Call(e) => e.code,
            Self::Encode(_) | Self::Decode(_) => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(e) => write!(f, "{e}"),
            Self::Call(e) => write!(f, "call failed: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Session(e) => Some(e),
            Self::Call(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
        }
    }
}

impl From<SessionError> for RpcError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl From<CallError> for RpcError {
    fn from(e: CallError) -> Self {
        Self::Call(e)
    }
}

impl From<EncodeError> for RpcError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<DecodeError> for RpcError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Build the payload of an `ERROR` frame.
///
/// Layout: `u32 code (LE) | u32 message length (LE) | utf-8 message`.
pub fn encode_error_payload(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + message.len());
    bytes.extend_from_slice(&(code as u32).to_le_bytes());
    bytes.extend_from_slice(&(message.len() as u32).to_le_bytes());
    bytes.extend_from_slice(message.as_bytes());
    bytes
}

/// Parse the payload of an `ERROR` frame.
pub fn parse_error_payload(payload: &[u8]) -> CallError {
    if payload.len() < 8 {
        return CallError::new(ErrorCode::Internal, "malformed error response");
    }

    let code = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let message_len = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;

    if payload.len() < 8 + message_len {
        return CallError::new(ErrorCode::Internal, "malformed error response");
    }

    let code = ErrorCode::from_u32(code).unwrap_or(ErrorCode::Internal);
    let message = String::from_utf8_lossy(&payload[8..8 + message_len]).into_owned();
    CallError { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_survives_encoding() {
        let payload = encode_error_payload(ErrorCode::PermissionDenied, "ticket expired");
        let err = parse_error_payload(&payload);
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert_eq!(err.message, "ticket expired");
    }

    #[test]
    fn truncated_error_payload_is_internal() {
        let mut payload = encode_error_payload(ErrorCode::NotFound, "missing");
        payload.truncate(10);
        let err = parse_error_payload(&payload);
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "malformed error response");

        assert_eq!(parse_error_payload(&[1, 2]).code, ErrorCode::Internal);
    }

    #[test]
    fn unknown_code_maps_to_internal() {
        let mut payload = encode_error_payload(ErrorCode::NotFound, "x");
        payload[..4].copy_from_slice(&9999u32.to_le_bytes());
        assert_eq!(parse_error_payload(&payload).code, ErrorCode::Internal);
    }

    #[test]
    fn closed_transport_becomes_peer_closed() {
        assert!(matches!(
            SessionError::from(TransportError::Closed),
            SessionError::PeerClosed
        ));
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(
            SessionError::from(TransportError::Io(io)),
            SessionError::Transport(_)
        ));
    }
}
