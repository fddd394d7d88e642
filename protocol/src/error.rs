//! Error taxonomy shared across the runtime.
//!
//! Every failure a caller can observe maps to one [`ErrorKind`], each with a
//! stable numeric code used on the wire. [`ActorError`] pairs a kind with a
//! human-readable reason and is the error type returned by `send`, `create`
//! and friends throughout the workspace.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Classification of runtime failures, with stable wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    /// No actor with the requested uid is registered at the target pool.
    #[error("actor not found")]
    ActorNotFound,
    /// An actor with the requested uid already exists.
    #[error("duplicate actor uid")]
    Duplicate,
    /// The peer process disconnected or stopped heartbeating.
    #[error("peer gone")]
    PeerGone,
    /// A per-call deadline expired before the reply arrived.
    #[error("deadline exceeded")]
    Timeout,
    /// The request was cancelled before or during execution.
    #[error("cancelled")]
    Cancelled,
    /// The channel's outbound high-water mark was hit within the deadline.
    #[error("backpressure")]
    Backpressure,
    /// The payload exceeds the configured maximum envelope size.
    #[error("payload too large")]
    PayloadTooLarge,
    /// The envelope names a codec id this process has not registered.
    #[error("unsupported codec")]
    UnsupportedCodec,
    /// A handler attempted a synchronous call to its own actor.
    #[error("reentrant self-call")]
    Reentrancy,
    /// The sub-pool hosting the actor died.
    #[error("sub-pool lost")]
    SubPoolLost,
    /// The actor was quarantined after repeated handler failures.
    #[error("actor failed")]
    ActorFailed,
    /// Malformed frame, bad magic, or a handshake violation.
    #[error("protocol error")]
    ProtocolError,
    /// A runtime invariant was violated. Fatal to the current handler only.
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    /// Stable numeric code carried in `Error` envelopes.
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::ActorNotFound => 1,
            ErrorKind::Duplicate => 2,
            ErrorKind::PeerGone => 3,
            ErrorKind::Timeout => 4,
            ErrorKind::Cancelled => 5,
            ErrorKind::Backpressure => 6,
            ErrorKind::PayloadTooLarge => 7,
            ErrorKind::UnsupportedCodec => 8,
            ErrorKind::Reentrancy => 9,
            ErrorKind::SubPoolLost => 10,
            ErrorKind::ActorFailed => 11,
            ErrorKind::ProtocolError => 12,
            ErrorKind::Internal => 13,
        }
    }

    /// Inverse of [`ErrorKind::code`]. Unknown codes decode as `None`.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => ErrorKind::ActorNotFound,
            2 => ErrorKind::Duplicate,
            3 => ErrorKind::PeerGone,
            4 => ErrorKind::Timeout,
            5 => ErrorKind::Cancelled,
            6 => ErrorKind::Backpressure,
            7 => ErrorKind::PayloadTooLarge,
            8 => ErrorKind::UnsupportedCodec,
            9 => ErrorKind::Reentrancy,
            10 => ErrorKind::SubPoolLost,
            11 => ErrorKind::ActorFailed,
            12 => ErrorKind::ProtocolError,
            13 => ErrorKind::Internal,
            _ => return None,
        })
    }
}

/// Error type surfaced to callers of the runtime's public operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {reason}")]
pub struct ActorError {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable detail for logs and callers.
    pub reason: String,
}

impl ActorError {
    /// Create an error with the given kind and reason.
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`ErrorKind::Internal`] error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, reason)
    }

    /// Serialize as an `Error` envelope payload: `u16` code then utf-8 reason.
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.kind.code());
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }

    /// Parse an `Error` envelope payload. Unknown codes become `Internal`.
    pub fn from_payload(mut payload: &[u8]) -> Self {
        if payload.len() < 2 {
            return Self::new(ErrorKind::ProtocolError, "truncated error payload");
        }
        let code = payload.get_u16();
        let kind = ErrorKind::from_code(code).unwrap_or(ErrorKind::Internal);
        Self::new(kind, String::from_utf8_lossy(payload).into_owned())
    }
}

impl From<ErrorKind> for ActorError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_round_trip() {
        for code in 1..=13u16 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(99), None);
    }

    #[test]
    fn test_error_payload_round_trip() {
        let err = ActorError::new(ErrorKind::Timeout, "deadline 50ms exceeded");
        let parsed = ActorError::from_payload(&err.to_payload());
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_error_payload_unknown_code() {
        let mut raw = vec![0xff, 0xff];
        raw.extend_from_slice(b"mystery");
        let parsed = ActorError::from_payload(&raw);
        assert_eq!(parsed.kind, ErrorKind::Internal);
        assert_eq!(parsed.reason, "mystery");
    }

    #[test]
    fn test_error_payload_truncated() {
        let parsed = ActorError::from_payload(&[0x01]);
        assert_eq!(parsed.kind, ErrorKind::ProtocolError);
    }

    #[test]
    fn test_display() {
        let err = ActorError::new(ErrorKind::PeerGone, "pool b died");
        assert_eq!(err.to_string(), "peer gone: pool b died");
    }
}
