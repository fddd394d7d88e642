//! Message envelopes.
//!
//! The envelope is the unit every layer of the runtime moves around: the
//! router queues them, channels frame them, and the kernel delivers them to
//! actor inboxes. Construction goes through the helpers here so that flag
//! bits and correlation ids stay consistent.

use crate::address::ActorRef;
use crate::error::ActorError;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};

/// Wire discriminant of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Request expecting a correlated reply.
    Send = 1,
    /// Fire-and-forget message.
    Tell = 2,
    /// Successful response to a `Send`.
    Reply = 3,
    /// Failure response to a `Send`.
    Error = 4,
    /// Revokes an in-flight `Send` by correlation id.
    Cancel = 5,
    /// Runtime-internal traffic: handshake, heartbeat, lifecycle.
    Control = 6,
}

impl EnvelopeKind {
    /// Decode the wire discriminant.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => EnvelopeKind::Send,
            2 => EnvelopeKind::Tell,
            3 => EnvelopeKind::Reply,
            4 => EnvelopeKind::Error,
            5 => EnvelopeKind::Cancel,
            6 => EnvelopeKind::Control,
            _ => return None,
        })
    }
}

/// Envelope flag bits.
///
/// The low byte describes wire presence of optional header fields and is
/// managed by the frame encoder; the high byte carries delivery options.
pub mod flags {
    /// `correlation_id` present in the header.
    pub const CORRELATION: u16 = 1 << 0;
    /// `deadline_unix_ns` present in the header.
    pub const DEADLINE: u16 = 1 << 1;
    /// `from` reference present in the header.
    pub const FROM: u16 = 1 << 2;
    /// Payload is an ordered list of sub-payloads (batch dispatch).
    pub const BATCH: u16 = 1 << 8;
    /// Payload was never serialized; valid on the in-memory driver only.
    pub const CODEC_BYPASS: u16 = 1 << 9;
    /// Receiver should acknowledge a `Tell` with an empty `Reply` on enqueue.
    pub const TELL_ACK: u16 = 1 << 10;
}

static NEXT_ENVELOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique envelope id.
pub fn next_envelope_id() -> u64 {
    NEXT_ENVELOPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A framed, typed message unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Process-unique id, for tracing and dedup in logs.
    pub envelope_id: u64,
    /// Discriminant.
    pub kind: EnvelopeKind,
    /// Payload codec, resolved through the codec registry on delivery.
    pub codec_id: u8,
    /// See [`flags`].
    pub flags: u16,
    /// Ties a `Send` to its `Reply`/`Error`/`Cancel`.
    pub correlation_id: Option<u64>,
    /// Absolute deadline in unix nanoseconds, if the caller set one.
    pub deadline_unix_ns: Option<u64>,
    /// Sender, when a reply path is needed.
    pub from: Option<ActorRef>,
    /// Destination actor.
    pub to: ActorRef,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Envelope {
    /// A request envelope with a fresh correlation id.
    pub fn send(from: ActorRef, to: ActorRef, payload: Bytes, codec_id: u8) -> Self {
        Self {
            envelope_id: next_envelope_id(),
            kind: EnvelopeKind::Send,
            codec_id,
            flags: 0,
            correlation_id: Some(next_envelope_id()),
            deadline_unix_ns: None,
            from: Some(from),
            to,
            payload,
        }
    }

    /// A fire-and-forget envelope.
    pub fn tell(to: ActorRef, payload: Bytes, codec_id: u8) -> Self {
        Self {
            envelope_id: next_envelope_id(),
            kind: EnvelopeKind::Tell,
            codec_id,
            flags: 0,
            correlation_id: None,
            deadline_unix_ns: None,
            from: None,
            to,
            payload,
        }
    }

    /// The successful reply to `request`, correlation copied over.
    pub fn reply_to(request: &Envelope, payload: Bytes) -> Self {
        Self {
            envelope_id: next_envelope_id(),
            kind: EnvelopeKind::Reply,
            codec_id: request.codec_id,
            flags: request.flags & flags::CODEC_BYPASS,
            correlation_id: request.correlation_id,
            deadline_unix_ns: None,
            from: Some(request.to.clone()),
            to: request
                .from
                .clone()
                .unwrap_or_else(|| request.to.clone()),
            payload,
        }
    }

    /// The failure reply to `request`.
    pub fn error_to(request: &Envelope, err: &ActorError) -> Self {
        let mut env = Self::reply_to(request, err.to_payload());
        env.kind = EnvelopeKind::Error;
        env
    }

    /// A cancellation notice for an in-flight `Send`.
    pub fn cancel(to: ActorRef, correlation_id: u64) -> Self {
        Self {
            envelope_id: next_envelope_id(),
            kind: EnvelopeKind::Cancel,
            codec_id: 0,
            flags: 0,
            correlation_id: Some(correlation_id),
            deadline_unix_ns: None,
            from: None,
            to,
            payload: Bytes::new(),
        }
    }

    /// A control envelope carrying runtime-internal traffic.
    pub fn control(to: ActorRef, payload: Bytes) -> Self {
        Self {
            envelope_id: next_envelope_id(),
            kind: EnvelopeKind::Control,
            codec_id: 0,
            flags: 0,
            correlation_id: None,
            deadline_unix_ns: None,
            from: None,
            to,
            payload,
        }
    }

    /// Whether `flag` is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Set a flag bit, chaining.
    pub fn with_flag(mut self, flag: u16) -> Self {
        self.flags |= flag;
        self
    }

    /// Attach an absolute deadline, chaining.
    pub fn with_deadline(mut self, unix_ns: u64) -> Self {
        self.deadline_unix_ns = Some(unix_ns);
        self
    }

    /// Whether this envelope expects a correlated reply.
    pub fn expects_reply(&self) -> bool {
        self.kind == EnvelopeKind::Send
            || (self.kind == EnvelopeKind::Tell && self.has_flag(flags::TELL_ACK))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Uid};

    fn some_ref(uid: &str) -> ActorRef {
        ActorRef::new(Uid::from(uid), Address::parse("inproc://p0").unwrap())
    }

    #[test]
    fn test_kind_round_trip() {
        for raw in 1..=6u8 {
            let kind = EnvelopeKind::from_u8(raw).unwrap();
            assert_eq!(kind as u8, raw);
        }
        assert_eq!(EnvelopeKind::from_u8(0), None);
        assert_eq!(EnvelopeKind::from_u8(7), None);
    }

    #[test]
    fn test_send_allocates_correlation() {
        let a = Envelope::send(some_ref("a"), some_ref("b"), Bytes::new(), 0);
        let b = Envelope::send(some_ref("a"), some_ref("b"), Bytes::new(), 0);
        assert!(a.correlation_id.is_some());
        assert_ne!(a.correlation_id, b.correlation_id);
        assert_ne!(a.envelope_id, b.envelope_id);
    }

    #[test]
    fn test_reply_routes_back_to_sender() {
        let req = Envelope::send(some_ref("caller"), some_ref("echo"), Bytes::new(), 1);
        let reply = Envelope::reply_to(&req, Bytes::from_static(b"hi"));
        assert_eq!(reply.kind, EnvelopeKind::Reply);
        assert_eq!(reply.to, some_ref("caller"));
        assert_eq!(reply.from, Some(some_ref("echo")));
        assert_eq!(reply.correlation_id, req.correlation_id);
        assert_eq!(reply.codec_id, 1);
    }

    #[test]
    fn test_error_reply_payload() {
        use crate::error::{ActorError, ErrorKind};
        let req = Envelope::send(some_ref("caller"), some_ref("echo"), Bytes::new(), 0);
        let err = ActorError::new(ErrorKind::ActorFailed, "boom");
        let env = Envelope::error_to(&req, &err);
        assert_eq!(env.kind, EnvelopeKind::Error);
        assert_eq!(ActorError::from_payload(&env.payload), err);
    }

    #[test]
    fn test_tell_ack_expects_reply() {
        let plain = Envelope::tell(some_ref("b"), Bytes::new(), 0);
        assert!(!plain.expects_reply());
        let acked = Envelope::tell(some_ref("b"), Bytes::new(), 0).with_flag(flags::TELL_ACK);
        assert!(acked.expects_reply());
    }
}
