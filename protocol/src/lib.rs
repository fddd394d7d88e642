/*!
# xosc-protocol

Wire protocol for the xosc actor runtime: addresses and actor references,
envelopes and their binary framing, the pluggable codec seam, control-plane
messages, and the error taxonomy every layer shares.

This crate is pure data — no sockets, no tasks — so the transport, router
and kernel crates can all depend on it without dragging in an I/O stack.
*/

pub mod address;
pub mod codec;
pub mod control;
pub mod envelope;
pub mod error;
pub mod frame;

pub use address::{ActorRef, Address, Scheme, Uid, MAX_UID_LEN};
pub use codec::{Codec, CodecRegistry, CODEC_JSON, CODEC_RAW};
pub use control::{ControlMsg, PROTOCOL_VERSION};
pub use envelope::{flags, next_envelope_id, Envelope, EnvelopeKind};
pub use error::{ActorError, ErrorKind};
pub use frame::{DEFAULT_MAX_ENVELOPE_BYTES, MAGIC, PREFIX_LEN};
