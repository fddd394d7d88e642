//! Binary framing.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! magic      : 4 bytes  "XOSC"
//! total_len  : u32      header + payload length
//! header_len : u16
//! header     : envelope_id u64 | kind u8 | codec_id u8 | flags u16
//!              | correlation_id u64?   (flags bit 0)
//!              | deadline_unix_ns u64? (flags bit 1)
//!              | from ref?             (flags bit 2)
//!              | to ref
//! payload    : total_len - header_len bytes
//! ```
//!
//! A ref is `u16 addr_len | addr utf8 | u16 uid_len | uid bytes`.

use crate::address::{ActorRef, Address, Uid};
use crate::envelope::{flags, Envelope, EnvelopeKind};
use crate::error::{ActorError, ErrorKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame magic.
pub const MAGIC: [u8; 4] = *b"XOSC";

/// Bytes before the header: magic, total_len, header_len.
pub const PREFIX_LEN: usize = 4 + 4 + 2;

/// Default per-process cap on a single envelope (256 MiB).
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 256 * 1024 * 1024;

fn proto_err(why: impl Into<String>) -> ActorError {
    ActorError::new(ErrorKind::ProtocolError, why)
}

fn put_ref(buf: &mut BytesMut, actor: &ActorRef) {
    let addr = actor.address.to_string();
    buf.put_u16(addr.len() as u16);
    buf.put_slice(addr.as_bytes());
    buf.put_u16(actor.uid.as_bytes().len() as u16);
    buf.put_slice(actor.uid.as_bytes());
}

fn get_ref(buf: &mut &[u8]) -> Result<ActorRef, ActorError> {
    let addr_len = get_u16(buf)? as usize;
    if buf.len() < addr_len {
        return Err(proto_err("truncated address"));
    }
    let addr_str =
        std::str::from_utf8(&buf[..addr_len]).map_err(|_| proto_err("address not utf-8"))?;
    let address = Address::parse(addr_str)?;
    buf.advance(addr_len);

    let uid_len = get_u16(buf)? as usize;
    if buf.len() < uid_len {
        return Err(proto_err("truncated uid"));
    }
    let uid = Uid::new(Bytes::copy_from_slice(&buf[..uid_len]))?;
    buf.advance(uid_len);
    Ok(ActorRef::new(uid, address))
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, ActorError> {
    if buf.len() < 2 {
        return Err(proto_err("truncated header"));
    }
    Ok(buf.get_u16())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, ActorError> {
    if buf.len() < 8 {
        return Err(proto_err("truncated header"));
    }
    Ok(buf.get_u64())
}

/// Encode a whole frame.
///
/// Fails with `PayloadTooLarge` before anything touches the wire when the
/// payload exceeds `max_bytes`.
pub fn encode(env: &Envelope, max_bytes: usize) -> Result<Bytes, ActorError> {
    if env.payload.len() > max_bytes {
        return Err(ActorError::new(
            ErrorKind::PayloadTooLarge,
            format!("payload {} bytes exceeds cap {}", env.payload.len(), max_bytes),
        ));
    }

    // Presence bits are derived from the options, never trusted from the
    // caller-visible flags value.
    let mut wire_flags = env.flags & !(flags::CORRELATION | flags::DEADLINE | flags::FROM);
    if env.correlation_id.is_some() {
        wire_flags |= flags::CORRELATION;
    }
    if env.deadline_unix_ns.is_some() {
        wire_flags |= flags::DEADLINE;
    }
    if env.from.is_some() {
        wire_flags |= flags::FROM;
    }

    let mut header = BytesMut::with_capacity(64);
    header.put_u64(env.envelope_id);
    header.put_u8(env.kind as u8);
    header.put_u8(env.codec_id);
    header.put_u16(wire_flags);
    if let Some(correlation) = env.correlation_id {
        header.put_u64(correlation);
    }
    if let Some(deadline) = env.deadline_unix_ns {
        header.put_u64(deadline);
    }
    if let Some(from) = &env.from {
        put_ref(&mut header, from);
    }
    put_ref(&mut header, &env.to);

    if header.len() > u16::MAX as usize {
        return Err(proto_err("header overflow"));
    }
    let total_len = header.len() + env.payload.len();

    let mut frame = BytesMut::with_capacity(PREFIX_LEN + total_len);
    frame.put_slice(&MAGIC);
    frame.put_u32(total_len as u32);
    frame.put_u16(header.len() as u16);
    frame.put_slice(&header);
    frame.put_slice(&env.payload);
    Ok(frame.freeze())
}

/// Parsed frame prefix, produced by [`parse_prefix`].
#[derive(Debug, Clone, Copy)]
pub struct FramePrefix {
    /// Header plus payload length.
    pub total_len: u32,
    /// Header length within `total_len`.
    pub header_len: u16,
}

/// Validate the fixed-size prefix of an incoming frame.
pub fn parse_prefix(prefix: &[u8; PREFIX_LEN], max_bytes: usize) -> Result<FramePrefix, ActorError> {
    let mut buf = &prefix[..];
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(proto_err("bad magic"));
    }
    let total_len = buf.get_u32();
    let header_len = buf.get_u16();
    if (header_len as u32) > total_len {
        return Err(proto_err("header_len exceeds total_len"));
    }
    // The cap bounds the payload; headers are small and bounded by u16.
    if total_len as usize > max_bytes + u16::MAX as usize {
        return Err(proto_err(format!("frame {total_len} bytes exceeds cap")));
    }
    Ok(FramePrefix {
        total_len,
        header_len,
    })
}

/// Decode a frame body (everything after the prefix).
pub fn decode_body(header_len: u16, body: Bytes) -> Result<Envelope, ActorError> {
    let header_len = header_len as usize;
    if body.len() < header_len {
        return Err(proto_err("body shorter than header_len"));
    }
    let payload = body.slice(header_len..);
    let mut header = &body[..header_len];

    let envelope_id = get_u64(&mut header)?;
    if header.len() < 4 {
        return Err(proto_err("truncated header"));
    }
    let kind_raw = header.get_u8();
    let kind = EnvelopeKind::from_u8(kind_raw)
        .ok_or_else(|| proto_err(format!("unknown envelope kind {kind_raw}")))?;
    let codec_id = header.get_u8();
    let wire_flags = header.get_u16();

    let correlation_id = if wire_flags & flags::CORRELATION != 0 {
        Some(get_u64(&mut header)?)
    } else {
        None
    };
    let deadline_unix_ns = if wire_flags & flags::DEADLINE != 0 {
        Some(get_u64(&mut header)?)
    } else {
        None
    };
    let from = if wire_flags & flags::FROM != 0 {
        Some(get_ref(&mut header)?)
    } else {
        None
    };
    let to = get_ref(&mut header)?;
    if !header.is_empty() {
        return Err(proto_err("trailing bytes in header"));
    }

    Ok(Envelope {
        envelope_id,
        kind,
        codec_id,
        flags: wire_flags,
        correlation_id,
        deadline_unix_ns,
        from,
        to,
        payload,
    })
}

/// Decode a whole frame. Streaming paths use [`parse_prefix`] +
/// [`decode_body`] instead; this is the one-shot form.
pub fn decode(frame: &[u8], max_bytes: usize) -> Result<Envelope, ActorError> {
    if frame.len() < PREFIX_LEN {
        return Err(proto_err("frame shorter than prefix"));
    }
    let mut prefix = [0u8; PREFIX_LEN];
    prefix.copy_from_slice(&frame[..PREFIX_LEN]);
    let parsed = parse_prefix(&prefix, max_bytes)?;
    let body = &frame[PREFIX_LEN..];
    if body.len() != parsed.total_len as usize {
        return Err(proto_err("frame length mismatch"));
    }
    decode_body(parsed.header_len, Bytes::copy_from_slice(body))
}
