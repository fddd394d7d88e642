//! Batch payload encoding.
//!
//! A batch coalesces K logical calls to one actor into a single envelope:
//! the payload is a count-prefixed list of length-prefixed sub-payloads,
//! and the reply mirrors it with a per-item ok/error tag. Item failures
//! never abort the rest of the batch.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use xosc_protocol::{ActorError, ErrorKind};

const ITEM_OK: u8 = 0;
const ITEM_ERR: u8 = 1;

fn proto_err(why: &str) -> ActorError {
    ActorError::new(ErrorKind::ProtocolError, format!("batch payload: {why}"))
}

/// Pack sub-payloads into one batch request payload.
pub fn encode_request(items: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + items.iter().map(|i| 4 + i.len()).sum::<usize>());
    buf.put_u32(items.len() as u32);
    for item in items {
        buf.put_u32(item.len() as u32);
        buf.put_slice(item);
    }
    buf.freeze()
}

/// Unpack a batch request payload into its sub-payloads.
pub fn decode_request(payload: &Bytes) -> Result<Vec<Bytes>, ActorError> {
    let mut cursor = payload.clone();
    if cursor.remaining() < 4 {
        return Err(proto_err("truncated count"));
    }
    let count = cursor.get_u32() as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if cursor.remaining() < 4 {
            return Err(proto_err("truncated item length"));
        }
        let len = cursor.get_u32() as usize;
        if cursor.remaining() < len {
            return Err(proto_err("truncated item"));
        }
        items.push(cursor.copy_to_bytes(len));
    }
    if cursor.has_remaining() {
        return Err(proto_err("trailing bytes"));
    }
    Ok(items)
}

/// Pack per-item results into a batch reply payload.
pub fn encode_reply(results: &[Result<Bytes, ActorError>]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(results.len() as u32);
    for result in results {
        match result {
            Ok(bytes) => {
                buf.put_u8(ITEM_OK);
                buf.put_u32(bytes.len() as u32);
                buf.put_slice(bytes);
            }
            Err(err) => {
                let encoded = err.to_payload();
                buf.put_u8(ITEM_ERR);
                buf.put_u32(encoded.len() as u32);
                buf.put_slice(&encoded);
            }
        }
    }
    buf.freeze()
}

/// Unpack a batch reply payload into per-item results.
pub fn decode_reply(payload: &Bytes) -> Result<Vec<Result<Bytes, ActorError>>, ActorError> {
    let mut cursor = payload.clone();
    if cursor.remaining() < 4 {
        return Err(proto_err("truncated count"));
    }
    let count = cursor.get_u32() as usize;
    let mut results = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if cursor.remaining() < 5 {
            return Err(proto_err("truncated item tag"));
        }
        let tag = cursor.get_u8();
        let len = cursor.get_u32() as usize;
        if cursor.remaining() < len {
            return Err(proto_err("truncated item"));
        }
        let body = cursor.copy_to_bytes(len);
        match tag {
            ITEM_OK => results.push(Ok(body)),
            ITEM_ERR => results.push(Err(ActorError::from_payload(&body))),
            _ => return Err(proto_err("unknown item tag")),
        }
    }
    Ok(results)
}
