//! Pluggable payload codecs.
//!
//! The core treats payloads as opaque bytes; a codec is the seam where host
//! values are turned into those bytes and back. Envelopes carry the codec id
//! in their header, and the receiving kernel resolves it through its
//! [`CodecRegistry`] before the handler runs. An id nobody registered yields
//! `UnsupportedCodec`, as does handing a codec a value shape it cannot
//! express.

use crate::error::{ActorError, ErrorKind};
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Codec id for [`RawCodec`].
pub const CODEC_RAW: u8 = 0;
/// Codec id for [`JsonCodec`].
pub const CODEC_JSON: u8 = 1;

/// Converts between host values and wire payload bytes.
pub trait Codec: Send + Sync {
    /// Wire id carried in envelope headers.
    fn id(&self) -> u8;

    /// Name used by configuration (`--codec`).
    fn name(&self) -> &'static str;

    /// Serialize a value into payload bytes.
    fn encode(&self, value: &Value) -> Result<Bytes, ActorError>;

    /// Deserialize payload bytes into a value.
    fn decode(&self, bytes: &[u8]) -> Result<Value, ActorError>;
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Codec")
    }
}

/// Identity codec: string values pass through as their utf-8 bytes.
pub struct RawCodec;

impl Codec for RawCodec {
    fn id(&self) -> u8 {
        CODEC_RAW
    }

    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, ActorError> {
        match value {
            Value::String(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            other => Err(ActorError::new(
                ErrorKind::UnsupportedCodec,
                format!("raw codec carries strings only, got {other}"),
            )),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ActorError> {
        Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// JSON codec backed by `serde_json`.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn id(&self) -> u8 {
        CODEC_JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, ActorError> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| ActorError::new(ErrorKind::UnsupportedCodec, e.to_string()))?;
        Ok(Bytes::from(raw))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ActorError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ActorError::new(ErrorKind::UnsupportedCodec, e.to_string()))
    }
}

/// Process-wide table of registered codecs.
pub struct CodecRegistry {
    codecs: RwLock<HashMap<u8, Arc<dyn Codec>>>,
}

impl CodecRegistry {
    /// Registry with the built-in raw and JSON codecs.
    pub fn new() -> Self {
        let registry = Self {
            codecs: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(RawCodec));
        registry.register(Arc::new(JsonCodec));
        registry
    }

    /// Add or replace a codec under its own id.
    pub fn register(&self, codec: Arc<dyn Codec>) {
        self.codecs.write().insert(codec.id(), codec);
    }

    /// Resolve a codec id from an envelope header.
    pub fn get(&self, id: u8) -> Result<Arc<dyn Codec>, ActorError> {
        self.codecs.read().get(&id).cloned().ok_or_else(|| {
            ActorError::new(ErrorKind::UnsupportedCodec, format!("codec id {id}"))
        })
    }

    /// Resolve a codec by configuration name.
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs
            .read()
            .values()
            .find(|c| c.name() == name)
            .cloned()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
