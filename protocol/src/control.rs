//! Control-plane messages.
//!
//! Runtime-internal traffic rides in `Control` envelopes with a JSON payload.
//! Handshake, heartbeat, lifecycle and registry piggyback all live here so
//! transport and pool layers agree on one vocabulary.

use crate::error::{ActorError, ErrorKind};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Version negotiated in the handshake. Peers must match exactly.
pub const PROTOCOL_VERSION: u16 = 1;

/// Payload of a `Control` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMsg {
    /// First envelope on every channel, both directions.
    Hello {
        /// Must equal [`PROTOCOL_VERSION`].
        protocol_version: u16,
        /// OS process id of the sender, for diagnostics.
        process_id: u64,
        /// Listening address the sender answers on.
        address: String,
        /// Whether the sender can switch large payloads to an RDMA
        /// datapath. Acted on by the collective plug-in, not the core.
        rdma: bool,
    },
    /// Idle-channel heartbeat probe.
    Ping,
    /// Heartbeat answer.
    Pong,
    /// Graceful stop of the destination actor (destroy path).
    Stop,
    /// Pool-wide drain and terminate.
    ShutdownPool,
    /// Sub-pool registry piggyback on the heartbeat: uids hosted there.
    Registry {
        /// Reporting sub-pool index.
        subpool: u32,
        /// Uids currently registered on that sub-pool.
        uids: Vec<Vec<u8>>,
        /// Total queued envelopes across those actors, for least-loaded
        /// placement.
        queued: u64,
    },
}

impl ControlMsg {
    /// Serialize for a `Control` envelope payload.
    pub fn to_bytes(&self) -> Bytes {
        // Serialization of this enum cannot fail: every variant is plain data.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Parse a `Control` envelope payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ActorError> {
        serde_json::from_slice(bytes).map_err(|e| {
            ActorError::new(ErrorKind::ProtocolError, format!("bad control payload: {e}"))
        })
    }

    /// The handshake message for this process.
    pub fn hello(process_id: u64, address: String) -> Self {
        ControlMsg::Hello {
            protocol_version: PROTOCOL_VERSION,
            process_id,
            address,
            rdma: false,
        }
    }
}
