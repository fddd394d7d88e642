//! Pool configuration.

use std::time::Duration;
use xosc_protocol::{ActorError, Address, ErrorKind};

/// What to do when a sub-process dies unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Leave the sub-pool down; clients re-create actors elsewhere.
    Never,
    /// Respawn the worker process. Dead actors are not reconstituted.
    #[default]
    OnFailure,
}

impl RestartPolicy {
    /// Parse the CLI spelling (`never` / `on-failure`).
    pub fn parse(raw: &str) -> Result<Self, ActorError> {
        match raw {
            "never" => Ok(RestartPolicy::Never),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            other => Err(ActorError::new(
                ErrorKind::ProtocolError,
                format!("unknown restart policy {other:?}"),
            )),
        }
    }
}

/// Everything a pool process needs to come up, main or worker.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// The pool's public address; workers derive theirs from it.
    pub address: Address,
    /// Number of sub-process workers.
    pub n_subpools: u32,
    /// Worker threads for the async runtime; `None` means CPU count.
    pub worker_threads: Option<usize>,
    /// Codec stamped on outgoing payloads, by registry name.
    pub codec: String,
    /// Per-envelope size cap.
    pub max_envelope_bytes: usize,
    /// Channel heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a peer or sub-pool is declared gone.
    pub heartbeat_misses: u32,
    /// How long a graceful pool shutdown waits before killing workers.
    pub graceful_deadline: Duration,
    /// Sub-process restart behavior.
    pub restart_policy: RestartPolicy,
}

impl PoolConfig {
    /// Defaults for every knob except the mandatory address.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            n_subpools: 0,
            worker_threads: None,
            codec: "raw".to_string(),
            max_envelope_bytes: xosc_protocol::DEFAULT_MAX_ENVELOPE_BYTES,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_misses: 2,
            graceful_deadline: Duration::from_secs(30),
            restart_policy: RestartPolicy::default(),
        }
    }
}
