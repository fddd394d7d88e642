//! Collective-communication plug-in seam.
//!
//! Some actors coordinate bulk numerical exchange (UCX/NCCL bindings)
//! outside the message plane. The core only ever talks to that machinery
//! through this trait; no implementation lives in this workspace.

use xosc_protocol::ActorError;

/// Minimal contract a collective-communication backend must satisfy.
pub trait Collective: Send + Sync {
    /// Join the collective as `rank` of `world` participants.
    fn init(&self, rank: u32, world: u32) -> Result<(), ActorError>;

    /// All-reduce `buffer` in place across the collective.
    fn allreduce(&self, buffer: &mut [u8]) -> Result<(), ActorError>;

    /// Block until every rank reaches the barrier.
    fn barrier(&self) -> Result<(), ActorError>;

    /// Leave the collective and release its resources.
    fn shutdown(&self) -> Result<(), ActorError>;
}
