//! The actor abstraction: user-supplied behavior, execution context and
//! lifecycle states.

use crate::kernel::ActorKernel;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use xosc_protocol::{ActorError, ActorRef};

/// Lifecycle of an actor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActorState {
    /// `on_create` has not finished yet.
    Creating = 0,
    /// Accepting and processing messages.
    Running = 1,
    /// Destroy requested; draining queued work.
    Stopping = 2,
    /// `on_destroy` finished; the uid is free again.
    Stopped = 3,
    /// Quarantined after repeated handler failures.
    Failed = 4,
}

impl ActorState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ActorState::Creating,
            1 => ActorState::Running,
            2 => ActorState::Stopping,
            3 => ActorState::Stopped,
            _ => ActorState::Failed,
        }
    }
}

/// Shared, atomically updated state cell.
#[derive(Debug, Clone, Default)]
pub(crate) struct StateCell(pub(crate) Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new(state: ActorState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub(crate) fn get(&self) -> ActorState {
        ActorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ActorState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// One delivered message, as seen by a handler.
#[derive(Debug, Clone)]
pub struct Message {
    /// Opaque payload bytes; decode through the kernel's codec registry.
    pub payload: Bytes,
    /// Codec the sender used.
    pub codec_id: u8,
    cancelled: Arc<AtomicBool>,
}

impl Message {
    pub(crate) fn new(payload: Bytes, codec_id: u8, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            payload,
            codec_id,
            cancelled,
        }
    }

    /// Whether the caller cancelled this request. Handlers observe this at
    /// their own suspension points and may abandon work early.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Execution context handed to every hook of an actor.
///
/// The context is the actor's only doorway back into the runtime: sending
/// to other actors, reaching the blocking pool, knowing its own ref.
#[derive(Clone)]
pub struct ActorContext {
    self_ref: ActorRef,
    kernel: Arc<ActorKernel>,
}

impl ActorContext {
    pub(crate) fn new(self_ref: ActorRef, kernel: Arc<ActorKernel>) -> Self {
        Self { self_ref, kernel }
    }

    /// This actor's own reference.
    pub fn self_ref(&self) -> &ActorRef {
        &self.self_ref
    }

    /// The owning kernel, for send/tell/create from inside a handler.
    pub fn kernel(&self) -> &Arc<ActorKernel> {
        &self.kernel
    }

    /// Decode a message's payload through the codec its sender named in
    /// the envelope header.
    pub fn decode(&self, msg: &Message) -> Result<serde_json::Value, ActorError> {
        self.kernel.codecs().get(msg.codec_id)?.decode(&msg.payload)
    }

    /// Request another actor and await its reply.
    ///
    /// A synchronous self-call would deadlock on the actor's own inbox and
    /// fails with `Reentrancy` instead.
    pub async fn send(
        &self,
        to: &ActorRef,
        payload: Bytes,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Bytes, ActorError> {
        self.kernel.send(to, payload, deadline).await
    }

    /// Fire-and-forget to another actor.
    pub async fn tell(&self, to: &ActorRef, payload: Bytes) -> Result<(), ActorError> {
        self.kernel.tell(to, payload).await
    }

    /// Run a blocking routine on the dedicated blocking pool, keeping the
    /// scheduler's workers free for other actors.
    pub async fn blocking<F, T>(&self, f: F) -> Result<T, ActorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| ActorError::internal(format!("blocking task failed: {e}")))
    }
}

/// User-supplied actor behavior.
///
/// Hooks run on the actor's own task: at most one of them is executing at
/// any instant, and two messages never overlap. Handlers are free to
/// suspend — awaiting a downstream send releases the worker, not the
/// actor's serial guarantee.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Runs before the actor is visible; failure discards the instance.
    async fn on_create(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Handles one message. The returned bytes become the `Reply` payload
    /// for a `Send`; for a `Tell` they are discarded.
    async fn on_receive(&mut self, msg: Message, ctx: &ActorContext)
        -> Result<Bytes, ActorError>;

    /// Runs during destruction, after the inbox drains. Failures are
    /// logged; destruction proceeds regardless.
    async fn on_destroy(&mut self, _ctx: &ActorContext) {}
}

impl std::fmt::Debug for dyn Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Actor")
    }
}
