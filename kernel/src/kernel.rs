//! The actor kernel: owns actor instances, drives their message loops,
//! and guarantees per-actor serial execution.
//!
//! Each actor is one tokio task that is the sole consumer of its inbox —
//! two messages of the same actor can never overlap, while actors run in
//! parallel across the runtime's worker threads. The kernel's pump task
//! consumes the router's delivery queue and fans envelopes out to inboxes.

use crate::actor::{Actor, ActorContext, ActorState, Message, StateCell};
use crate::batch;
use crate::registry::{ClassRegistry, InitArgs};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use xosc_protocol::envelope::flags;
use xosc_protocol::{
    ActorError, ActorRef, Address, CodecRegistry, ControlMsg, Envelope, EnvelopeKind, ErrorKind,
    Uid,
};
use xosc_router::Router;

tokio::task_local! {
    /// The actor whose handler is executing on this task, for reentrancy
    /// detection and reply addressing.
    static CURRENT_ACTOR: ActorRef;
}

/// Kernel tuning.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Codec id stamped on outgoing `Send`/`Tell` payloads.
    pub codec_id: u8,
    /// Address other processes should use to reach actors here. Sub-pool
    /// workers set this to `pool_address/subpool/<idx>`; `None` means the
    /// router's own listen address.
    pub public_address: Option<Address>,
    /// Per-message watchdog. A handler running past it reports `Timeout`
    /// to the caller while the step completes.
    pub watchdog: Option<Duration>,
    /// Watchdog offenses before the actor is quarantined.
    pub watchdog_strikes: u32,
    /// How long cross-node lookup responses stay cached.
    pub lookup_ttl: Duration,
    /// Lookup attempts before giving up with `ActorNotFound`.
    pub lookup_retries: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            codec_id: 0,
            public_address: None,
            watchdog: None,
            watchdog_strikes: 3,
            lookup_ttl: Duration::from_secs(30),
            lookup_retries: 3,
        }
    }
}

enum InboxItem {
    Env(Envelope),
    Stop(oneshot::Sender<()>),
}

struct ActorEntry {
    inbox: mpsc::UnboundedSender<InboxItem>,
    state: StateCell,
    inbox_len: Arc<AtomicUsize>,
    /// Correlations cancelled before their message was dequeued.
    cancelled: Arc<Mutex<HashSet<u64>>>,
    /// Correlation and cancel flag of the request executing right now.
    current: Arc<Mutex<Option<(u64, Arc<AtomicBool>)>>>,
}

#[derive(Default)]
struct SubpoolIndex {
    address: Option<Address>,
    uids: HashSet<Uid>,
    queued: u64,
}

/// Per-process actor container.
pub struct ActorKernel {
    router: Arc<Router>,
    classes: ClassRegistry,
    codecs: CodecRegistry,
    config: KernelConfig,
    actors: Mutex<HashMap<Uid, ActorEntry>>,
    /// Aggregated view of sub-pool registries, fed by heartbeat piggyback.
    index: Mutex<HashMap<u32, SubpoolIndex>>,
    next_uid: AtomicU64,
}

impl ActorKernel {
    /// Wire the kernel onto a router and start the delivery pump.
    ///
    /// Returns the kernel and the stream of pool-level control messages
    /// (`ShutdownPool`, `Registry`) the pool supervisor consumes.
    pub fn start(
        router: Arc<Router>,
        delivery: mpsc::UnboundedReceiver<Envelope>,
        config: KernelConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ControlMsg>) {
        let kernel = Arc::new(Self {
            router,
            classes: ClassRegistry::new(),
            codecs: CodecRegistry::new(),
            config,
            actors: Mutex::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
            next_uid: AtomicU64::new(1),
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(kernel.clone(), delivery, control_tx));
        (kernel, control_rx)
    }

    /// The class registry for this pool.
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// The codec registry for this process. Inbound envelopes must name a
    /// codec registered here or they bounce with `UnsupportedCodec`.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// The router this kernel delivers through.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Address stamped on refs of locally hosted actors.
    pub fn public_address(&self) -> Address {
        self.config
            .public_address
            .clone()
            .unwrap_or_else(|| self.router.local_address().clone())
    }

    /// Total queued envelopes across local actors.
    pub fn queued_total(&self) -> u64 {
        self.actors
            .lock()
            .values()
            .map(|e| e.inbox_len.load(Ordering::Relaxed) as u64)
            .sum()
    }

    /// Uids of locally hosted, live actors.
    pub fn local_uids(&self) -> Vec<Uid> {
        self.actors
            .lock()
            .iter()
            .filter(|(_, e)| {
                matches!(e.state.get(), ActorState::Creating | ActorState::Running)
            })
            .map(|(uid, _)| uid.clone())
            .collect()
    }

    /// Cheap local liveness check, used after cross-node resolution.
    pub fn has_actor(&self, actor: &ActorRef) -> bool {
        self.actors
            .lock()
            .get(&actor.uid)
            .map(|e| {
                matches!(e.state.get(), ActorState::Creating | ActorState::Running)
            })
            .unwrap_or(false)
    }

    // -- sub-pool index maintenance (pool supervisor calls these) ----------

    /// Replace the registry view of one sub-pool.
    pub fn update_subpool_index(
        &self,
        subpool: u32,
        address: Address,
        uids: Vec<Uid>,
        queued: u64,
    ) {
        let mut index = self.index.lock();
        let entry = index.entry(subpool).or_default();
        entry.address = Some(address);
        entry.uids = uids.into_iter().collect();
        entry.queued = queued;
    }

    /// Drop a dead sub-pool from the view.
    pub fn forget_subpool(&self, subpool: u32) {
        self.index.lock().remove(&subpool);
    }

    /// Queued-envelope totals per known sub-pool.
    pub fn subpool_loads(&self) -> HashMap<u32, u64> {
        self.index
            .lock()
            .iter()
            .map(|(idx, e)| (*idx, e.queued))
            .collect()
    }

    /// Resolve a uid against local actors and the aggregated sub-pool view.
    pub fn resolve_uid(&self, uid: &Uid) -> Option<ActorRef> {
        if self.has_actor(&ActorRef::new(uid.clone(), self.public_address())) {
            return Some(ActorRef::new(uid.clone(), self.public_address()));
        }
        let index = self.index.lock();
        for entry in index.values() {
            if entry.uids.contains(uid) {
                if let Some(address) = &entry.address {
                    return Some(ActorRef::new(uid.clone(), address.clone()));
                }
            }
        }
        None
    }

    // -- public operations -------------------------------------------------

    /// Create an actor in this process.
    ///
    /// Allocates a uid when none is given, constructs the instance, runs
    /// `on_create` on the actor's task, and only then returns the ref.
    /// Fails with `Duplicate` when the uid is taken; a failing `on_create`
    /// discards the instance.
    pub async fn create_actor(
        self: &Arc<Self>,
        class_id: &str,
        init_args: InitArgs,
        uid: Option<Uid>,
    ) -> Result<ActorRef, ActorError> {
        let uid =
            uid.unwrap_or_else(|| Uid::from_u64(self.next_uid.fetch_add(1, Ordering::Relaxed)));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let state = StateCell::new(ActorState::Creating);
        let entry = ActorEntry {
            inbox: inbox_tx,
            state: state.clone(),
            inbox_len: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
            current: Arc::new(Mutex::new(None)),
        };
        let cancelled = entry.cancelled.clone();
        let current = entry.current.clone();
        let inbox_len = entry.inbox_len.clone();

        {
            let mut actors = self.actors.lock();
            if actors.contains_key(&uid) {
                return Err(ActorError::new(
                    ErrorKind::Duplicate,
                    format!("uid {uid} already exists"),
                ));
            }
            actors.insert(uid.clone(), entry);
        }

        let instance = match self.classes.construct(class_id, init_args) {
            Ok(instance) => instance,
            Err(e) => {
                self.remove_actor(&uid);
                return Err(e);
            }
        };

        let self_ref = ActorRef::new(uid.clone(), self.public_address());
        let ctx = ActorContext::new(self_ref.clone(), self.clone());
        let (created_tx, created_rx) = oneshot::channel();
        tokio::spawn(run_actor(
            self.clone(),
            instance,
            ctx,
            state,
            inbox_len,
            cancelled,
            current,
            inbox_rx,
            created_tx,
        ));

        match created_rx.await {
            Ok(Ok(())) => Ok(self_ref),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ActorError::internal("actor task died during on_create")),
        }
    }

    /// Destroy an actor.
    ///
    /// The actor finishes its current message, refuses new non-control
    /// messages, drains what was already queued, runs `on_destroy`, and is
    /// deregistered. Destroying an unknown or already-stopping ref is a
    /// no-op that reports success.
    pub async fn destroy_actor(self: &Arc<Self>, actor: &ActorRef) -> Result<(), ActorError> {
        if !self.is_local(actor) {
            return crate::lookup::remote_destroy(self, actor).await;
        }
        let stopping = {
            let actors = self.actors.lock();
            match actors.get(&actor.uid) {
                None => None,
                Some(entry) => match entry.state.get() {
                    ActorState::Stopping | ActorState::Stopped | ActorState::Failed => None,
                    _ => {
                        entry.state.set(ActorState::Stopping);
                        let (tx, rx) = oneshot::channel();
                        let _ = entry.inbox.send(InboxItem::Stop(tx));
                        Some(rx)
                    }
                },
            }
        };
        if let Some(rx) = stopping {
            // An actor destroying itself cannot wait for its own drain:
            // the Stop runs right after this handler returns.
            let self_destroy = CURRENT_ACTOR
                .try_with(|current| current == actor)
                .unwrap_or(false);
            if !self_destroy {
                let _ = rx.await;
            }
        }
        Ok(())
    }

    /// Request an actor and await its reply payload.
    pub async fn send(
        self: &Arc<Self>,
        to: &ActorRef,
        payload: Bytes,
        deadline: Option<Instant>,
    ) -> Result<Bytes, ActorError> {
        self.send_with_codec(to, payload, self.config.codec_id, deadline)
            .await
    }

    /// Like [`ActorKernel::send`] but with an explicit codec id, for
    /// traffic whose payload format is fixed by protocol rather than by
    /// pool configuration (the index actor pins JSON, for instance).
    pub async fn send_with_codec(
        self: &Arc<Self>,
        to: &ActorRef,
        payload: Bytes,
        codec_id: u8,
        deadline: Option<Instant>,
    ) -> Result<Bytes, ActorError> {
        self.check_reentrancy(to)?;
        let mut env = Envelope::send(self.caller_ref(), to.clone(), payload, codec_id);
        if let Some(at) = deadline {
            env = env.with_deadline(unix_ns_at(at));
        }
        let reply = self.router.request(env, deadline).await?;
        Ok(reply.payload)
    }

    /// Fire-and-forget. Returns once the envelope is enqueued outbound;
    /// delivery failures past that point are not surfaced.
    pub async fn tell(self: &Arc<Self>, to: &ActorRef, payload: Bytes) -> Result<(), ActorError> {
        self.check_reentrancy(to)?;
        let env = Envelope::tell(to.clone(), payload, self.config.codec_id);
        self.router.send_envelope(env, None).await
    }

    /// A `Tell` that asks the receiving kernel to acknowledge enqueue.
    pub async fn tell_acked(
        self: &Arc<Self>,
        to: &ActorRef,
        payload: Bytes,
        deadline: Option<Instant>,
    ) -> Result<(), ActorError> {
        self.check_reentrancy(to)?;
        let mut env = Envelope::tell(to.clone(), payload, self.config.codec_id)
            .with_flag(flags::TELL_ACK);
        env.correlation_id = Some(xosc_protocol::next_envelope_id());
        env.from = Some(self.caller_ref());
        self.router.request(env, deadline).await?;
        Ok(())
    }

    /// Coalesce several payloads into one batch request.
    ///
    /// The actor processes the items in order; a failing item yields a
    /// per-item error without aborting the rest.
    pub async fn batch(
        self: &Arc<Self>,
        to: &ActorRef,
        items: &[Bytes],
        deadline: Option<Instant>,
    ) -> Result<Vec<Result<Bytes, ActorError>>, ActorError> {
        self.check_reentrancy(to)?;
        let payload = batch::encode_request(items);
        let mut env = Envelope::send(self.caller_ref(), to.clone(), payload, self.config.codec_id)
            .with_flag(flags::BATCH);
        if let Some(at) = deadline {
            env = env.with_deadline(unix_ns_at(at));
        }
        let reply = self.router.request(env, deadline).await?;
        batch::decode_reply(&reply.payload)
    }

    // -- internals ---------------------------------------------------------

    fn is_local(&self, actor: &ActorRef) -> bool {
        actor.address.dial_target() == *self.router.local_address()
    }

    /// The kernel tuning in effect.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn caller_ref(&self) -> ActorRef {
        CURRENT_ACTOR
            .try_with(|current| current.clone())
            .unwrap_or_else(|_| ActorRef::new(Uid::from(""), self.public_address()))
    }

    fn check_reentrancy(&self, to: &ActorRef) -> Result<(), ActorError> {
        let self_call = CURRENT_ACTOR
            .try_with(|current| current == to)
            .unwrap_or(false);
        if self_call {
            return Err(ActorError::new(
                ErrorKind::Reentrancy,
                format!("synchronous self-call on {to}"),
            ));
        }
        Ok(())
    }

    fn remove_actor(&self, uid: &Uid) {
        self.actors.lock().remove(uid);
    }

    fn reply_with(self: &Arc<Self>, env: Envelope) {
        let router = self.router.clone();
        tokio::spawn(async move {
            if let Err(e) = router.send_envelope(env, None).await {
                debug!(error = %e, "reply delivery failed");
            }
        });
    }

    /// Fan one delivered envelope out to its inbox.
    fn dispatch(self: &Arc<Self>, env: Envelope, control_tx: &mpsc::UnboundedSender<ControlMsg>) {
        match env.kind {
            EnvelopeKind::Send | EnvelopeKind::Tell => {
                let rejected = {
                    let actors = self.actors.lock();
                    match actors.get(&env.to.uid) {
                        Some(entry)
                            if matches!(
                                entry.state.get(),
                                ActorState::Creating | ActorState::Running
                            ) =>
                        {
                            let ack = env.kind == EnvelopeKind::Tell
                                && env.has_flag(flags::TELL_ACK)
                                && env.correlation_id.is_some();
                            let ack_env = ack.then(|| Envelope::reply_to(&env, Bytes::new()));
                            entry.inbox_len.fetch_add(1, Ordering::Relaxed);
                            match entry.inbox.send(InboxItem::Env(env)) {
                                Ok(()) => {
                                    if let Some(ack_env) = ack_env {
                                        self.reply_with(ack_env);
                                    }
                                    None
                                }
                                Err(returned) => match returned.0 {
                                    InboxItem::Env(env) => Some(env),
                                    _ => None,
                                },
                            }
                        }
                        _ => Some(env),
                    }
                };
                if let Some(env) = rejected {
                    if env.expects_reply() {
                        let err = ActorError::new(
                            ErrorKind::ActorNotFound,
                            format!("no actor {} at this pool", env.to.uid),
                        );
                        self.reply_with(Envelope::error_to(&env, &err));
                    } else {
                        debug!(to = %env.to, "tell for unknown actor dropped");
                    }
                }
            }
            EnvelopeKind::Cancel => {
                if let Some(correlation) = env.correlation_id {
                    let actors = self.actors.lock();
                    if let Some(entry) = actors.get(&env.to.uid) {
                        let executing = {
                            let guard = entry.current.lock();
                            match guard.as_ref() {
                                Some((id, flag)) if *id == correlation => Some(flag.clone()),
                                _ => None,
                            }
                        };
                        match executing {
                            Some(flag) => flag.store(true, Ordering::Release),
                            None => {
                                entry.cancelled.lock().insert(correlation);
                            }
                        }
                    }
                }
            }
            EnvelopeKind::Control => match ControlMsg::from_bytes(&env.payload) {
                Ok(ControlMsg::Stop) => {
                    let kernel = self.clone();
                    let target = env.to.clone();
                    tokio::spawn(async move {
                        let _ = kernel.destroy_actor(&target).await;
                    });
                }
                Ok(msg @ (ControlMsg::ShutdownPool | ControlMsg::Registry { .. })) => {
                    let _ = control_tx.send(msg);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "undecodable control envelope"),
            },
            // Correlated replies are resolved in the router.
            EnvelopeKind::Reply | EnvelopeKind::Error => {}
        }
    }
}

fn unix_ns_at(at: Instant) -> u64 {
    let remaining = at.saturating_duration_since(Instant::now());
    let when = SystemTime::now() + remaining;
    when.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Kernel pump: moves envelopes from the router's delivery queue into
/// actor inboxes. Rejections reply inline so the pump never blocks.
async fn pump(
    kernel: Arc<ActorKernel>,
    mut delivery: mpsc::UnboundedReceiver<Envelope>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
) {
    while let Some(env) = delivery.recv().await {
        kernel.dispatch(env, &control_tx);
    }
}

/// The per-actor task: sole consumer of the inbox, so handler invocations
/// on one actor never overlap and FIFO order holds.
#[allow(clippy::too_many_arguments)]
async fn run_actor(
    kernel: Arc<ActorKernel>,
    mut actor: Box<dyn Actor>,
    ctx: ActorContext,
    state: StateCell,
    inbox_len: Arc<AtomicUsize>,
    cancelled: Arc<Mutex<HashSet<u64>>>,
    current: Arc<Mutex<Option<(u64, Arc<AtomicBool>)>>>,
    mut inbox: mpsc::UnboundedReceiver<InboxItem>,
    created: oneshot::Sender<Result<(), ActorError>>,
) {
    let self_ref = ctx.self_ref().clone();
    let uid = self_ref.uid.clone();
    CURRENT_ACTOR
        .scope(self_ref, async move {
            match actor.on_create(&ctx).await {
                Ok(()) => {
                    state.set(ActorState::Running);
                    let _ = created.send(Ok(()));
                }
                Err(e) => {
                    kernel.remove_actor(&uid);
                    let _ = created.send(Err(e));
                    return;
                }
            }

            let mut strikes = 0u32;
            while let Some(item) = inbox.recv().await {
                match item {
                    InboxItem::Stop(ack) => {
                        actor.on_destroy(&ctx).await;
                        state.set(ActorState::Stopped);
                        kernel.remove_actor(&uid);
                        let _ = ack.send(());
                        return;
                    }
                    InboxItem::Env(env) => {
                        inbox_len.fetch_sub(1, Ordering::Relaxed);
                        if let Some(correlation) = env.correlation_id {
                            // Cancelled before dequeue: drop silently, the
                            // caller already saw Timeout or Cancelled.
                            if cancelled.lock().remove(&correlation) {
                                continue;
                            }
                        }
                        let offended =
                            handle_one(&kernel, actor.as_mut(), &ctx, env, &current).await;
                        if offended {
                            strikes += 1;
                            if strikes >= kernel.config().watchdog_strikes {
                                quarantine(&kernel, &uid, &state, &inbox_len, &mut inbox);
                                return;
                            }
                        }
                    }
                }
            }
        })
        .await;
}

/// Process one envelope on the actor's task. Returns whether the watchdog
/// fired for it.
async fn handle_one(
    kernel: &Arc<ActorKernel>,
    actor: &mut dyn Actor,
    ctx: &ActorContext,
    env: Envelope,
    current: &Arc<Mutex<Option<(u64, Arc<AtomicBool>)>>>,
) -> bool {
    // The header's codec id must resolve before the handler sees the
    // payload. Bypass traffic was never serialized and carries whatever
    // id the sending process validated at startup.
    if !env.has_flag(flags::CODEC_BYPASS) {
        if let Err(e) = kernel.codecs().get(env.codec_id) {
            match env.kind {
                EnvelopeKind::Send => kernel.reply_with(Envelope::error_to(&env, &e)),
                _ => warn!(to = %env.to, codec_id = env.codec_id, "tell with unknown codec dropped"),
            }
            return false;
        }
    }

    let cancel_flag = Arc::new(AtomicBool::new(false));
    let is_send = env.kind == EnvelopeKind::Send;
    if is_send {
        if let Some(correlation) = env.correlation_id {
            *current.lock() = Some((correlation, cancel_flag.clone()));
        }
    }

    // The watchdog reports Timeout to the caller while the step is allowed
    // to run to completion.
    let fired = Arc::new(AtomicBool::new(false));
    let watchdog = kernel.config().watchdog.filter(|_| is_send).map(|limit| {
        let kernel = kernel.clone();
        let template = env.clone();
        let fired = fired.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            fired.store(true, Ordering::Release);
            let err = ActorError::new(
                ErrorKind::Timeout,
                format!("handler exceeded watchdog of {limit:?}"),
            );
            kernel.reply_with(Envelope::error_to(&template, &err));
        })
    });

    let result = if env.has_flag(flags::BATCH) && is_send {
        run_batch(actor, ctx, &env, &cancel_flag).await
    } else {
        let msg = Message::new(env.payload.clone(), env.codec_id, cancel_flag.clone());
        actor.on_receive(msg, ctx).await
    };

    if is_send {
        *current.lock() = None;
    }
    let offended = fired.load(Ordering::Acquire);
    if let Some(guard) = watchdog {
        guard.abort();
    }

    match (env.kind, offended, result) {
        // The watchdog already answered; suppress the late reply.
        (EnvelopeKind::Send, true, _) => {}
        (EnvelopeKind::Send, false, Ok(payload)) => {
            kernel.reply_with(Envelope::reply_to(&env, payload));
        }
        (EnvelopeKind::Send, false, Err(e)) => {
            kernel.reply_with(Envelope::error_to(&env, &e));
        }
        (_, _, Err(e)) => {
            warn!(to = %env.to, error = %e, "tell handler failed");
        }
        _ => {}
    }
    offended
}

/// Run the items of a batch envelope in order. Item failures do not abort
/// later items; once the batch is cancelled, remaining items report
/// `Cancelled` without executing.
async fn run_batch(
    actor: &mut dyn Actor,
    ctx: &ActorContext,
    env: &Envelope,
    cancel_flag: &Arc<AtomicBool>,
) -> Result<Bytes, ActorError> {
    let items = batch::decode_request(&env.payload)?;
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        if cancel_flag.load(Ordering::Acquire) {
            results.push(Err(ActorError::new(
                ErrorKind::Cancelled,
                "batch cancelled before this item started",
            )));
            continue;
        }
        let msg = Message::new(item, env.codec_id, cancel_flag.clone());
        results.push(actor.on_receive(msg, ctx).await);
    }
    Ok(batch::encode_reply(&results))
}

/// Quarantine a repeat watchdog offender: mark it failed, bounce what is
/// still queued with `ActorFailed`, and deregister the uid.
fn quarantine(
    kernel: &Arc<ActorKernel>,
    uid: &Uid,
    state: &StateCell,
    inbox_len: &Arc<AtomicUsize>,
    inbox: &mut mpsc::UnboundedReceiver<InboxItem>,
) {
    error!(%uid, "actor quarantined after repeated watchdog offenses");
    state.set(ActorState::Failed);
    while let Ok(item) = inbox.try_recv() {
        match item {
            InboxItem::Env(env) => {
                inbox_len.fetch_sub(1, Ordering::Relaxed);
                if env.expects_reply() {
                    let err = ActorError::new(ErrorKind::ActorFailed, format!("{uid} failed"));
                    kernel.reply_with(Envelope::error_to(&env, &err));
                }
            }
            InboxItem::Stop(ack) => {
                let _ = ack.send(());
            }
        }
    }
    kernel.remove_actor(uid);
}
