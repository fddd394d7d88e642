//! Channel state machine.
//!
//! A channel wraps a connected wire with handshake, heartbeat, outbound
//! flow control and close semantics. It runs as a small family of tasks:
//! a writer draining the outbound queue, a reader pushing inbound
//! envelopes at the owner, and a heartbeat timer that promotes a silent
//! peer to `Closed`.
//!
//! States: `Connecting → Open → Draining → Closed`. `Draining` accepts no
//! new outbound envelopes but lets the queue flush; an unclean disconnect
//! jumps straight to `Closed`.

use crate::wire::{WirePair, WireRx, WireTx};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use xosc_protocol::{
    ActorError, ActorRef, Address, ControlMsg, Envelope, EnvelopeKind, ErrorKind, Uid,
    PROTOCOL_VERSION,
};

/// Tuning knobs for one channel. Shared by every channel of a router.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Idle interval between `Ping` probes.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before the peer is declared gone.
    pub heartbeat_misses: u32,
    /// Outbound high-water mark in envelopes.
    pub high_water_envelopes: usize,
    /// Outbound high-water mark in payload bytes.
    pub high_water_bytes: usize,
    /// How long the handshake may take before the dial fails.
    pub handshake_timeout: Duration,
    /// Tear the channel down after this long without payload traffic.
    /// Heartbeats do not count as traffic. Disabled when `None`: pending
    /// replies produce no bytes while the remote handler runs, so only
    /// enable this where requests are known to be short.
    pub idle_close: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_misses: 2,
            high_water_envelopes: 1024,
            high_water_bytes: 64 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
            idle_close: None,
        }
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Open = 1,
    Draining = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Connecting,
            1 => ChannelState::Open,
            2 => ChannelState::Draining,
            _ => ChannelState::Closed,
        }
    }
}

/// What a channel reports back to its owner (the router).
#[derive(Debug)]
pub enum ChannelEvent {
    /// An envelope arrived from the peer.
    Inbound { peer: Address, envelope: Envelope },
    /// The channel reached `Closed`; pending replies must fail.
    Closed { peer: Address, reason: ActorError },
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    queued_bytes: AtomicUsize,
    space: Notify,
    drain: Notify,
    force_close: Notify,
    last_inbound: Mutex<Instant>,
    last_outbound: Mutex<Instant>,
    /// Last non-control envelope in either direction.
    last_payload: Mutex<Instant>,
    config: ChannelConfig,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Peer identity learned from the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub process_id: u64,
    pub address: Address,
    pub rdma: bool,
}

/// Sending handle onto an open channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    peer: Address,
    outbound: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// The peer's canonical listening address.
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Queue an envelope for the peer.
    ///
    /// Suspends while the outbound queue sits at its high-water mark. With
    /// a deadline, a full queue fails `Backpressure` once the deadline
    /// passes instead of waiting forever.
    pub async fn send(&self, env: Envelope, deadline: Option<Instant>) -> Result<(), ActorError> {
        if self.shared.state() != ChannelState::Open {
            return Err(ActorError::new(
                ErrorKind::PeerGone,
                format!("channel to {} is {:?}", self.peer, self.shared.state()),
            ));
        }

        let len = env.payload.len();
        let cap = self.shared.config.high_water_bytes;
        loop {
            let queued = self.shared.queued_bytes.load(Ordering::Acquire);
            // A single oversized payload may exceed the mark on an empty
            // queue; it still has to go out.
            if queued == 0 || queued + len <= cap {
                break;
            }
            if self.shared.state() != ChannelState::Open {
                return Err(ActorError::new(
                    ErrorKind::PeerGone,
                    format!("channel to {} closed", self.peer),
                ));
            }
            let waiter = self.shared.space.notified();
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, waiter).await.is_err() {
                        return Err(ActorError::new(
                            ErrorKind::Backpressure,
                            format!("outbound queue to {} over {cap} bytes", self.peer),
                        ));
                    }
                }
                None => waiter.await,
            }
        }
        self.shared.queued_bytes.fetch_add(len, Ordering::AcqRel);

        let enqueued = match deadline {
            Some(at) => match tokio::time::timeout_at(at, self.outbound.send(env)).await {
                Ok(sent) => sent.is_ok(),
                Err(_elapsed) => false,
            },
            None => self.outbound.send(env).await.is_ok(),
        };
        if !enqueued {
            self.shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            self.shared.space.notify_waiters();
            let kind = if self.shared.state() == ChannelState::Open {
                ErrorKind::Backpressure
            } else {
                ErrorKind::PeerGone
            };
            return Err(ActorError::new(
                kind,
                format!("outbound to {} unavailable", self.peer),
            ));
        }
        Ok(())
    }

    /// Best-effort enqueue for heartbeat and transport control. A full
    /// queue means real traffic is flowing, which serves the same
    /// liveness purpose.
    fn try_send_control(&self, env: Envelope) {
        let len = env.payload.len();
        self.shared.queued_bytes.fetch_add(len, Ordering::AcqRel);
        if self.outbound.try_send(env).is_err() {
            self.shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
        }
    }

    /// Graceful close: stop accepting sends, flush the queue, then close.
    pub fn close_graceful(&self) {
        if self.shared.state() == ChannelState::Open {
            self.shared.set_state(ChannelState::Draining);
            self.shared.drain.notify_waiters();
        }
    }

    /// Unclean close: drop everything now.
    pub fn close_now(&self) {
        self.shared.set_state(ChannelState::Closed);
        self.shared.force_close.notify_waiters();
        self.shared.space.notify_waiters();
    }
}

fn transport_ref(addr: &Address) -> ActorRef {
    // Transport-level control traffic is addressed to the endpoint itself,
    // not to any actor; the uid stays empty.
    ActorRef::new(Uid::from(""), addr.clone())
}

/// Exchange `Hello`s over a fresh wire and verify the protocol version.
async fn handshake(
    tx: &mut Box<dyn WireTx>,
    rx: &mut Box<dyn WireRx>,
    local: &ControlMsg,
    peer_hint: &Address,
    timeout: Duration,
) -> Result<PeerInfo, ActorError> {
    let hello = Envelope::control(transport_ref(peer_hint), local.to_bytes());
    tx.send(hello).await?;

    let first = tokio::time::timeout(timeout, rx.recv())
        .await
        .map_err(|_| ActorError::new(ErrorKind::ProtocolError, "handshake timed out"))??
        .ok_or_else(|| ActorError::new(ErrorKind::PeerGone, "peer closed during handshake"))?;

    if first.kind != EnvelopeKind::Control {
        return Err(ActorError::new(
            ErrorKind::ProtocolError,
            "first envelope was not a handshake",
        ));
    }
    match ControlMsg::from_bytes(&first.payload)? {
        ControlMsg::Hello {
            protocol_version,
            process_id,
            address,
            rdma,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ActorError::new(
                    ErrorKind::ProtocolError,
                    format!("protocol version {protocol_version}, expected {PROTOCOL_VERSION}"),
                ));
            }
            Ok(PeerInfo {
                process_id,
                address: Address::parse(&address)?,
                rdma,
            })
        }
        other => Err(ActorError::new(
            ErrorKind::ProtocolError,
            format!("expected hello, got {other:?}"),
        )),
    }
}

/// Handshake a wire and spawn the channel task family.
///
/// Returns the sending handle and the peer identity. Inbound envelopes and
/// the eventual `Closed` notice arrive on `events`.
pub async fn open_channel(
    pair: WirePair,
    local_address: &Address,
    peer_hint: &Address,
    config: ChannelConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
) -> Result<(ChannelHandle, PeerInfo), ActorError> {
    let (mut wire_tx, mut wire_rx) = pair;
    let local = ControlMsg::hello(std::process::id() as u64, local_address.to_string());
    let peer_info = handshake(
        &mut wire_tx,
        &mut wire_rx,
        &local,
        peer_hint,
        config.handshake_timeout,
    )
    .await?;
    let peer = peer_info.address.clone();
    debug!(%peer, process_id = peer_info.process_id, "channel open");

    let now = Instant::now();
    let shared = Arc::new(Shared {
        state: AtomicU8::new(ChannelState::Open as u8),
        queued_bytes: AtomicUsize::new(0),
        space: Notify::new(),
        drain: Notify::new(),
        force_close: Notify::new(),
        last_inbound: Mutex::new(now),
        last_outbound: Mutex::new(now),
        last_payload: Mutex::new(now),
        config: config.clone(),
    });
    let (outbound_tx, outbound_rx) = mpsc::channel(config.high_water_envelopes);
    let handle = ChannelHandle {
        peer: peer.clone(),
        outbound: outbound_tx,
        shared: shared.clone(),
    };

    tokio::spawn(writer_task(
        wire_tx,
        outbound_rx,
        shared.clone(),
        peer.clone(),
    ));
    tokio::spawn(reader_task(
        wire_rx,
        shared.clone(),
        handle.clone(),
        events,
        peer.clone(),
    ));
    tokio::spawn(heartbeat_task(shared, handle.clone(), peer));

    Ok((handle, peer_info))
}

async fn writer_task(
    mut wire_tx: Box<dyn WireTx>,
    mut outbound: mpsc::Receiver<Envelope>,
    shared: Arc<Shared>,
    peer: Address,
) {
    loop {
        tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(env) => {
                    let len = env.payload.len();
                    if env.kind != EnvelopeKind::Control {
                        *shared.last_payload.lock() = Instant::now();
                    }
                    if let Err(e) = wire_tx.send(env).await {
                        warn!(%peer, error = %e, "outbound write failed");
                        shared.set_state(ChannelState::Closed);
                        shared.force_close.notify_waiters();
                        return;
                    }
                    shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
                    shared.space.notify_waiters();
                    *shared.last_outbound.lock() = Instant::now();
                }
                // Every handle dropped: nothing more to write.
                None => {
                    let _ = wire_tx.close().await;
                    return;
                }
            },
            _ = shared.drain.notified() => {
                while let Ok(env) = outbound.try_recv() {
                    let len = env.payload.len();
                    if wire_tx.send(env).await.is_err() {
                        break;
                    }
                    shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
                    shared.space.notify_waiters();
                }
                let _ = wire_tx.close().await;
                trace!(%peer, "outbound drained");
                return;
            },
            _ = shared.force_close.notified() => {
                let _ = wire_tx.close().await;
                return;
            }
        }
    }
}

async fn reader_task(
    mut wire_rx: Box<dyn WireRx>,
    shared: Arc<Shared>,
    handle: ChannelHandle,
    events: mpsc::UnboundedSender<ChannelEvent>,
    peer: Address,
) {
    let reason = loop {
        tokio::select! {
            read = wire_rx.recv() => match read {
                Ok(Some(env)) => {
                    *shared.last_inbound.lock() = Instant::now();
                    if env.kind != EnvelopeKind::Control {
                        *shared.last_payload.lock() = Instant::now();
                    }
                    if env.kind == EnvelopeKind::Control {
                        match ControlMsg::from_bytes(&env.payload) {
                            Ok(ControlMsg::Ping) => {
                                let pong = Envelope::control(
                                    transport_ref(&peer),
                                    ControlMsg::Pong.to_bytes(),
                                );
                                handle.try_send_control(pong);
                                continue;
                            }
                            Ok(ControlMsg::Pong) => continue,
                            // Lifecycle control is the owner's business.
                            Ok(_) => {}
                            Err(e) => {
                                warn!(%peer, error = %e, "bad control payload");
                                continue;
                            }
                        }
                    }
                    if events
                        .send(ChannelEvent::Inbound { peer: peer.clone(), envelope: env })
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => {
                    break if shared.state() == ChannelState::Draining {
                        ActorError::new(ErrorKind::PeerGone, "channel drained")
                    } else {
                        ActorError::new(ErrorKind::PeerGone, "peer closed connection")
                    };
                }
                Err(e) => break e,
            },
            _ = shared.force_close.notified() => {
                break ActorError::new(ErrorKind::PeerGone, "channel force-closed");
            }
        }
    };

    shared.set_state(ChannelState::Closed);
    shared.space.notify_waiters();
    debug!(%peer, %reason, "channel closed");
    let _ = events.send(ChannelEvent::Closed { peer, reason });
}

async fn heartbeat_task(shared: Arc<Shared>, handle: ChannelHandle, peer: Address) {
    let period = shared.config.heartbeat_interval;
    let dead_after = period * shared.config.heartbeat_misses;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately

    loop {
        ticker.tick().await;
        match shared.state() {
            ChannelState::Open => {}
            ChannelState::Draining => continue,
            _ => return,
        }
        let silent_for = shared.last_inbound.lock().elapsed();
        if silent_for > dead_after {
            warn!(%peer, ?silent_for, "heartbeat missed, closing channel");
            handle.close_now();
            return;
        }
        if let Some(idle_after) = shared.config.idle_close {
            if shared.last_payload.lock().elapsed() > idle_after {
                debug!(%peer, "idle interval passed, closing channel");
                handle.close_graceful();
                continue;
            }
        }
        if shared.last_outbound.lock().elapsed() >= period {
            let ping = Envelope::control(transport_ref(&peer), ControlMsg::Ping.to_bytes());
            handle.try_send_control(ping);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{inproc_pair, FramedRx, FramedTx};
    use bytes::Bytes;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn tiny_config() -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_misses: 2,
            high_water_envelopes: 4,
            high_water_bytes: 1024,
            handshake_timeout: Duration::from_secs(1),
            idle_close: None,
        }
    }

    async fn open_pair() -> (
        (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>),
        (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>),
    ) {
        let (a_pair, b_pair) = inproc_pair();
        let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
        let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();
        let a_addr = addr("inproc://a");
        let b_addr = addr("inproc://b");

        let b_open = tokio::spawn({
            let b_addr = b_addr.clone();
            let a_addr = a_addr.clone();
            async move {
                open_channel(b_pair, &b_addr, &a_addr, tiny_config(), b_events_tx)
                    .await
                    .unwrap()
            }
        });
        let (a_handle, a_peer) = open_channel(a_pair, &a_addr, &b_addr, tiny_config(), a_events_tx)
            .await
            .unwrap();
        let (b_handle, b_peer) = b_open.await.unwrap();

        assert_eq!(a_peer.address, addr("inproc://b"));
        assert_eq!(b_peer.address, addr("inproc://a"));
        ((a_handle, a_events_rx), (b_handle, b_events_rx))
    }

    fn some_ref(uid: &str) -> ActorRef {
        ActorRef::new(Uid::from(uid), addr("inproc://b"))
    }

    #[tokio::test]
    async fn test_handshake_and_delivery() {
        let ((a_handle, _a_events), (_b_handle, mut b_events)) = open_pair().await;
        assert_eq!(a_handle.state(), ChannelState::Open);

        a_handle
            .send(
                Envelope::tell(some_ref("ctr"), Bytes::from_static(b"+1"), 0),
                None,
            )
            .await
            .unwrap();

        match b_events.recv().await.unwrap() {
            ChannelEvent::Inbound { envelope, peer } => {
                assert_eq!(&envelope.payload[..], b"+1");
                assert_eq!(peer, addr("inproc://a"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_handshake() {
        let (a_pair, b_pair) = inproc_pair();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        // Peer speaks a future protocol version.
        let (mut b_tx, _b_rx) = b_pair;
        let bogus = ControlMsg::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            process_id: 1,
            address: "inproc://b".to_string(),
            rdma: false,
        };
        b_tx.send(Envelope::control(
            transport_ref(&addr("inproc://a")),
            bogus.to_bytes(),
        ))
        .await
        .unwrap();

        let err = open_channel(
            a_pair,
            &addr("inproc://a"),
            &addr("inproc://b"),
            tiny_config(),
            events_tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn test_heartbeat_closes_silent_peer() {
        let (a_pair, b_pair) = inproc_pair();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        // A peer that handshakes correctly and then goes mute: it never
        // answers pings, so the miss window must close the channel.
        let (mut b_tx, mut b_rx) = b_pair;
        tokio::spawn(async move {
            let hello = ControlMsg::hello(99, "inproc://b".to_string());
            b_tx.send(Envelope::control(
                transport_ref(&addr("inproc://a")),
                hello.to_bytes(),
            ))
            .await
            .unwrap();
            // Swallow whatever arrives without ever responding.
            while let Ok(Some(_)) = b_rx.recv().await {}
        });

        let (a_handle, _peer) = open_channel(
            a_pair,
            &addr("inproc://a"),
            &addr("inproc://b"),
            tiny_config(),
            events_tx,
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("heartbeat should close the channel")
            .unwrap();
        match event {
            ChannelEvent::Closed { reason, .. } => {
                assert_eq!(reason.kind, ErrorKind::PeerGone);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(a_handle.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_idle_channel_tears_down() {
        let (a_pair, b_pair) = inproc_pair();
        let (a_events_tx, _a_events_rx) = mpsc::unbounded_channel();
        let (b_events_tx, _b_events_rx) = mpsc::unbounded_channel();
        let idle_config = ChannelConfig {
            idle_close: Some(Duration::from_millis(120)),
            ..tiny_config()
        };

        let b_open = tokio::spawn({
            let config = idle_config.clone();
            async move {
                open_channel(b_pair, &addr("inproc://b"), &addr("inproc://a"), config, b_events_tx)
                    .await
                    .unwrap()
            }
        });
        let (a_handle, _peer) = open_channel(
            a_pair,
            &addr("inproc://a"),
            &addr("inproc://b"),
            idle_config,
            a_events_tx,
        )
        .await
        .unwrap();
        let (b_handle, _b_peer) = b_open.await.unwrap();

        // No payload traffic: heartbeats alone must not keep it open.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_ne!(a_handle.state(), ChannelState::Open);
        assert_ne!(b_handle.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_send_after_close_fails_peer_gone() {
        let ((a_handle, _a_events), (_b_handle, _b_events)) = open_pair().await;
        a_handle.close_now();
        let err = a_handle
            .send(Envelope::tell(some_ref("x"), Bytes::new(), 0), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerGone);
    }

    #[tokio::test]
    async fn test_backpressure_against_stalled_peer() {
        // Byte-stream wire with a 256-byte window and a peer that
        // handshakes, then stops reading: writes stall, the queue fills,
        // and deadline sends must fail Backpressure.
        let (client, server) = tokio::io::duplex(256);
        let (c_read, c_write) = tokio::io::split(client);
        let (s_read, s_write) = tokio::io::split(server);
        let pair: WirePair = (
            Box::new(FramedTx::new(c_write, 1024 * 1024)),
            Box::new(FramedRx::new(c_read, 1024 * 1024)),
        );

        let mut peer_tx: Box<dyn WireTx> = Box::new(FramedTx::new(s_write, 1024 * 1024));
        let mut peer_rx: Box<dyn WireRx> = Box::new(FramedRx::new(s_read, 1024 * 1024));
        let peer_task = tokio::spawn(async move {
            let hello = ControlMsg::hello(7, "inproc://stall".to_string());
            peer_tx
                .send(Envelope::control(
                    transport_ref(&addr("inproc://a")),
                    hello.to_bytes(),
                ))
                .await
                .unwrap();
            // Read exactly one envelope (the hello), then stall forever.
            let _ = peer_rx.recv().await;
            futures_pending().await;
        });

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = ChannelConfig {
            heartbeat_interval: Duration::from_secs(60),
            high_water_envelopes: 2,
            high_water_bytes: 1024,
            ..tiny_config()
        };
        let (handle, _peer) = open_channel(
            pair,
            &addr("inproc://a"),
            &addr("inproc://stall"),
            config,
            events_tx,
        )
        .await
        .unwrap();

        let big = Bytes::from(vec![0u8; 600]);
        let mut results = Vec::new();
        for _ in 0..5 {
            let deadline = Instant::now() + Duration::from_millis(50);
            results.push(
                handle
                    .send(
                        Envelope::tell(some_ref("slow"), big.clone(), 0),
                        Some(deadline),
                    )
                    .await,
            );
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        assert!(failed >= 3, "expected at least 3 backpressure failures");
        for result in results.iter().filter(|r| r.is_err()) {
            assert_eq!(
                result.as_ref().unwrap_err().kind,
                ErrorKind::Backpressure
            );
        }
        peer_task.abort();
    }

    async fn futures_pending() {
        std::future::pending::<()>().await
    }
}
