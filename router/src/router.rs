//! Per-process envelope router.
//!
//! The router owns the table of channels to peer processes, accepts
//! inbound connections on the pool's listen address, multiplexes outbound
//! envelopes, and demultiplexes inbound ones: correlated replies go to
//! their waiters, everything else to the kernel's delivery queue.
//!
//! There is one router per process, created at pool startup and handed
//! around as an `Arc` — handlers never reach for ambient statics.

use crate::backoff::Backoff;
use crate::waiters::Waiters;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use xosc_protocol::frame::DEFAULT_MAX_ENVELOPE_BYTES;
use xosc_protocol::{ActorError, ActorRef, Address, Envelope, EnvelopeKind, ErrorKind};
use xosc_transport::{
    open_channel, ChannelConfig, ChannelEvent, ChannelHandle, ChannelState, DriverTable,
};

/// Router construction options.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Channel tuning shared by every peer connection.
    pub channel: ChannelConfig,
    /// Per-envelope size cap, enforced on encode and decode.
    pub max_envelope_bytes: usize,
    /// Give up reconnecting to a peer after this long; later sends fail
    /// fast until a lookup refreshes the route.
    pub connect_deadline: Duration,
    /// Backoff window floor.
    pub backoff_base: Duration,
    /// Backoff window ceiling.
    pub backoff_cap: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            max_envelope_bytes: DEFAULT_MAX_ENVELOPE_BYTES,
            connect_deadline: Duration::from_secs(30),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(10),
        }
    }
}

enum Route {
    /// A dial is in flight; subscribe and re-check the table when it ends.
    Connecting(watch::Receiver<()>),
    Open(ChannelHandle),
}

/// Per-process dispatch singleton.
pub struct Router {
    local_address: Address,
    config: RouterConfig,
    drivers: DriverTable,
    routes: Mutex<HashMap<Address, Route>>,
    /// Peers whose reconnect deadline elapsed; sends fail fast until a
    /// lookup calls [`Router::refresh_route`].
    stale: Mutex<HashSet<Address>>,
    waiters: Waiters,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    delivery_tx: mpsc::UnboundedSender<Envelope>,
}

impl Router {
    /// Bind the listen address and start the accept and event loops.
    ///
    /// Returns the router and the kernel-bound delivery queue: every
    /// inbound envelope that is not a correlated reply shows up there.
    pub async fn bind(
        address: &Address,
        config: RouterConfig,
    ) -> Result<(Arc<Router>, mpsc::UnboundedReceiver<Envelope>), ActorError> {
        let drivers = DriverTable::new(config.max_envelope_bytes);
        let mut acceptor = drivers.listen(address).await?;
        let local_address = acceptor.local_address();
        info!(%local_address, "router listening");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();

        let router = Arc::new(Router {
            local_address,
            config,
            drivers,
            routes: Mutex::new(HashMap::new()),
            stale: Mutex::new(HashSet::new()),
            waiters: Waiters::new(),
            events_tx,
            delivery_tx,
        });

        let accept_router = router.clone();
        tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(pair) => {
                        let router = accept_router.clone();
                        tokio::spawn(async move {
                            match open_channel(
                                pair,
                                &router.local_address,
                                &router.local_address,
                                router.config.channel.clone(),
                                router.events_tx.clone(),
                            )
                            .await
                            {
                                Ok((handle, peer_info)) => {
                                    debug!(peer = %peer_info.address, "accepted channel");
                                    router
                                        .routes
                                        .lock()
                                        .insert(peer_info.address, Route::Open(handle));
                                }
                                Err(e) => warn!(error = %e, "inbound handshake failed"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept loop stopped");
                        return;
                    }
                }
            }
        });

        let event_router = router.clone();
        tokio::spawn(event_loop(event_router, events_rx));

        Ok((router, delivery_rx))
    }

    /// The resolved listen address (ephemeral ports filled in).
    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    /// Envelope size cap for this process.
    pub fn max_envelope_bytes(&self) -> usize {
        self.config.max_envelope_bytes
    }

    /// Route an envelope without waiting for any reply.
    ///
    /// Local destinations short-circuit through the delivery queue; remote
    /// ones go through the channel table, dialing on demand.
    pub async fn send_envelope(
        self: &Arc<Self>,
        env: Envelope,
        deadline: Option<Instant>,
    ) -> Result<(), ActorError> {
        if env.payload.len() > self.config.max_envelope_bytes {
            return Err(ActorError::new(
                ErrorKind::PayloadTooLarge,
                format!(
                    "payload {} bytes exceeds cap {}",
                    env.payload.len(),
                    self.config.max_envelope_bytes
                ),
            ));
        }
        let target = env.to.address.dial_target();
        if target == self.local_address {
            self.route_inbound(env);
            return Ok(());
        }
        let handle = self.channel_to(&target, deadline).await?;
        handle.send(env, deadline).await
    }

    /// Issue a request and wait for its correlated reply.
    ///
    /// The waiter is registered before the envelope leaves; expiry of the
    /// deadline removes it, reports `Timeout`, and sends a best-effort
    /// `Cancel` to the destination.
    pub async fn request(
        self: &Arc<Self>,
        env: Envelope,
        deadline: Option<Instant>,
    ) -> Result<Envelope, ActorError> {
        let correlation_id = env
            .correlation_id
            .ok_or_else(|| ActorError::internal("request without correlation id"))?;
        let target = env.to.address.dial_target();
        let to = env.to.clone();
        let rx = self.waiters.register(correlation_id, target);

        if let Err(e) = self.send_envelope(env, deadline).await {
            self.waiters.remove(correlation_id);
            return Err(e);
        }

        let outcome = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    self.waiters.remove(correlation_id);
                    self.spawn_cancel(to, correlation_id);
                    return Err(ActorError::new(
                        ErrorKind::Timeout,
                        format!("no reply for correlation {correlation_id} before deadline"),
                    ));
                }
            },
            None => rx.await,
        };
        match outcome {
            Ok(result) => result.and_then(|reply| match reply.kind {
                EnvelopeKind::Error => Err(ActorError::from_payload(&reply.payload)),
                _ => Ok(reply),
            }),
            // The waiter sender dropped without resolving: router shutdown.
            Err(_) => Err(ActorError::new(ErrorKind::PeerGone, "router shut down")),
        }
    }

    /// Clear the fail-fast marker for a peer after an external lookup
    /// produced a fresh address.
    pub fn refresh_route(&self, peer: &Address) {
        self.stale.lock().remove(&peer.dial_target());
    }

    /// Graceful close of every channel; queued envelopes flush first.
    pub fn shutdown(&self) {
        for route in self.routes.lock().values() {
            if let Route::Open(handle) = route {
                handle.close_graceful();
            }
        }
    }

    fn spawn_cancel(self: &Arc<Self>, to: ActorRef, correlation_id: u64) {
        let router = self.clone();
        tokio::spawn(async move {
            let cancel = Envelope::cancel(to, correlation_id);
            let target = cancel.to.address.dial_target();
            if target == router.local_address {
                router.route_inbound(cancel);
                return;
            }
            // Cancel rides an existing channel only; a dead peer needs
            // no cancel.
            let handle = match router.routes.lock().get(&target) {
                Some(Route::Open(handle)) => Some(handle.clone()),
                _ => None,
            };
            if let Some(handle) = handle {
                let _ = handle.send(cancel, None).await;
            }
        });
    }

    /// Demultiplex one inbound envelope.
    fn route_inbound(&self, env: Envelope) {
        match env.kind {
            EnvelopeKind::Reply | EnvelopeKind::Error => {
                let correlation = env.correlation_id;
                let resolved = correlation
                    .map(|id| self.waiters.resolve(id, Ok(env)))
                    .unwrap_or(false);
                if !resolved {
                    debug!(?correlation, "reply without waiter, dropped");
                }
            }
            _ => {
                let _ = self.delivery_tx.send(env);
            }
        }
    }

    /// Look up or establish the channel to a dial target.
    async fn channel_to(
        self: &Arc<Self>,
        target: &Address,
        deadline: Option<Instant>,
    ) -> Result<ChannelHandle, ActorError> {
        loop {
            if self.stale.lock().contains(target) {
                return Err(ActorError::new(
                    ErrorKind::PeerGone,
                    format!("route to {target} is stale, lookup required"),
                ));
            }
            let mut subscription = {
                let mut routes = self.routes.lock();
                match routes.get(target) {
                    Some(Route::Open(handle)) if handle.state() == ChannelState::Open => {
                        return Ok(handle.clone());
                    }
                    Some(Route::Open(_)) => {
                        // Closed but the event loop has not pruned it yet.
                        routes.remove(target);
                        continue;
                    }
                    Some(Route::Connecting(rx)) => rx.clone(),
                    None => {
                        let (done_tx, done_rx) = watch::channel(());
                        routes.insert(target.clone(), Route::Connecting(done_rx.clone()));
                        self.spawn_dial(target.clone(), done_tx);
                        done_rx
                    }
                }
            };
            let wait = subscription.changed();
            match deadline {
                Some(at) => {
                    let finished = tokio::time::timeout_at(at, wait).await.map_err(|_| {
                        ActorError::new(
                            ErrorKind::Timeout,
                            format!("connect to {target} did not finish before deadline"),
                        )
                    })?;
                    // A dropped watch also means the dial ended.
                    let _ = finished;
                }
                None => {
                    let _ = wait.await;
                }
            }
        }
    }

    fn spawn_dial(self: &Arc<Self>, target: Address, done: watch::Sender<()>) {
        let router = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut backoff =
                Backoff::with_limits(router.config.backoff_base, router.config.backoff_cap);
            let handle = loop {
                match router.drivers.connect(&target).await {
                    Ok(pair) => {
                        match open_channel(
                            pair,
                            &router.local_address,
                            &target,
                            router.config.channel.clone(),
                            router.events_tx.clone(),
                        )
                        .await
                        {
                            Ok((handle, peer_info)) => {
                                if peer_info.address != target {
                                    debug!(
                                        %target,
                                        reported = %peer_info.address,
                                        "peer reports a different canonical address"
                                    );
                                }
                                break Some(handle);
                            }
                            Err(e) => debug!(%target, error = %e, "handshake failed"),
                        }
                    }
                    Err(e) => debug!(%target, error = %e, "dial failed"),
                }
                let delay = backoff.next_delay();
                if started.elapsed() + delay >= router.config.connect_deadline {
                    break None;
                }
                tokio::time::sleep(delay).await;
            };

            {
                let mut routes = router.routes.lock();
                match handle {
                    Some(handle) => {
                        routes.insert(target.clone(), Route::Open(handle));
                    }
                    None => {
                        routes.remove(&target);
                        router.stale.lock().insert(target.clone());
                        warn!(%target, "connect deadline exhausted, route marked stale");
                    }
                }
            }
            let _ = done.send(());
        });
    }
}

/// React to channel events: prune closed channels and fail their waiters.
async fn event_loop(router: Arc<Router>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Inbound { envelope, .. } => router.route_inbound(envelope),
            ChannelEvent::Closed { peer, reason } => {
                debug!(%peer, %reason, "channel closed, failing waiters");
                router.routes.lock().remove(&peer);
                let error = ActorError::new(ErrorKind::PeerGone, reason.reason);
                router.waiters.fail_peer(&peer, &error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use xosc_protocol::Uid;

    fn test_config() -> RouterConfig {
        RouterConfig {
            connect_deadline: Duration::from_millis(200),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            ..RouterConfig::default()
        }
    }

    async fn bind(name: &str) -> (Arc<Router>, mpsc::UnboundedReceiver<Envelope>) {
        let address = Address::parse(&format!("inproc://{name}")).unwrap();
        Router::bind(&address, test_config()).await.unwrap()
    }

    fn ref_at(router: &Router, uid: &str) -> ActorRef {
        ActorRef::new(Uid::from(uid), router.local_address().clone())
    }

    #[tokio::test]
    async fn test_tell_crosses_routers() {
        let (a, _a_rx) = bind("router-tell-a").await;
        let (b, mut b_rx) = bind("router-tell-b").await;

        let env = Envelope::tell(ref_at(&b, "ctr"), Bytes::from_static(b"+1"), 0);
        a.send_envelope(env, None).await.unwrap();

        let delivered = b_rx.recv().await.unwrap();
        assert_eq!(&delivered.payload[..], b"+1");
        assert_eq!(delivered.to.uid, Uid::from("ctr"));
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let (a, _a_rx) = bind("router-rr-a").await;
        let (b, mut b_rx) = bind("router-rr-b").await;

        // Pool B echoes every Send back through its own router.
        let b_clone = b.clone();
        tokio::spawn(async move {
            while let Some(env) = b_rx.recv().await {
                if env.kind == EnvelopeKind::Send {
                    let reply = Envelope::reply_to(&env, env.payload.clone());
                    b_clone.send_envelope(reply, None).await.unwrap();
                }
            }
        });

        let env = Envelope::send(
            ref_at(&a, "caller"),
            ref_at(&b, "echo"),
            Bytes::from_static(b"hi"),
            0,
        );
        let reply = a.request(env, None).await.unwrap();
        assert_eq!(&reply.payload[..], b"hi");
        assert!(a.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_kind() {
        let (a, _a_rx) = bind("router-err-a").await;
        let (b, mut b_rx) = bind("router-err-b").await;

        let b_clone = b.clone();
        tokio::spawn(async move {
            while let Some(env) = b_rx.recv().await {
                if env.kind == EnvelopeKind::Send {
                    let err = ActorError::new(ErrorKind::ActorNotFound, "nobody here");
                    b_clone
                        .send_envelope(Envelope::error_to(&env, &err), None)
                        .await
                        .unwrap();
                }
            }
        });

        let env = Envelope::send(
            ref_at(&a, "caller"),
            ref_at(&b, "ghost"),
            Bytes::new(),
            0,
        );
        let err = a.request(env, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ActorNotFound);
    }

    #[tokio::test]
    async fn test_request_timeout_sends_cancel() {
        let (a, _a_rx) = bind("router-to-a").await;
        let (b, mut b_rx) = bind("router-to-b").await;

        let env = Envelope::send(
            ref_at(&a, "caller"),
            ref_at(&b, "sleepy"),
            Bytes::new(),
            0,
        );
        let correlation = env.correlation_id.unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = a.request(env, Some(deadline)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(a.waiters.is_empty());

        // B sees the original Send, then the Cancel for it.
        let first = b_rx.recv().await.unwrap();
        assert_eq!(first.kind, EnvelopeKind::Send);
        let second = tokio::time::timeout(Duration::from_secs(1), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.kind, EnvelopeKind::Cancel);
        assert_eq!(second.correlation_id, Some(correlation));
    }

    #[tokio::test]
    async fn test_unreachable_peer_goes_stale_then_fails_fast() {
        let (a, _a_rx) = bind("router-stale-a").await;
        let ghost = ActorRef::new(
            Uid::from("x"),
            Address::parse("inproc://router-stale-ghost").unwrap(),
        );

        let start = Instant::now();
        let err = a
            .send_envelope(Envelope::tell(ghost.clone(), Bytes::new(), 0), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerGone);
        assert!(start.elapsed() >= Duration::from_millis(100));

        // Second send must not wait through backoff again.
        let start = Instant::now();
        let err = a
            .send_envelope(Envelope::tell(ghost.clone(), Bytes::new(), 0), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerGone);
        assert!(err.reason.contains("stale"));
        assert!(start.elapsed() < Duration::from_millis(100));

        // A lookup refresh clears the marker and dialing resumes.
        a.refresh_route(&ghost.address);
        let err = a
            .send_envelope(Envelope::tell(ghost, Bytes::new(), 0), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerGone);
    }

    #[tokio::test]
    async fn test_local_loopback_request() {
        let (a, mut a_rx) = bind("router-loop-a").await;

        let a_clone = a.clone();
        tokio::spawn(async move {
            while let Some(env) = a_rx.recv().await {
                if env.kind == EnvelopeKind::Send {
                    let reply = Envelope::reply_to(&env, Bytes::from_static(b"pong"));
                    a_clone.send_envelope(reply, None).await.unwrap();
                }
            }
        });

        let env = Envelope::send(
            ref_at(&a, "caller"),
            ref_at(&a, "self-service"),
            Bytes::from_static(b"ping"),
            0,
        );
        let reply = a.request(env, None).await.unwrap();
        assert_eq!(&reply.payload[..], b"pong");
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected_before_dial() {
        let config = RouterConfig {
            max_envelope_bytes: 64,
            ..test_config()
        };
        let address = Address::parse("inproc://router-size-a").unwrap();
        let (a, _a_rx) = Router::bind(&address, config).await.unwrap();

        let ghost = ActorRef::new(
            Uid::from("x"),
            Address::parse("inproc://router-size-ghost").unwrap(),
        );
        let err = a
            .send_envelope(
                Envelope::tell(ghost, Bytes::from(vec![0u8; 128]), 0),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PayloadTooLarge);
    }
}
