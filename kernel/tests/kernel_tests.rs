//! End-to-end kernel scenarios: local echo, cross-process counting over
//! Unix sockets, batch dispatch with mid-batch failure, watchdog
//! quarantine, cancellation, and the naming service.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use xosc_kernel::{
    remote_create, Actor, ActorContext, ActorKernel, IndexServer, KernelConfig, LookupCache,
    Message,
};
use xosc_protocol::{ActorError, ActorRef, Address, ControlMsg, Envelope, ErrorKind, Uid};
use xosc_router::{Router, RouterConfig};

async fn spawn_pool(
    address: &str,
    config: KernelConfig,
) -> (Arc<ActorKernel>, mpsc::UnboundedReceiver<ControlMsg>) {
    let address = Address::parse(address).unwrap();
    let (router, delivery) = Router::bind(&address, RouterConfig::default())
        .await
        .unwrap();
    ActorKernel::start(router, delivery, config)
}

// ---------------------------------------------------------------------------
// Test actors

struct Echo;

#[async_trait]
impl Actor for Echo {
    async fn on_receive(&mut self, msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        Ok(msg.payload)
    }
}

struct Counter {
    value: i64,
}

#[async_trait]
impl Actor for Counter {
    async fn on_receive(&mut self, msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        match &msg.payload[..] {
            b"+1" => {
                self.value += 1;
                Ok(Bytes::new())
            }
            b"get" => Ok(Bytes::from(self.value.to_string())),
            other => Err(ActorError::new(
                ErrorKind::Internal,
                format!("unknown op {:?}", String::from_utf8_lossy(other)),
            )),
        }
    }
}

/// Fails on the payload "fail", echoes otherwise.
struct Flaky;

#[async_trait]
impl Actor for Flaky {
    async fn on_receive(&mut self, msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        if &msg.payload[..] == b"fail" {
            Err(ActorError::new(ErrorKind::ActorFailed, "told to fail"))
        } else {
            Ok(msg.payload)
        }
    }
}

/// Records handler entry order and would notice overlapping execution.
struct Recorder {
    seen: Arc<parking_lot::Mutex<Vec<u64>>>,
    in_handler: Arc<AtomicBool>,
    overlapped: Arc<AtomicBool>,
}

#[async_trait]
impl Actor for Recorder {
    async fn on_receive(&mut self, msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        if self.in_handler.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let n: u64 = String::from_utf8_lossy(&msg.payload).parse().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.seen.lock().push(n);
        self.in_handler.store(false, Ordering::SeqCst);
        Ok(Bytes::new())
    }
}

/// Sleeps through every message; used for watchdog and cancel tests.
struct Slow {
    naptime: Duration,
    processed: Arc<AtomicU64>,
}

#[async_trait]
impl Actor for Slow {
    async fn on_receive(&mut self, _msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        tokio::time::sleep(self.naptime).await;
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(b"done"))
    }
}

/// Polls its cancellation flag at suspension points and bails out early.
struct Cancellable {
    observed_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl Actor for Cancellable {
    async fn on_receive(&mut self, msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if msg.is_cancelled() {
                self.observed_cancel.store(true, Ordering::SeqCst);
                return Err(ActorError::new(ErrorKind::Cancelled, "caller gave up"));
            }
        }
        Ok(Bytes::new())
    }
}

/// Attempts a synchronous self-call and reports the outcome.
struct Narcissist;

#[async_trait]
impl Actor for Narcissist {
    async fn on_receive(&mut self, _msg: Message, ctx: &ActorContext) -> Result<Bytes, ActorError> {
        let err = ctx
            .send(ctx.self_ref(), Bytes::from_static(b"hi me"), None)
            .await
            .expect_err("self-call must be rejected");
        Ok(Bytes::from(format!("{:?}", err.kind)))
    }
}

struct FailingCreate;

#[async_trait]
impl Actor for FailingCreate {
    async fn on_create(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
        Err(ActorError::new(ErrorKind::Internal, "refusing to start"))
    }

    async fn on_receive(&mut self, _msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        Ok(Bytes::new())
    }
}

struct DestroyProbe {
    destroyed: Arc<AtomicBool>,
}

#[async_trait]
impl Actor for DestroyProbe {
    async fn on_receive(&mut self, msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        Ok(msg.payload)
    }

    async fn on_destroy(&mut self, _ctx: &ActorContext) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn test_local_echo() {
    let (kernel, _control) = spawn_pool("inproc://kernel-echo", KernelConfig::default()).await;
    kernel
        .classes()
        .register("echo", |_| Ok(Box::new(Echo) as Box<dyn Actor>));

    let echo = kernel
        .create_actor("echo", serde_json::Value::Null, Some(Uid::from("echo")))
        .await
        .unwrap();
    let reply = kernel
        .send(&echo, Bytes::from_static(b"hi"), None)
        .await
        .unwrap();
    assert_eq!(&reply[..], b"hi");
    assert!(kernel.has_actor(&echo));
}

#[tokio::test]
async fn test_counter_across_unix_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let addr_a = format!("unix://{}/a.sock", dir.path().display());
    let addr_b = format!("unix://{}/b.sock", dir.path().display());
    let (kernel_a, _ca) = spawn_pool(&addr_a, KernelConfig::default()).await;
    let (kernel_b, _cb) = spawn_pool(&addr_b, KernelConfig::default()).await;

    kernel_b
        .classes()
        .register("counter", |_| Ok(Box::new(Counter { value: 0 }) as Box<dyn Actor>));
    IndexServer::spawn(&kernel_b).await.unwrap();

    let pool_b = kernel_b.router().local_address().clone();
    let ctr = remote_create(
        &kernel_a,
        &pool_b,
        "counter",
        serde_json::Value::Null,
        Some(Uid::from("ctr")),
    )
    .await
    .unwrap();
    assert_eq!(ctr.uid, Uid::from("ctr"));

    for _ in 0..3 {
        kernel_a.tell(&ctr, Bytes::from_static(b"+1")).await.unwrap();
    }
    let reply = kernel_a
        .send(&ctr, Bytes::from_static(b"get"), None)
        .await
        .unwrap();
    assert_eq!(&reply[..], b"3");
}

#[tokio::test]
async fn test_fifo_and_serial_execution() {
    let (kernel, _control) = spawn_pool("inproc://kernel-fifo", KernelConfig::default()).await;
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let in_handler = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    {
        let (seen, in_handler, overlapped) =
            (seen.clone(), in_handler.clone(), overlapped.clone());
        kernel.classes().register("recorder", move |_| {
            Ok(Box::new(Recorder {
                seen: seen.clone(),
                in_handler: in_handler.clone(),
                overlapped: overlapped.clone(),
            }) as Box<dyn Actor>)
        });
    }
    let recorder = kernel
        .create_actor("recorder", serde_json::Value::Null, None)
        .await
        .unwrap();

    for n in 0..32u64 {
        kernel
            .tell(&recorder, Bytes::from(n.to_string()))
            .await
            .unwrap();
    }
    // A final request flushes the inbox: FIFO means everything queued
    // before it has been handled once it answers.
    let last = kernel
        .send(&recorder, Bytes::from_static(b"99"), None)
        .await;
    assert!(last.is_ok());

    let order = seen.lock().clone();
    assert_eq!(order[..32], (0..32u64).collect::<Vec<_>>()[..]);
    assert!(!overlapped.load(Ordering::SeqCst), "handlers overlapped");
}

#[tokio::test]
async fn test_handler_error_does_not_kill_actor() {
    let (kernel, _control) = spawn_pool("inproc://kernel-flaky", KernelConfig::default()).await;
    kernel
        .classes()
        .register("flaky", |_| Ok(Box::new(Flaky) as Box<dyn Actor>));
    let flaky = kernel
        .create_actor("flaky", serde_json::Value::Null, None)
        .await
        .unwrap();

    let err = kernel
        .send(&flaky, Bytes::from_static(b"fail"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ActorFailed);
    assert_eq!(err.reason, "told to fail");

    // The actor keeps running.
    let reply = kernel
        .send(&flaky, Bytes::from_static(b"still here"), None)
        .await
        .unwrap();
    assert_eq!(&reply[..], b"still here");
}

#[tokio::test]
async fn test_batch_with_mid_failure() {
    let (kernel, _control) = spawn_pool("inproc://kernel-batch", KernelConfig::default()).await;
    kernel
        .classes()
        .register("flaky", |_| Ok(Box::new(Flaky) as Box<dyn Actor>));
    let flaky = kernel
        .create_actor("flaky", serde_json::Value::Null, None)
        .await
        .unwrap();

    let items = [
        Bytes::from_static(b"ok-1"),
        Bytes::from_static(b"fail"),
        Bytes::from_static(b"ok-3"),
    ];
    let results = kernel.batch(&flaky, &items, None).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap(), &Bytes::from_static(b"ok-1"));
    assert_eq!(results[1].as_ref().unwrap_err().kind, ErrorKind::ActorFailed);
    assert_eq!(results[2].as_ref().unwrap(), &Bytes::from_static(b"ok-3"));
}

#[tokio::test]
async fn test_reentrancy_rejected() {
    let (kernel, _control) = spawn_pool("inproc://kernel-reent", KernelConfig::default()).await;
    kernel
        .classes()
        .register("narcissist", |_| Ok(Box::new(Narcissist) as Box<dyn Actor>));
    let actor = kernel
        .create_actor("narcissist", serde_json::Value::Null, None)
        .await
        .unwrap();

    let reply = kernel
        .send(&actor, Bytes::from_static(b"go"), None)
        .await
        .unwrap();
    assert_eq!(&reply[..], b"Reentrancy");
}

#[tokio::test]
async fn test_duplicate_uid_rejected() {
    let (kernel, _control) = spawn_pool("inproc://kernel-dup", KernelConfig::default()).await;
    kernel
        .classes()
        .register("echo", |_| Ok(Box::new(Echo) as Box<dyn Actor>));

    kernel
        .create_actor("echo", serde_json::Value::Null, Some(Uid::from("one")))
        .await
        .unwrap();
    let err = kernel
        .create_actor("echo", serde_json::Value::Null, Some(Uid::from("one")))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Duplicate);
}

#[tokio::test]
async fn test_failed_on_create_discards_instance() {
    let (kernel, _control) = spawn_pool("inproc://kernel-badcreate", KernelConfig::default()).await;
    kernel
        .classes()
        .register("bad", |_| Ok(Box::new(FailingCreate) as Box<dyn Actor>));

    let err = kernel
        .create_actor("bad", serde_json::Value::Null, Some(Uid::from("b")))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);

    // The uid is free again.
    kernel
        .classes()
        .register("echo", |_| Ok(Box::new(Echo) as Box<dyn Actor>));
    assert!(kernel
        .create_actor("echo", serde_json::Value::Null, Some(Uid::from("b")))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_destroy_is_idempotent_and_runs_hook() {
    let (kernel, _control) = spawn_pool("inproc://kernel-destroy", KernelConfig::default()).await;
    let destroyed = Arc::new(AtomicBool::new(false));
    {
        let destroyed = destroyed.clone();
        kernel.classes().register("probe", move |_| {
            Ok(Box::new(DestroyProbe {
                destroyed: destroyed.clone(),
            }) as Box<dyn Actor>)
        });
    }
    let probe = kernel
        .create_actor("probe", serde_json::Value::Null, Some(Uid::from("probe")))
        .await
        .unwrap();

    kernel.destroy_actor(&probe).await.unwrap();
    assert!(destroyed.load(Ordering::SeqCst));
    assert!(!kernel.has_actor(&probe));

    // Second destroy and destroy-of-unknown both report success.
    kernel.destroy_actor(&probe).await.unwrap();

    let err = kernel
        .send(&probe, Bytes::from_static(b"hi"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ActorNotFound);
}

#[tokio::test]
async fn test_watchdog_reports_timeout_then_quarantines() {
    let config = KernelConfig {
        watchdog: Some(Duration::from_millis(50)),
        watchdog_strikes: 2,
        ..KernelConfig::default()
    };
    let (kernel, _control) = spawn_pool("inproc://kernel-watchdog", config).await;
    let processed = Arc::new(AtomicU64::new(0));
    {
        let processed = processed.clone();
        kernel.classes().register("slow", move |_| {
            Ok(Box::new(Slow {
                naptime: Duration::from_millis(200),
                processed: processed.clone(),
            }) as Box<dyn Actor>)
        });
    }
    let slow = kernel
        .create_actor("slow", serde_json::Value::Null, Some(Uid::from("slow")))
        .await
        .unwrap();

    for _ in 0..2 {
        let err = kernel
            .send(&slow, Bytes::from_static(b"work"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
    // Both steps were still allowed to complete.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 2);

    // Two strikes: the actor is quarantined and deregistered.
    let err = kernel
        .send(&slow, Bytes::from_static(b"work"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ActorNotFound);
}

#[tokio::test]
async fn test_cancel_drops_undequeued_message() {
    let (kernel, _control) = spawn_pool("inproc://kernel-cancel", KernelConfig::default()).await;
    let processed = Arc::new(AtomicU64::new(0));
    {
        let processed = processed.clone();
        kernel.classes().register("slow", move |_| {
            Ok(Box::new(Slow {
                naptime: Duration::from_millis(150),
                processed: processed.clone(),
            }) as Box<dyn Actor>)
        });
    }
    let slow = kernel
        .create_actor("slow", serde_json::Value::Null, None)
        .await
        .unwrap();

    // First request occupies the actor; the second times out while still
    // queued, so its Cancel arrives before it is dequeued and it must
    // never execute.
    let first = {
        let kernel = kernel.clone();
        let slow = slow.clone();
        tokio::spawn(async move { kernel.send(&slow, Bytes::from_static(b"a"), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let deadline = Instant::now() + Duration::from_millis(40);
    let err = kernel
        .send(&slow, Bytes::from_static(b"b"), Some(deadline))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    assert_eq!(&first.await.unwrap().unwrap()[..], b"done");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 1, "cancelled message ran");
}

#[tokio::test]
async fn test_cancel_observed_mid_execution() {
    let (kernel, _control) = spawn_pool("inproc://kernel-cancel2", KernelConfig::default()).await;
    let observed = Arc::new(AtomicBool::new(false));
    {
        let observed = observed.clone();
        kernel.classes().register("cancellable", move |_| {
            Ok(Box::new(Cancellable {
                observed_cancel: observed.clone(),
            }) as Box<dyn Actor>)
        });
    }
    let actor = kernel
        .create_actor("cancellable", serde_json::Value::Null, None)
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_millis(60);
    let err = kernel
        .send(&actor, Bytes::from_static(b"work"), Some(deadline))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    // The handler notices the flag at its next suspension point.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(observed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_unknown_codec_rejected_before_handler() {
    let (kernel, _control) = spawn_pool("inproc://kernel-codec", KernelConfig::default()).await;
    kernel
        .classes()
        .register("echo", |_| Ok(Box::new(Echo) as Box<dyn Actor>));
    let echo = kernel
        .create_actor("echo", serde_json::Value::Null, Some(Uid::from("echo")))
        .await
        .unwrap();

    // A request naming a codec nobody registered bounces with
    // UnsupportedCodec instead of reaching the handler.
    let caller = ActorRef::new(Uid::from(""), kernel.public_address());
    let bogus = Envelope::send(caller, echo.clone(), Bytes::from_static(b"hi"), 42);
    let err = kernel.router().request(bogus, None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnsupportedCodec);

    // The actor itself is unharmed and keeps serving valid traffic.
    let reply = kernel
        .send(&echo, Bytes::from_static(b"hi"), None)
        .await
        .unwrap();
    assert_eq!(&reply[..], b"hi");
}

#[tokio::test]
async fn test_unknown_codec_tell_dropped() {
    let (kernel, _control) = spawn_pool("inproc://kernel-codec2", KernelConfig::default()).await;
    kernel
        .classes()
        .register("counter", |_| Ok(Box::new(Counter { value: 0 }) as Box<dyn Actor>));
    let ctr = kernel
        .create_actor("counter", serde_json::Value::Null, Some(Uid::from("ctr")))
        .await
        .unwrap();

    // A fire-and-forget with a garbage codec id is dropped, not executed.
    let bogus = Envelope::tell(ctr.clone(), Bytes::from_static(b"+1"), 42);
    kernel.router().send_envelope(bogus, None).await.unwrap();

    // FIFO: by the time the probe answers, the bad tell was dequeued.
    let reply = kernel
        .send(&ctr, Bytes::from_static(b"get"), None)
        .await
        .unwrap();
    assert_eq!(&reply[..], b"0");
}

#[tokio::test]
async fn test_tell_ack() {
    let (kernel, _control) = spawn_pool("inproc://kernel-tellack", KernelConfig::default()).await;
    kernel
        .classes()
        .register("echo", |_| Ok(Box::new(Echo) as Box<dyn Actor>));
    let echo = kernel
        .create_actor("echo", serde_json::Value::Null, None)
        .await
        .unwrap();

    kernel
        .tell_acked(&echo, Bytes::from_static(b"x"), None)
        .await
        .unwrap();

    let ghost = ActorRef::new(Uid::from("ghost"), kernel.public_address());
    let err = kernel
        .tell_acked(&ghost, Bytes::from_static(b"x"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ActorNotFound);
}

#[tokio::test]
async fn test_lookup_caches_and_invalidates() {
    let (kernel_a, _ca) = spawn_pool("inproc://kernel-lkp-a", KernelConfig::default()).await;
    let (kernel_b, _cb) = spawn_pool("inproc://kernel-lkp-b", KernelConfig::default()).await;
    kernel_b
        .classes()
        .register("echo", |_| Ok(Box::new(Echo) as Box<dyn Actor>));
    IndexServer::spawn(&kernel_b).await.unwrap();
    kernel_b
        .create_actor("echo", serde_json::Value::Null, Some(Uid::from("echo")))
        .await
        .unwrap();

    let pool_b = kernel_b.router().local_address().clone();
    let cache = LookupCache::new(Duration::from_secs(30), 3);

    let found = cache
        .lookup(&kernel_a, &pool_b, &Uid::from("echo"))
        .await
        .unwrap();
    assert_eq!(found.address, pool_b);
    assert_eq!(cache.len(), 1);

    // Unknown uid resolves to ActorNotFound without caching.
    let err = cache
        .lookup(&kernel_a, &pool_b, &Uid::from("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ActorNotFound);
    assert_eq!(cache.len(), 1);

    cache.invalidate_peer(&pool_b);
    assert!(cache.is_empty());
}
