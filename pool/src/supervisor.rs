//! Pool supervisor: the main process of a pool.
//!
//! Owns the kernel of the main process, launches and monitors sub-process
//! workers, aggregates their registries from heartbeat piggyback, places
//! new actors by policy, and coordinates graceful shutdown.

use crate::config::{PoolConfig, RestartPolicy};
use crate::placement::{AllocationPolicy, Placer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use xosc_kernel::{remote_create, ActorKernel, IndexServer, KernelConfig, LookupCache};
use xosc_protocol::{
    ActorError, ActorRef, Address, CodecRegistry, ControlMsg, Envelope, ErrorKind, Uid,
};
use xosc_router::{Router, RouterConfig};
use xosc_transport::ChannelConfig;

/// Where `create_actor` puts the new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Host it in the main process.
    MainProcess,
    /// Pick a sub-pool by policy.
    Policy(AllocationPolicy),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubpoolStatus {
    Starting,
    Up,
    Down,
}

struct Subpool {
    public: Address,
    status: SubpoolStatus,
    last_report: Instant,
    restarts: u32,
    child: Option<Child>,
}

/// Shared router/channel configuration derived from a pool config.
pub(crate) fn router_config(config: &PoolConfig) -> RouterConfig {
    RouterConfig {
        channel: ChannelConfig {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_misses: config.heartbeat_misses,
            ..ChannelConfig::default()
        },
        max_envelope_bytes: config.max_envelope_bytes,
        ..RouterConfig::default()
    }
}

pub(crate) fn resolve_codec(config: &PoolConfig) -> Result<u8, ActorError> {
    CodecRegistry::new()
        .by_name(&config.codec)
        .map(|codec| codec.id())
        .ok_or_else(|| {
            ActorError::new(
                ErrorKind::UnsupportedCodec,
                format!("codec {:?} is not registered", config.codec),
            )
        })
}

/// The main process of a pool: kernel plus supervisor.
pub struct MainPool {
    kernel: Arc<ActorKernel>,
    supervisor: Arc<PoolSupervisor>,
    lookups: LookupCache,
}

impl MainPool {
    /// Bind the main process: router, kernel, index actor, supervision
    /// loops. Worker processes are launched separately with
    /// [`MainPool::launch_subpools`] so embedders can register actor
    /// classes first.
    pub async fn bind(config: PoolConfig) -> Result<MainPool, ActorError> {
        let codec_id = resolve_codec(&config)?;
        let (router, delivery) = Router::bind(&config.address, router_config(&config)).await?;
        let kernel_config = KernelConfig {
            codec_id,
            ..KernelConfig::default()
        };
        let (kernel, control_rx) = ActorKernel::start(router, delivery, kernel_config);
        IndexServer::spawn(&kernel).await?;

        let supervisor = Arc::new(PoolSupervisor {
            kernel: kernel.clone(),
            config,
            placer: Placer::new(),
            subpools: Mutex::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
            next_uid: AtomicU64::new(1),
        });
        tokio::spawn(control_loop(supervisor.clone(), control_rx));
        tokio::spawn(monitor_loop(supervisor.clone()));

        let lookups = LookupCache::new(
            kernel.config().lookup_ttl,
            kernel.config().lookup_retries,
        );
        Ok(MainPool {
            kernel,
            supervisor,
            lookups,
        })
    }

    /// The main-process kernel, for class registration and direct ops.
    pub fn kernel(&self) -> &Arc<ActorKernel> {
        &self.kernel
    }

    /// The supervisor, for placement queries and shutdown.
    pub fn supervisor(&self) -> &Arc<PoolSupervisor> {
        &self.supervisor
    }

    /// Spawn the configured number of sub-process workers from this
    /// binary.
    pub async fn launch_subpools(&self) -> Result<(), ActorError> {
        for index in 0..self.supervisor.config.n_subpools {
            self.supervisor.launch_subpool(index)?;
        }
        Ok(())
    }

    /// Create an actor, placing it per `placement`.
    pub async fn create_actor(
        &self,
        class_id: &str,
        init_args: serde_json::Value,
        uid: Option<Uid>,
        placement: Placement,
    ) -> Result<ActorRef, ActorError> {
        match placement {
            Placement::MainProcess => self.kernel.create_actor(class_id, init_args, uid).await,
            Placement::Policy(policy) => {
                let uid = uid.unwrap_or_else(|| self.supervisor.alloc_uid());
                let index = self.supervisor.place(policy, &uid)?;
                match index {
                    None => self.kernel.create_actor(class_id, init_args, Some(uid)).await,
                    Some(index) => {
                        let target = self.supervisor.config.address.with_subpool(index);
                        let actor =
                            remote_create(&self.kernel, &target, class_id, init_args, Some(uid.clone()))
                                .await?;
                        self.supervisor.assignments.lock().insert(uid, index);
                        Ok(actor)
                    }
                }
            }
        }
    }

    /// Destroy an actor wherever it lives.
    pub async fn destroy_actor(&self, actor: &ActorRef) -> Result<(), ActorError> {
        self.kernel.destroy_actor(actor).await?;
        self.supervisor.assignments.lock().remove(&actor.uid);
        self.lookups.invalidate(&actor.address, &actor.uid);
        Ok(())
    }

    /// Resolve a uid at a remote pool, through the lookup cache.
    pub async fn lookup(&self, pool: &Address, uid: &Uid) -> Result<ActorRef, ActorError> {
        self.lookups.lookup(&self.kernel, pool, uid).await
    }

    /// Drain sub-pools and stop. See [`PoolSupervisor::shutdown`].
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Launches, monitors and restarts the worker processes of one pool.
pub struct PoolSupervisor {
    kernel: Arc<ActorKernel>,
    config: PoolConfig,
    placer: Placer,
    subpools: Mutex<HashMap<u32, Subpool>>,
    /// `actor_index`: uid → sub-pool, stable once assigned.
    assignments: Mutex<HashMap<Uid, u32>>,
    next_uid: AtomicU64,
}

impl PoolSupervisor {
    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn alloc_uid(&self) -> Uid {
        Uid::from_u64(self.next_uid.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve a placement policy to a sub-pool index. `None` means the
    /// main process (no sub-pools configured).
    ///
    /// An existing assignment wins: a uid never moves between sub-pools
    /// while it lives. Targeting a sub-pool that is currently down fails
    /// with `SubPoolLost`.
    pub fn place(
        &self,
        policy: AllocationPolicy,
        uid: &Uid,
    ) -> Result<Option<u32>, ActorError> {
        let n = self.config.n_subpools;
        if n == 0 {
            return Ok(None);
        }
        let index = match self.assignments.lock().get(uid) {
            Some(existing) => *existing,
            None => self
                .placer
                .pick(policy, uid.as_bytes(), &self.kernel.subpool_loads(), n),
        };
        let down = self
            .subpools
            .lock()
            .get(&index)
            .map(|s| s.status == SubpoolStatus::Down)
            .unwrap_or(false);
        if down {
            return Err(ActorError::new(
                ErrorKind::SubPoolLost,
                format!("sub-pool {index} is down"),
            ));
        }
        Ok(Some(index))
    }

    /// Spawn one worker process from the current binary.
    pub fn launch_subpool(&self, index: u32) -> Result<(), ActorError> {
        let exe = std::env::current_exe()
            .map_err(|e| ActorError::internal(format!("current_exe: {e}")))?;
        let child = Command::new(exe)
            .arg("--address")
            .arg(self.config.address.to_string())
            .arg("--n-subpools")
            .arg(self.config.n_subpools.to_string())
            .arg("--codec")
            .arg(&self.config.codec)
            .arg("--max-envelope-bytes")
            .arg(self.config.max_envelope_bytes.to_string())
            .arg("--heartbeat-interval")
            .arg(self.config.heartbeat_interval.as_secs().to_string())
            .arg("--heartbeat-misses")
            .arg(self.config.heartbeat_misses.to_string())
            .arg("--subpool")
            .arg(index.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ActorError::internal(format!("spawn sub-pool {index}: {e}")))?;
        info!(index, pid = child.id(), "sub-pool launched");
        self.subpools.lock().insert(
            index,
            Subpool {
                public: self.config.address.with_subpool(index),
                status: SubpoolStatus::Starting,
                last_report: Instant::now(),
                restarts: 0,
                child: Some(child),
            },
        );
        Ok(())
    }

    /// Ingest one registry piggyback report from a worker.
    pub fn note_registry(&self, index: u32, uids: Vec<Vec<u8>>, queued: u64) {
        let public = self.config.address.with_subpool(index);
        let parsed: Vec<Uid> = uids
            .into_iter()
            .filter_map(|raw| Uid::new(raw).ok())
            .collect();
        {
            let mut assignments = self.assignments.lock();
            for uid in &parsed {
                assignments.insert(uid.clone(), index);
            }
        }
        self.kernel
            .update_subpool_index(index, public.clone(), parsed, queued);
        let mut subpools = self.subpools.lock();
        let entry = subpools.entry(index).or_insert_with(|| Subpool {
            public,
            status: SubpoolStatus::Starting,
            last_report: Instant::now(),
            restarts: 0,
            child: None,
        });
        entry.status = SubpoolStatus::Up;
        entry.last_report = Instant::now();
    }

    /// Mark sub-pools that stopped reporting as down, deregister their
    /// actors, and restart per policy. Called on every heartbeat tick.
    pub fn check_liveness(&self, now: Instant) {
        let dead_after = self.config.heartbeat_interval * self.config.heartbeat_misses;
        let mut lost = Vec::new();
        {
            let mut subpools = self.subpools.lock();
            for (index, subpool) in subpools.iter_mut() {
                if subpool.status == SubpoolStatus::Up
                    && now.duration_since(subpool.last_report) > dead_after
                {
                    subpool.status = SubpoolStatus::Down;
                    lost.push(*index);
                }
            }
        }
        for index in lost {
            self.on_subpool_lost(index);
        }
    }

    /// A sub-pool died: its actors fail with `SubPoolLost` and their refs
    /// are deregistered. State is never reconstituted — clients re-create.
    fn on_subpool_lost(&self, index: u32) {
        error!(index, "sub-pool lost, deregistering its actors");
        self.kernel.forget_subpool(index);
        self.assignments.lock().retain(|_, assigned| *assigned != index);

        let restart = self.config.restart_policy == RestartPolicy::OnFailure;
        let had_child = {
            let mut subpools = self.subpools.lock();
            match subpools.get_mut(&index) {
                Some(subpool) => {
                    if let Some(mut child) = subpool.child.take() {
                        let _ = child.start_kill();
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        // Only workers this supervisor launched are respawned; externally
        // managed workers (tests, embedders) stay down.
        if restart && had_child {
            let restarts = {
                let mut subpools = self.subpools.lock();
                subpools.get_mut(&index).map(|s| {
                    s.restarts += 1;
                    s.restarts
                })
            };
            warn!(index, ?restarts, "restarting sub-pool");
            if let Err(e) = self.launch_subpool(index) {
                error!(index, error = %e, "sub-pool restart failed");
            }
        }
    }

    /// Graceful pool shutdown: broadcast drain, wait out the deadline,
    /// then kill whatever is left.
    pub async fn shutdown(&self) {
        info!("pool shutting down");
        let targets: Vec<Address> = {
            let subpools = self.subpools.lock();
            subpools
                .values()
                .filter(|s| s.status != SubpoolStatus::Down)
                .map(|s| s.public.clone())
                .collect()
        };
        for public in targets {
            let notice = Envelope::control(
                ActorRef::new(Uid::from(""), public.clone()),
                ControlMsg::ShutdownPool.to_bytes(),
            );
            let deadline = Instant::now() + self.config.heartbeat_interval;
            if let Err(e) = self
                .kernel
                .router()
                .send_envelope(notice, Some(deadline))
                .await
            {
                warn!(%public, error = %e, "drain notice failed");
            }
        }

        let children: Vec<(u32, Child)> = {
            let mut subpools = self.subpools.lock();
            subpools
                .iter_mut()
                .filter_map(|(index, s)| s.child.take().map(|c| (*index, c)))
                .collect()
        };
        let deadline = Instant::now() + self.config.graceful_deadline;
        for (index, mut child) in children {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => info!(index, %status, "sub-pool exited"),
                Ok(Err(e)) => warn!(index, error = %e, "sub-pool wait failed"),
                Err(_elapsed) => {
                    warn!(index, "graceful deadline passed, killing sub-pool");
                    let _ = child.start_kill();
                }
            }
        }
        self.kernel.router().shutdown();
    }
}

async fn control_loop(
    supervisor: Arc<PoolSupervisor>,
    mut control: mpsc::UnboundedReceiver<ControlMsg>,
) {
    while let Some(msg) = control.recv().await {
        match msg {
            ControlMsg::Registry {
                subpool,
                uids,
                queued,
            } => supervisor.note_registry(subpool, uids, queued),
            ControlMsg::ShutdownPool => {
                supervisor.shutdown().await;
                return;
            }
            _ => {}
        }
    }
}

async fn monitor_loop(supervisor: Arc<PoolSupervisor>) {
    let mut ticker = tokio::time::interval(supervisor.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        supervisor.check_liveness(Instant::now());
    }
}
