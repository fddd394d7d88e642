//! Sub-pool worker process entry.
//!
//! A worker binds its own listener (derived from the pool address and its
//! index), hosts a kernel with the sub-pool public address, reports its
//! registry to the main process on every heartbeat, and exits when the
//! pool drains.

use crate::config::PoolConfig;
use crate::supervisor::{resolve_codec, router_config};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use xosc_kernel::{ActorKernel, IndexServer, KernelConfig, INDEX_UID};
use xosc_protocol::{ActorError, ActorRef, ControlMsg, Envelope, Uid};
use xosc_router::Router;

/// Run a sub-pool worker until the pool shuts down.
///
/// `setup` runs after the kernel exists and before any traffic, so the
/// embedder registers its actor classes there — the same classes the main
/// process knows, since creates are routed here by placement.
pub async fn run_subpool<F>(
    config: PoolConfig,
    index: u32,
    setup: F,
) -> Result<(), ActorError>
where
    F: FnOnce(&Arc<ActorKernel>),
{
    let public = config.address.with_subpool(index);
    let listen = public.dial_target();
    let codec_id = resolve_codec(&config)?;
    let (router, delivery) = Router::bind(&listen, router_config(&config)).await?;
    let kernel_config = KernelConfig {
        codec_id,
        public_address: Some(public.clone()),
        ..KernelConfig::default()
    };
    let (kernel, mut control_rx) = ActorKernel::start(router, delivery, kernel_config);
    setup(&kernel);
    IndexServer::spawn(&kernel).await?;
    info!(%public, index, "sub-pool worker up");

    // Registry piggyback: every heartbeat tick the worker tells the main
    // process which uids it hosts and how much work is queued.
    let reporter = {
        let kernel = kernel.clone();
        let main_address = config.address.clone();
        let interval = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let uids = kernel
                    .local_uids()
                    .into_iter()
                    .filter(|uid| uid.as_bytes() != INDEX_UID.as_bytes())
                    .map(|uid| uid.as_bytes().to_vec())
                    .collect();
                let report = ControlMsg::Registry {
                    subpool: index,
                    uids,
                    queued: kernel.queued_total(),
                };
                let notice = Envelope::control(
                    ActorRef::new(Uid::from(""), main_address.clone()),
                    report.to_bytes(),
                );
                if let Err(e) = kernel.router().send_envelope(notice, None).await {
                    debug!(error = %e, "registry report failed");
                }
            }
        })
    };

    // Serve until the main process broadcasts the drain.
    while let Some(msg) = control_rx.recv().await {
        match msg {
            ControlMsg::ShutdownPool => break,
            other => debug!(?other, "ignoring control message"),
        }
    }
    reporter.abort();

    // Drain: destroy local actors so their inboxes flush and `on_destroy`
    // hooks run; the index actor goes last.
    info!(index, "sub-pool draining");
    let mut uids = kernel.local_uids();
    uids.sort_by_key(|uid| uid.as_bytes() == INDEX_UID.as_bytes());
    for uid in uids {
        let actor = ActorRef::new(uid, public.clone());
        if let Err(e) = kernel.destroy_actor(&actor).await {
            warn!(%actor, error = %e, "drain destroy failed");
        }
    }
    kernel.router().shutdown();
    Ok(())
}
