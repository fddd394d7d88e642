/*!
# xosc-pool

Pool daemon for the xosc actor runtime. Runs as the main process of a pool
by default; the supervisor re-invokes the same binary with `--subpool <n>`
for each worker process.

Exit codes: 0 clean shutdown, 1 unrecoverable error, 2 configuration
error, 137 when forcibly terminated.
*/

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use xosc_kernel::{Actor, ActorContext, ActorKernel, Message};
use xosc_pool::{run_subpool, MainPool, PoolConfig, RestartPolicy};
use xosc_protocol::{ActorError, Address};

#[derive(Parser)]
#[command(name = "xosc-pool")]
#[command(about = "xosc actor pool daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Pool address, e.g. tcp://0.0.0.0:7001 or unix:///tmp/pool.sock
    #[arg(long)]
    address: String,

    /// Number of sub-process workers
    #[arg(long, default_value_t = 0)]
    n_subpools: u32,

    /// Async runtime worker threads (default: CPU count)
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Payload codec name
    #[arg(long, default_value = "raw")]
    codec: String,

    /// Maximum envelope size in bytes
    #[arg(long, default_value_t = xosc_protocol::DEFAULT_MAX_ENVELOPE_BYTES)]
    max_envelope_bytes: usize,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,

    /// Missed heartbeats before a peer is declared gone
    #[arg(long, default_value_t = 2)]
    heartbeat_misses: u32,

    /// Graceful shutdown deadline in seconds
    #[arg(long, default_value_t = 30)]
    graceful_deadline: u64,

    /// Sub-process restart policy: never | on-failure
    #[arg(long, default_value = "on-failure")]
    restart_policy: String,

    /// Run as the worker process for this sub-pool index (internal)
    #[arg(long, hide = true)]
    subpool: Option<u32>,
}

/// Built-in connectivity probe, handy for smoke tests against a fresh
/// pool: replies with its request payload.
struct Echo;

#[async_trait]
impl Actor for Echo {
    async fn on_receive(&mut self, msg: Message, _ctx: &ActorContext) -> Result<Bytes, ActorError> {
        Ok(msg.payload)
    }
}

fn register_builtin_classes(kernel: &Arc<ActorKernel>) {
    kernel
        .classes()
        .register("xosc.echo", |_| Ok(Box::new(Echo) as Box<dyn Actor>));
}

fn pool_config(cli: &Cli) -> anyhow::Result<PoolConfig> {
    let address = Address::parse(&cli.address).context("invalid --address")?;
    let mut config = PoolConfig::new(address);
    config.n_subpools = cli.n_subpools;
    config.worker_threads = cli.worker_threads;
    config.codec = cli.codec.clone();
    config.max_envelope_bytes = cli.max_envelope_bytes;
    config.heartbeat_interval = Duration::from_secs(cli.heartbeat_interval);
    config.heartbeat_misses = cli.heartbeat_misses;
    config.graceful_deadline = Duration::from_secs(cli.graceful_deadline);
    config.restart_policy =
        RestartPolicy::parse(&cli.restart_policy).context("invalid --restart-policy")?;
    Ok(config)
}

async fn run_main_pool(config: PoolConfig) -> anyhow::Result<()> {
    let pool = MainPool::bind(config).await.context("pool bind failed")?;
    register_builtin_classes(pool.kernel());
    pool.launch_subpools()
        .await
        .context("launching sub-pools failed")?;
    info!("pool running, ctrl-c to shut down");

    tokio::signal::ctrl_c()
        .await
        .context("signal handler failed")?;
    info!("shutdown signal received");
    pool.shutdown().await;
    Ok(())
}

fn main() {
    // Clap usage errors exit with code 2, matching the config-error code.
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match pool_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{e:#}"), "configuration error");
            std::process::exit(2);
        }
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .worker_threads(config.worker_threads.unwrap_or_else(num_cpus::get))
        .thread_name("xosc-worker")
        .enable_all();
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime construction failed");
            std::process::exit(1);
        }
    };

    let outcome = match cli.subpool {
        Some(index) => runtime
            .block_on(run_subpool(config, index, register_builtin_classes))
            .map_err(anyhow::Error::from),
        None => runtime.block_on(run_main_pool(config)),
    };

    match outcome {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %format!("{e:#}"), "unrecoverable error");
            std::process::exit(1);
        }
    }
}
