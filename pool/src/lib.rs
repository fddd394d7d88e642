/*!
# xosc-pool

Host-level pooling for the xosc actor runtime. A pool is one main process
plus N sub-process workers behind a single address prefix: the supervisor
launches and monitors the workers, places new actors by policy
(round-robin, least-loaded, or stable affinity hashing), aggregates worker
registries from heartbeat piggyback, and coordinates graceful shutdown.
*/

pub mod config;
pub mod placement;
pub mod supervisor;
pub mod worker;

pub use config::{PoolConfig, RestartPolicy};
pub use placement::{AllocationPolicy, Placer};
pub use supervisor::{MainPool, Placement, PoolSupervisor};
pub use worker::run_subpool;
