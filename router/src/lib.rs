/*!
# xosc-router

The per-process dispatch layer of the xosc actor runtime. One [`Router`]
exists per pool process: it listens on the pool address, keeps the channel
table, registers reply waiters before requests leave, reconnects with
full-jitter exponential backoff, and hands non-reply inbound envelopes to
the actor kernel's delivery queue.
*/

pub mod backoff;
pub mod router;
pub mod waiters;

pub use backoff::Backoff;
pub use router::{Router, RouterConfig};
pub use waiters::Waiters;
