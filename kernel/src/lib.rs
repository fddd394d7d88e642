/*!
# xosc-kernel

The actor kernel of the xosc runtime: actor lifecycles (`create`/`destroy`
with `on_create`/`on_receive`/`on_destroy` hooks), per-actor serial
execution on tokio tasks, request/reply and fire-and-forget messaging with
deadlines and cancellation, batch dispatch, the per-process `IndexServer`
naming actor, and the collective-communication plug-in seam.
*/

pub mod actor;
pub mod batch;
pub mod collective;
pub mod kernel;
pub mod lookup;
pub mod registry;

pub use actor::{Actor, ActorContext, ActorState, Message};
pub use collective::Collective;
pub use kernel::{ActorKernel, KernelConfig};
pub use lookup::{index_ref, remote_create, remote_destroy, IndexServer, LookupCache, INDEX_UID};
pub use registry::{ActorFactory, ClassRegistry, InitArgs};
