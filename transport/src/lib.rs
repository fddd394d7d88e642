/*!
# xosc-transport

Transport layer of the xosc actor runtime: the envelope-level wire
abstraction, the concrete drivers (in-process queues, Unix domain sockets,
TCP with `TCP_NODELAY`), and the channel state machine with handshake,
heartbeat and outbound flow control.

The router crate composes these into a per-process channel table; nothing
in here knows about actors.
*/

pub mod channel;
pub mod driver;
pub mod wire;

pub use channel::{
    open_channel, ChannelConfig, ChannelEvent, ChannelHandle, ChannelState, PeerInfo,
};
pub use driver::{Acceptor, Driver, DriverTable, InprocDriver, TcpDriver};
#[cfg(unix)]
pub use driver::UnixDriver;
pub use wire::{inproc_pair, FramedRx, FramedTx, WirePair, WireRx, WireTx};
