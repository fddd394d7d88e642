//! Envelope-level duplex abstraction over a concrete byte stream or queue.
//!
//! Drivers hand out a split [`WireTx`]/[`WireRx`] pair so the channel's
//! writer and reader tasks can run independently. Stream-backed wires frame
//! envelopes per the protocol crate; the in-process wire moves `Envelope`
//! values through a queue without touching bytes at all.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use xosc_protocol::envelope::flags;
use xosc_protocol::frame;
use xosc_protocol::{ActorError, Envelope, ErrorKind};

/// Sending half of a wire.
#[async_trait]
pub trait WireTx: Send {
    /// Write one envelope. Errors map to `PeerGone`/`PayloadTooLarge`.
    async fn send(&mut self, env: Envelope) -> Result<(), ActorError>;

    /// Flush and shut the write side down.
    async fn close(&mut self) -> Result<(), ActorError>;
}

/// Receiving half of a wire.
#[async_trait]
pub trait WireRx: Send {
    /// Read one envelope. `Ok(None)` means the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Envelope>, ActorError>;
}

/// A connected wire, split for independent reader/writer tasks.
pub type WirePair = (Box<dyn WireTx>, Box<dyn WireRx>);

impl std::fmt::Debug for dyn WireTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn WireTx")
    }
}

impl std::fmt::Debug for dyn WireRx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn WireRx")
    }
}

fn peer_gone(e: std::io::Error) -> ActorError {
    ActorError::new(ErrorKind::PeerGone, e.to_string())
}

/// Framed writer over any async byte sink.
pub struct FramedTx<W> {
    writer: W,
    max_envelope_bytes: usize,
}

impl<W: AsyncWrite + Unpin + Send> FramedTx<W> {
    pub fn new(writer: W, max_envelope_bytes: usize) -> Self {
        Self {
            writer,
            max_envelope_bytes,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> WireTx for FramedTx<W> {
    async fn send(&mut self, env: Envelope) -> Result<(), ActorError> {
        let frame = frame::encode(&env, self.max_envelope_bytes)?;
        self.writer.write_all(&frame).await.map_err(peer_gone)?;
        self.writer.flush().await.map_err(peer_gone)
    }

    async fn close(&mut self) -> Result<(), ActorError> {
        self.writer.shutdown().await.map_err(peer_gone)
    }
}

/// Framed reader over any async byte source.
pub struct FramedRx<R> {
    reader: R,
    max_envelope_bytes: usize,
}

impl<R: AsyncRead + Unpin + Send> FramedRx<R> {
    pub fn new(reader: R, max_envelope_bytes: usize) -> Self {
        Self {
            reader,
            max_envelope_bytes,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> WireRx for FramedRx<R> {
    async fn recv(&mut self) -> Result<Option<Envelope>, ActorError> {
        let mut prefix = [0u8; frame::PREFIX_LEN];
        match self.reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            // EOF on a frame boundary is a clean close.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(peer_gone(e)),
        }
        let parsed = frame::parse_prefix(&prefix, self.max_envelope_bytes)?;

        let mut body = vec![0u8; parsed.total_len as usize];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(peer_gone)?;
        let env = frame::decode_body(parsed.header_len, body.into())?;
        Ok(Some(env))
    }
}

/// In-process sending half: a queue of envelopes, no serialization.
pub struct InprocTx {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
}

impl InprocTx {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl WireTx for InprocTx {
    async fn send(&mut self, env: Envelope) -> Result<(), ActorError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ActorError::new(ErrorKind::PeerGone, "wire closed"))?;
        tx.send(env.with_flag(flags::CODEC_BYPASS))
            .map_err(|_| ActorError::new(ErrorKind::PeerGone, "inproc peer dropped"))
    }

    async fn close(&mut self) -> Result<(), ActorError> {
        self.tx.take();
        Ok(())
    }
}

/// In-process receiving half.
pub struct InprocRx {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl InprocRx {
    pub fn new(rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl WireRx for InprocRx {
    async fn recv(&mut self) -> Result<Option<Envelope>, ActorError> {
        Ok(self.rx.recv().await)
    }
}

/// A crossed pair of in-process wires, one end per peer.
pub fn inproc_pair() -> (WirePair, WirePair) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a: WirePair = (
        Box::new(InprocTx::new(a_tx)),
        Box::new(InprocRx::new(a_rx)),
    );
    let b: WirePair = (
        Box::new(InprocTx::new(b_tx)),
        Box::new(InprocRx::new(b_rx)),
    );
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use xosc_protocol::{ActorRef, Address, Uid};

    fn some_ref(uid: &str) -> ActorRef {
        ActorRef::new(Uid::from(uid), Address::parse("inproc://p0").unwrap())
    }

    #[tokio::test]
    async fn test_inproc_pair_delivers_both_ways() {
        let ((mut a_tx, mut a_rx), (mut b_tx, mut b_rx)) = inproc_pair();

        a_tx.send(Envelope::tell(some_ref("b"), Bytes::from_static(b"to b"), 0))
            .await
            .unwrap();
        let env = b_rx.recv().await.unwrap().unwrap();
        assert_eq!(&env.payload[..], b"to b");
        assert!(env.has_flag(flags::CODEC_BYPASS));

        b_tx.send(Envelope::tell(some_ref("a"), Bytes::from_static(b"to a"), 0))
            .await
            .unwrap();
        let env = a_rx.recv().await.unwrap().unwrap();
        assert_eq!(&env.payload[..], b"to a");
    }

    #[tokio::test]
    async fn test_inproc_close_then_send_fails() {
        let ((mut a_tx, _a_rx), (_b_tx, mut b_rx)) = inproc_pair();
        a_tx.close().await.unwrap();
        let err = a_tx
            .send(Envelope::tell(some_ref("b"), Bytes::new(), 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerGone);
        assert!(b_rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_framed_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (crx, ctx) = tokio::io::split(client);
        let (srx, _stx) = tokio::io::split(server);
        let mut tx = FramedTx::new(ctx, 1024 * 1024);
        let mut rx = FramedRx::new(srx, 1024 * 1024);
        let _keep = crx;

        let sent = Envelope::send(
            some_ref("caller"),
            some_ref("echo"),
            Bytes::from_static(b"hi"),
            1,
        );
        tx.send(sent.clone()).await.unwrap();
        let got = rx.recv().await.unwrap().unwrap();
        assert_eq!(got.payload, sent.payload);
        assert_eq!(got.correlation_id, sent.correlation_id);
    }

    #[tokio::test]
    async fn test_framed_clean_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let (srx, _stx) = tokio::io::split(server);
        let mut rx = FramedRx::new(srx, 1024);
        drop(client);
        assert!(rx.recv().await.unwrap().is_none());
    }
}
