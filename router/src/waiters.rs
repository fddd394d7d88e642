//! Pending-reply registry.
//!
//! A waiter is registered under its correlation id before the request
//! envelope leaves the process, and cleared exactly once — by the reply,
//! an error, a timeout, or a cancel. Channel failure fails every waiter
//! that was routed over that peer.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use xosc_protocol::{ActorError, Address, Envelope};

struct Waiter {
    tx: oneshot::Sender<Result<Envelope, ActorError>>,
    peer: Address,
}

/// Correlation id → reply waiter, unique per process.
#[derive(Default)]
pub struct Waiters {
    inner: Mutex<HashMap<u64, Waiter>>,
}

impl Waiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Must happen before the envelope is sent.
    pub fn register(
        &self,
        correlation_id: u64,
        peer: Address,
    ) -> oneshot::Receiver<Result<Envelope, ActorError>> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .inner
            .lock()
            .insert(correlation_id, Waiter { tx, peer });
        debug_assert!(previous.is_none(), "correlation id reused");
        rx
    }

    /// Hand a reply or error to its waiter. Returns false when no waiter
    /// exists (already timed out, cancelled, or never ours).
    pub fn resolve(&self, correlation_id: u64, result: Result<Envelope, ActorError>) -> bool {
        match self.inner.lock().remove(&correlation_id) {
            Some(waiter) => waiter.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop a waiter without resolving it (timeout/cancel path).
    pub fn remove(&self, correlation_id: u64) {
        self.inner.lock().remove(&correlation_id);
    }

    /// Fail every waiter whose request went to `peer`.
    pub fn fail_peer(&self, peer: &Address, error: &ActorError) {
        let failed: Vec<Waiter> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .iter()
                .filter(|(_, w)| &w.peer == peer)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.remove(&id))
                .collect()
        };
        for waiter in failed {
            let _ = waiter.tx.send(Err(error.clone()));
        }
    }

    /// In-flight request count, for tests and introspection.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xosc_protocol::ErrorKind;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_clears_exactly_once() {
        let waiters = Waiters::new();
        let rx = waiters.register(7, addr("tcp://b:1"));
        assert_eq!(waiters.len(), 1);

        assert!(waiters.resolve(7, Err(ActorError::new(ErrorKind::Timeout, "t"))));
        assert!(!waiters.resolve(7, Err(ActorError::new(ErrorKind::Timeout, "t"))));
        assert!(waiters.is_empty());
        assert_eq!(rx.await.unwrap().unwrap_err().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_fail_peer_scopes_to_one_channel() {
        let waiters = Waiters::new();
        let rx_b = waiters.register(1, addr("tcp://b:1"));
        let mut rx_c = waiters.register(2, addr("tcp://c:1"));

        waiters.fail_peer(&addr("tcp://b:1"), &ActorError::new(ErrorKind::PeerGone, "b died"));
        assert_eq!(rx_b.await.unwrap().unwrap_err().kind, ErrorKind::PeerGone);
        assert!(rx_c.try_recv().is_err());
        assert_eq!(waiters.len(), 1);
    }
}
