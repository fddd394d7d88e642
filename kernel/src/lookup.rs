//! Naming and cross-node lookup.
//!
//! Every pool process hosts an `IndexServer` actor under a well-known uid.
//! It answers lookups against the local registry plus the aggregated
//! sub-pool view, and performs create/destroy on behalf of remote callers.
//! Clients cache lookup responses for a TTL and invalidate them when the
//! peer goes away.
//!
//! Cross-node operations exchange JSON payloads — index envelopes pin the
//! JSON codec id regardless of the pool's configured codec — so uids
//! travelling this path are utf-8 strings. Binary uids stay usable for
//! purely local actors.

use crate::actor::{Actor, ActorContext, Message};
use crate::kernel::ActorKernel;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use xosc_protocol::{ActorError, ActorRef, Address, ErrorKind, Uid, CODEC_JSON};

/// Well-known uid of the per-process index actor.
pub const INDEX_UID: &str = "IndexServer";

/// The index actor of the pool at `pool`.
pub fn index_ref(pool: &Address) -> ActorRef {
    ActorRef::new(Uid::from(INDEX_UID), pool.clone())
}

fn bad_request(why: impl Into<String>) -> ActorError {
    ActorError::new(ErrorKind::ProtocolError, why)
}

fn uid_string(uid: &Uid) -> String {
    String::from_utf8_lossy(uid.as_bytes()).into_owned()
}

/// Per-process registry front: lookup, create and destroy over the wire.
pub struct IndexServer;

impl IndexServer {
    /// Register the index class and create its instance. Called once per
    /// process at pool bootstrap.
    pub async fn spawn(kernel: &Arc<ActorKernel>) -> Result<ActorRef, ActorError> {
        kernel
            .classes()
            .register("xosc.index", |_args| Ok(Box::new(IndexServer) as Box<dyn Actor>));
        kernel
            .create_actor("xosc.index", Value::Null, Some(Uid::from(INDEX_UID)))
            .await
    }
}

#[async_trait]
impl Actor for IndexServer {
    async fn on_receive(
        &mut self,
        msg: Message,
        ctx: &ActorContext,
    ) -> Result<Bytes, ActorError> {
        let request: Value = ctx.decode(&msg)?;
        let op = request["op"]
            .as_str()
            .ok_or_else(|| bad_request("index request missing op"))?;
        let kernel = ctx.kernel();

        let response = match op {
            "lookup" => {
                let uid = request["uid"]
                    .as_str()
                    .ok_or_else(|| bad_request("lookup missing uid"))?;
                match kernel.resolve_uid(&Uid::from(uid)) {
                    Some(actor) => json!({
                        "found": true,
                        "uid": uid,
                        "address": actor.address.to_string(),
                    }),
                    None => json!({ "found": false }),
                }
            }
            "create" => {
                let class_id = request["class"]
                    .as_str()
                    .ok_or_else(|| bad_request("create missing class"))?;
                let uid = request["uid"].as_str().map(Uid::from);
                let actor = kernel
                    .create_actor(class_id, request["init"].clone(), uid)
                    .await?;
                json!({
                    "uid": uid_string(&actor.uid),
                    "address": actor.address.to_string(),
                })
            }
            "destroy" => {
                let uid = request["uid"]
                    .as_str()
                    .ok_or_else(|| bad_request("destroy missing uid"))?;
                let actor = ActorRef::new(Uid::from(uid), kernel.public_address());
                kernel.destroy_actor(&actor).await?;
                json!({ "ok": true })
            }
            other => return Err(bad_request(format!("unknown index op {other:?}"))),
        };
        Ok(Bytes::from(response.to_string()))
    }
}

/// Create an actor on a remote pool through its index actor.
pub async fn remote_create(
    kernel: &Arc<ActorKernel>,
    pool: &Address,
    class_id: &str,
    init_args: Value,
    uid: Option<Uid>,
) -> Result<ActorRef, ActorError> {
    let mut request = json!({ "op": "create", "class": class_id, "init": init_args });
    if let Some(uid) = &uid {
        request["uid"] = Value::String(uid_string(uid));
    }
    let reply = kernel
        .send_with_codec(
            &index_ref(pool),
            Bytes::from(request.to_string()),
            CODEC_JSON,
            None,
        )
        .await?;
    let response: Value = serde_json::from_slice(&reply)
        .map_err(|e| bad_request(format!("create response: {e}")))?;
    let uid = response["uid"]
        .as_str()
        .ok_or_else(|| bad_request("create response missing uid"))?;
    let address = response["address"]
        .as_str()
        .ok_or_else(|| bad_request("create response missing address"))?;
    Ok(ActorRef::new(Uid::from(uid), Address::parse(address)?))
}

/// Destroy an actor owned by another process through its index actor.
pub async fn remote_destroy(
    kernel: &Arc<ActorKernel>,
    actor: &ActorRef,
) -> Result<(), ActorError> {
    let request = json!({ "op": "destroy", "uid": uid_string(&actor.uid) });
    let result = kernel
        .send_with_codec(
            &index_ref(&actor.address),
            Bytes::from(request.to_string()),
            CODEC_JSON,
            None,
        )
        .await;
    match result {
        Ok(_) => Ok(()),
        // Destroy stays idempotent across the wire.
        Err(e) if e.kind == ErrorKind::ActorNotFound => Ok(()),
        Err(e) => Err(e),
    }
}

struct CachedRef {
    actor: ActorRef,
    cached_at: Instant,
}

/// Client-side lookup cache with TTL and peer invalidation.
pub struct LookupCache {
    ttl: Duration,
    retries: u32,
    attempt_timeout: Duration,
    entries: Mutex<HashMap<(Address, Uid), CachedRef>>,
}

impl LookupCache {
    pub fn new(ttl: Duration, retries: u32) -> Self {
        Self {
            ttl,
            retries,
            attempt_timeout: Duration::from_secs(5),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `uid` at the pool behind `pool`, consulting the cache first.
    ///
    /// A fresh lookup clears the router's stale-route marker for the pool,
    /// then retries transient failures up to the budget; exhaustion maps
    /// to `ActorNotFound`.
    pub async fn lookup(
        &self,
        kernel: &Arc<ActorKernel>,
        pool: &Address,
        uid: &Uid,
    ) -> Result<ActorRef, ActorError> {
        let key = (pool.clone(), uid.clone());
        if let Some(cached) = self.entries.lock().get(&key) {
            if cached.cached_at.elapsed() < self.ttl {
                return Ok(cached.actor.clone());
            }
        }

        kernel.router().refresh_route(pool);
        let request = json!({ "op": "lookup", "uid": uid_string(uid) });
        let payload = Bytes::from(request.to_string());
        let mut last_error = None;
        for attempt in 0..self.retries.max(1) {
            let deadline = Instant::now() + self.attempt_timeout;
            match kernel
                .send_with_codec(&index_ref(pool), payload.clone(), CODEC_JSON, Some(deadline))
                .await
            {
                Ok(reply) => {
                    let response: Value = serde_json::from_slice(&reply)
                        .map_err(|e| bad_request(format!("lookup response: {e}")))?;
                    if !response["found"].as_bool().unwrap_or(false) {
                        return Err(ActorError::new(
                            ErrorKind::ActorNotFound,
                            format!("{uid} not registered at {pool}"),
                        ));
                    }
                    let address = response["address"]
                        .as_str()
                        .ok_or_else(|| bad_request("lookup response missing address"))?;
                    let actor = ActorRef::new(uid.clone(), Address::parse(address)?);
                    self.entries.lock().insert(
                        key,
                        CachedRef {
                            actor: actor.clone(),
                            cached_at: Instant::now(),
                        },
                    );
                    return Ok(actor);
                }
                Err(e)
                    if matches!(e.kind, ErrorKind::PeerGone | ErrorKind::Timeout) =>
                {
                    debug!(%pool, %uid, attempt, error = %e, "lookup attempt failed");
                    kernel.router().refresh_route(pool);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        let detail = last_error
            .map(|e| e.reason)
            .unwrap_or_else(|| "no attempts made".to_string());
        Err(ActorError::new(
            ErrorKind::ActorNotFound,
            format!("lookup of {uid} at {pool} exhausted retries: {detail}"),
        ))
    }

    /// Drop every cached ref resolved through or living on `peer`.
    pub fn invalidate_peer(&self, peer: &Address) {
        let target = peer.dial_target();
        self.entries.lock().retain(|(pool, _), cached| {
            pool.dial_target() != target && cached.actor.address.dial_target() != target
        });
    }

    /// Drop one cached entry.
    pub fn invalidate(&self, pool: &Address, uid: &Uid) {
        self.entries.lock().remove(&(pool.clone(), uid.clone()));
    }

    /// Number of live cache entries, for tests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
