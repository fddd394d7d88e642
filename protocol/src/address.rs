//! Pool addresses and actor references.
//!
//! An address names a pool endpoint: `scheme://host[:port][/subpool/<idx>]`.
//! The `unix` scheme uses a filesystem path as its host part and the
//! `inproc` scheme a process-local endpoint name. An [`ActorRef`] pairs an
//! address with the actor's uid; it is a cheap value with no lifetime tie to
//! the actor it names.

use crate::error::{ActorError, ErrorKind};
use bytes::Bytes;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Maximum uid length in bytes.
pub const MAX_UID_LEN: usize = 64;

/// Transport scheme of a pool address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Same-process queue pair, no serialization.
    Inproc,
    /// Unix domain socket on the same host.
    Unix,
    /// TCP, possibly cross-host.
    Tcp,
    /// RDMA datapath negotiated with the collective plug-in.
    Ucx,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Inproc => "inproc",
            Scheme::Unix => "unix",
            Scheme::Tcp => "tcp",
            Scheme::Ucx => "ucx",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed pool endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Transport scheme.
    pub scheme: Scheme,
    /// Host name, IP, socket path (`unix`) or endpoint name (`inproc`).
    pub host: String,
    /// TCP/UCX port. Not used by `unix` and `inproc`.
    pub port: Option<u16>,
    /// Sub-pool index when addressing a worker process directly.
    pub subpool: Option<u32>,
}

impl Address {
    /// Parse an address string.
    ///
    /// Accepts `inproc://name`, `unix:///tmp/pool.sock`, `tcp://host:port`
    /// and `ucx://host:port`, each optionally followed by `/subpool/<idx>`.
    pub fn parse(input: &str) -> Result<Self, ActorError> {
        let bad = |why: &str| ActorError::new(ErrorKind::ProtocolError, format!("{why}: {input}"));

        let (scheme_str, rest) = input
            .split_once("://")
            .ok_or_else(|| bad("address missing scheme"))?;
        let scheme = match scheme_str {
            "inproc" => Scheme::Inproc,
            "unix" => Scheme::Unix,
            "tcp" => Scheme::Tcp,
            "ucx" => Scheme::Ucx,
            _ => return Err(bad("unknown scheme")),
        };

        // A trailing "/subpool/<idx>" belongs to the address, everything
        // before it is the endpoint. Unix socket paths may themselves
        // contain slashes, so only the suffix form is recognized.
        let (endpoint, subpool) = match rest.rfind("/subpool/") {
            Some(at) => {
                let idx = rest[at + "/subpool/".len()..]
                    .parse::<u32>()
                    .map_err(|_| bad("bad subpool index"))?;
                (&rest[..at], Some(idx))
            }
            None => (rest, None),
        };
        if endpoint.is_empty() {
            return Err(bad("empty endpoint"));
        }

        let (host, port) = match scheme {
            Scheme::Unix | Scheme::Inproc => (endpoint.to_string(), None),
            Scheme::Tcp | Scheme::Ucx => {
                let (host, port) = endpoint
                    .rsplit_once(':')
                    .ok_or_else(|| bad("address missing port"))?;
                let port = port.parse::<u16>().map_err(|_| bad("bad port"))?;
                if host.is_empty() {
                    return Err(bad("empty host"));
                }
                (host.to_string(), Some(port))
            }
        };

        Ok(Self {
            scheme,
            host,
            port,
            subpool,
        })
    }

    /// The same endpoint without any sub-pool suffix.
    pub fn root(&self) -> Address {
        Address {
            subpool: None,
            ..self.clone()
        }
    }

    /// This endpoint re-addressed to a sub-pool index.
    pub fn with_subpool(&self, idx: u32) -> Address {
        Address {
            subpool: Some(idx),
            ..self.clone()
        }
    }

    /// The concrete endpoint to dial for this address.
    ///
    /// Sub-pool suffixed addresses are an indirection: `host:port/subpool/i`
    /// names an actor hosted by worker `i` of the pool at `host:port`. The
    /// worker's own listener is derived deterministically — port `+ 1 + i`
    /// for socket schemes, a `.sub<i>` suffix for path-like schemes — and
    /// both the router and the pool supervisor rely on the same derivation.
    pub fn dial_target(&self) -> Address {
        let Some(idx) = self.subpool else {
            return self.clone();
        };
        match self.scheme {
            Scheme::Tcp | Scheme::Ucx => Address {
                scheme: self.scheme,
                host: self.host.clone(),
                port: self.port.map(|p| p.saturating_add(1 + idx as u16)),
                subpool: None,
            },
            Scheme::Unix | Scheme::Inproc => Address {
                scheme: self.scheme,
                host: format!("{}.sub{}", self.host, idx),
                port: None,
                subpool: None,
            },
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(idx) = self.subpool {
            write!(f, "/subpool/{idx}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = ActorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

/// Actor identifier, unique within its owning pool.
///
/// A uid is an opaque byte sequence of at most [`MAX_UID_LEN`] bytes,
/// typically a caller-chosen name or an allocated integer in decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(Bytes);

impl Uid {
    /// Build a uid from raw bytes, enforcing the length cap.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, ActorError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_UID_LEN {
            return Err(ActorError::new(
                ErrorKind::ProtocolError,
                format!("uid longer than {MAX_UID_LEN} bytes"),
            ));
        }
        Ok(Self(bytes))
    }

    /// Uid for an allocated integer id, rendered as decimal.
    pub fn from_u64(n: u64) -> Self {
        Self(Bytes::from(n.to_string().into_bytes()))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for Uid {
    /// Convenience for literal uids. Truncates nothing: literals longer
    /// than [`MAX_UID_LEN`] are a programming error and panic in debug.
    fn from(s: &str) -> Self {
        debug_assert!(s.len() <= MAX_UID_LEN);
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// Handle naming a live actor.
///
/// Equality and hashing are structural over `(uid, address)`;
/// `proxy_version` is a routing-cache hint and excluded on purpose.
#[derive(Debug, Clone)]
pub struct ActorRef {
    /// Actor uid within the owning pool.
    pub uid: Uid,
    /// Endpoint of the owning pool or sub-pool.
    pub address: Address,
    /// Bumped when the owning pool restarts; stale cached routes are
    /// discarded when the version moves.
    pub proxy_version: u32,
}

impl ActorRef {
    /// Reference an actor by uid and endpoint.
    pub fn new(uid: Uid, address: Address) -> Self {
        Self {
            uid,
            address,
            proxy_version: 0,
        }
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid && self.address == other.address
    }
}

impl Eq for ActorRef {}

impl Hash for ActorRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.uid, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let addr = Address::parse("tcp://node1:7001").unwrap();
        assert_eq!(addr.scheme, Scheme::Tcp);
        assert_eq!(addr.host, "node1");
        assert_eq!(addr.port, Some(7001));
        assert_eq!(addr.subpool, None);
        assert_eq!(addr.to_string(), "tcp://node1:7001");
    }

    #[test]
    fn test_parse_subpool_suffix() {
        let addr = Address::parse("tcp://node1:7001/subpool/3").unwrap();
        assert_eq!(addr.subpool, Some(3));
        assert_eq!(addr.root().to_string(), "tcp://node1:7001");
        assert_eq!(addr.root().with_subpool(3), addr);
    }

    #[test]
    fn test_parse_unix_path_with_slashes() {
        let addr = Address::parse("unix:///tmp/pools/a.sock").unwrap();
        assert_eq!(addr.scheme, Scheme::Unix);
        assert_eq!(addr.host, "/tmp/pools/a.sock");
        assert_eq!(addr.port, None);

        let sub = Address::parse("unix:///tmp/pools/a.sock/subpool/1").unwrap();
        assert_eq!(sub.host, "/tmp/pools/a.sock");
        assert_eq!(sub.subpool, Some(1));
    }

    #[test]
    fn test_parse_inproc() {
        let addr = Address::parse("inproc://p0").unwrap();
        assert_eq!(addr.scheme, Scheme::Inproc);
        assert_eq!(addr.host, "p0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Address::parse("node1:7001").is_err());
        assert!(Address::parse("ftp://node1:7001").is_err());
        assert!(Address::parse("tcp://node1").is_err());
        assert!(Address::parse("tcp://:7001").is_err());
        assert!(Address::parse("tcp://node1:notaport").is_err());
        assert!(Address::parse("tcp://node1:7001/subpool/x").is_err());
    }

    #[test]
    fn test_dial_target_derivation() {
        let root = Address::parse("tcp://node1:7001").unwrap();
        assert_eq!(root.dial_target(), root);
        assert_eq!(
            root.with_subpool(2).dial_target().to_string(),
            "tcp://node1:7004"
        );
        let unix = Address::parse("unix:///tmp/a.sock/subpool/1").unwrap();
        assert_eq!(unix.dial_target().to_string(), "unix:///tmp/a.sock.sub1");
        let inproc = Address::parse("inproc://p0/subpool/0").unwrap();
        assert_eq!(inproc.dial_target().to_string(), "inproc://p0.sub0");
    }

    #[test]
    fn test_uid_length_cap() {
        assert!(Uid::new(vec![0u8; MAX_UID_LEN]).is_ok());
        let err = Uid::new(vec![0u8; MAX_UID_LEN + 1]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
    }

    #[test]
    fn test_ref_equality_ignores_proxy_version() {
        let addr = Address::parse("tcp://node1:7001").unwrap();
        let a = ActorRef::new(Uid::from("ctr"), addr.clone());
        let mut b = ActorRef::new(Uid::from("ctr"), addr);
        b.proxy_version = 7;
        assert_eq!(a, b);
    }
}
