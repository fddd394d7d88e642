//! Sub-pool placement policies.
//!
//! A pool spreads actors across its worker processes by one of three
//! policies. Affinity hashing is deliberately stable — not the std
//! `RandomState` — so a uid maps to the same sub-pool on every query
//! while the topology is unchanged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// How `create_actor` picks a sub-pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationPolicy {
    /// Next index by monotonic counter.
    #[default]
    RoundRobin,
    /// The sub-pool with the fewest queued envelopes; round-robin breaks
    /// ties.
    LeastLoaded,
    /// `hash(key) mod n`, deterministic.
    Affinity,
}

/// FNV-1a, 64-bit. Stable across processes and restarts.
fn fnv1a(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Placement state: the round-robin cursor.
#[derive(Debug, Default)]
pub struct Placer {
    cursor: AtomicU64,
}

impl Placer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a sub-pool index in `0..n`.
    ///
    /// `key` feeds affinity hashing; `loads` is the queued-envelope view
    /// from the latest registry piggyback (missing sub-pools count as
    /// unloaded).
    pub fn pick(
        &self,
        policy: AllocationPolicy,
        key: &[u8],
        loads: &HashMap<u32, u64>,
        n: u32,
    ) -> u32 {
        debug_assert!(n > 0);
        match policy {
            AllocationPolicy::RoundRobin => self.next_cursor(n),
            AllocationPolicy::Affinity => (fnv1a(key) % u64::from(n)) as u32,
            AllocationPolicy::LeastLoaded => {
                let min = (0..n)
                    .map(|idx| loads.get(&idx).copied().unwrap_or(0))
                    .min()
                    .unwrap_or(0);
                let tied: Vec<u32> = (0..n)
                    .filter(|idx| loads.get(idx).copied().unwrap_or(0) == min)
                    .collect();
                tied[(self.next_cursor(tied.len() as u32)) as usize]
            }
        }
    }

    fn next_cursor(&self, n: u32) -> u32 {
        (self.cursor.fetch_add(1, Ordering::Relaxed) % u64::from(n)) as u32
    }
}
