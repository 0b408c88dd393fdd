use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

pub const DEFAULT_VNODES: usize = 128;

/// Consistent-hash ring mapping arbitrary string keys to shard names.
///
/// Each shard contributes `vnodes` virtual nodes at positions
/// `H(shard + "#" + i)`; a key belongs to the shard at the first position
/// at or after `H(key)`, wrapping at the end of the hash space. The ring is
/// never persisted; the coordinator rebuilds it from replica registrations.
#[derive(Clone, Debug)]
pub struct HashRing {
    vnodes: usize,
    positions: BTreeMap<u128, String>,
}

impl HashRing {
    /// `vnodes` must be positive; it controls how evenly the keyspace is
    /// spread and how little of it moves when membership changes.
    pub fn new(vnodes: usize) -> Self {
        assert!(vnodes > 0, "vnodes must be positive");
        Self {
            vnodes,
            positions: BTreeMap::new(),
        }
    }

    fn position(input: &str) -> u128 {
        let digest = Sha256::digest(input.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        u128::from_be_bytes(bytes)
    }

    /// Install `shard`, replacing any previous installation of the same
    /// shard (idempotent upsert).
    pub fn add(&mut self, shard: &str) {
        self.remove(shard);
        for i in 0..self.vnodes {
            let pos = Self::position(&format!("{shard}#{i}"));
            self.positions.insert(pos, shard.to_string());
        }
    }

    pub fn remove(&mut self, shard: &str) {
        for i in 0..self.vnodes {
            let pos = Self::position(&format!("{shard}#{i}"));
            self.positions.remove(&pos);
        }
    }

    /// The shard owning `key`, or `None` iff the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        let h = Self::position(key);
        self.positions
            .range(h..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, shard)| shard.as_str())
    }

    /// Unique shard names currently installed, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.positions.values().cloned().collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn vnodes(&self) -> usize {
        self.vnodes
    }

    /// Virtual-node count per shard; feeds the keyspace-share gauges.
    pub fn vnode_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for shard in self.positions.values() {
            *counts.entry(shard.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VNODES)
    }
}
