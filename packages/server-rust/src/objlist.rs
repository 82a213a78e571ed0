//! Object-list cache: the set of oids this node currently stores.
//!
//! Peers insert on create and drop on remove; recovery and the snapshot
//! archive enumerate it instead of walking the backend directory. Vdi
//! deletion clears every oid belonging to the vid in one sweep.

use dashmap::DashMap;
use herd_core::oid::oid_to_vid;

/// Concurrent oid set.
#[derive(Debug, Default)]
pub struct ObjlistCache {
    oids: DashMap<u64, ()>,
}

impl ObjlistCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, oid: u64) {
        self.oids.insert(oid, ());
    }

    pub fn remove(&self, oid: u64) {
        self.oids.remove(&oid);
    }

    #[must_use]
    pub fn contains(&self, oid: u64) -> bool {
        self.oids.contains_key(&oid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.oids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }

    /// All cached oids, sorted for deterministic wire output.
    #[must_use]
    pub fn all(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.oids.iter().map(|e| *e.key()).collect();
        v.sort_unstable();
        v
    }

    /// Drop every oid belonging to `vid` (inode, data, and attribute
    /// objects alike).
    pub fn cleanup_vid(&self, vid: u32) {
        self.oids.retain(|&oid, ()| oid_to_vid(oid) != vid);
    }

    /// Drop everything (cluster format).
    pub fn clear(&self) {
        self.oids.clear();
    }

    /// Seed the cache from a backend scan at startup.
    pub fn seed(&self, oids: impl IntoIterator<Item = u64>) {
        for oid in oids {
            self.insert(oid);
        }
    }
}
