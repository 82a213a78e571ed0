//! Consistent-hash vnode ring and replica placement.
//!
//! Every node is expanded into weighted virtual points on a 64-bit ring.
//! An object is placed on the first N distinct physical nodes encountered
//! clockwise from `fnv1a_64(oid)`. The view is immutable once built;
//! membership changes publish a fresh view, so concurrent readers always
//! see one consistent placement (every node with the same node list
//! computes the identical ring).

use serde::{Deserialize, Serialize};

use crate::hash::{fnv1a_64, fnv1a_64_seed};
use crate::node::Node;

// ---------------------------------------------------------------------------
// VnodeView
// ---------------------------------------------------------------------------

/// Immutable placement view over one membership epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VnodeView {
    /// Member nodes, sorted by identity.
    nodes: Vec<Node>,
    /// Ring points: (position, index into `nodes`), sorted by position.
    ring: Vec<(u64, u16)>,
    /// Number of distinct failure domains among the members.
    nr_zones: usize,
}

impl VnodeView {
    /// Build a view from a member list. The list is sorted and
    /// deduplicated by node identity so all nodes derive the same ring.
    #[must_use]
    pub fn new(members: &[Node]) -> Self {
        let mut nodes: Vec<Node> = members.to_vec();
        nodes.sort();
        nodes.dedup_by(|a, b| a.nid == b.nid);

        let mut ring = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            let base = fnv1a_64(&node.nid.identity_bytes());
            for v in 0..node.nr_vnodes {
                let point = fnv1a_64_seed(&u32::from(v).to_le_bytes(), base);
                ring.push((point, i as u16));
            }
        }
        ring.sort_unstable();

        let mut zones: Vec<u32> = nodes.iter().map(|n| n.zone).collect();
        zones.sort_unstable();
        zones.dedup();

        Self {
            nodes,
            ring,
            nr_zones: zones.len(),
        }
    }

    /// An empty view (no members, no placement).
    #[must_use]
    pub fn empty() -> Self {
        Self::new(&[])
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn nr_zones(&self) -> usize {
        self.nr_zones
    }

    /// Effective replica count for a requested copy count: capped by the
    /// number of failure domains actually present.
    #[must_use]
    pub fn obj_copy_count(&self, requested: usize) -> usize {
        requested.min(self.nr_zones.max(1)).min(self.nodes.len().max(1))
    }

    /// The first `n` distinct physical nodes clockwise from the object's
    /// hash point. Returns fewer than `n` nodes when the cluster is
    /// smaller than `n`.
    #[must_use]
    pub fn replicas_for(&self, oid: u64, n: usize) -> Vec<&Node> {
        if self.ring.is_empty() || n == 0 {
            return Vec::new();
        }

        let start = fnv1a_64(&oid.to_le_bytes());
        let first = self.ring.partition_point(|&(p, _)| p < start);

        let mut picked: Vec<u16> = Vec::with_capacity(n);
        for step in 0..self.ring.len() {
            let (_, idx) = self.ring[(first + step) % self.ring.len()];
            if !picked.contains(&idx) {
                picked.push(idx);
                if picked.len() == n {
                    break;
                }
            }
        }

        picked.iter().map(|&i| &self.nodes[usize::from(i)]).collect()
    }

    /// Whether `node` is among the first `n` replicas for `oid`.
    #[must_use]
    pub fn is_replica(&self, oid: u64, n: usize, node: &Node) -> bool {
        self.replicas_for(oid, n).iter().any(|m| m.nid == node.nid)
    }
}
