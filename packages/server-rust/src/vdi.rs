//! VDI state: the cluster-wide vid bitmap, per-vid replication state,
//! and the inode operations behind the cluster vdi opcodes.
//!
//! A vid is allocated by probing the in-use bitmap from
//! `fnv1a_64(name) & (SD_NR_VDIS - 1)`; the bitmap allocator is
//! authoritative, the name hash is only the probe start (and the index
//! for attribute objects). Bitmap writes happen in cluster-op main
//! phases only, so every node flips the same bits in the same total
//! order.

use std::collections::BTreeMap;

use herd_core::inode::Inode;
use herd_core::oid::{vid_to_attr_oid, vid_to_data_oid, vid_to_vdi_oid, SD_NR_VDIS};
use herd_core::proto::{ResultCode, VdiStateEntry};
use herd_core::{fnv1a_64, oid};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::gateway;
use crate::system::System;

/// Longest probe chain accepted before the bitmap is declared full.
const MAX_PROBES: u32 = SD_NR_VDIS;

/// Probe bound for attribute objects, which live in a small per-name
/// namespace.
const MAX_ATTR_PROBES: u32 = 4096;

// ---------------------------------------------------------------------------
// Bitmap + state table
// ---------------------------------------------------------------------------

const BITMAP_WORDS: usize = (SD_NR_VDIS as usize) / 64;

/// The vdi-inuse bitmap plus per-vid replication state.
pub struct VdiTable {
    inuse: RwLock<Vec<u64>>,
    states: RwLock<BTreeMap<u32, VdiStateEntry>>,
}

impl Default for VdiTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VdiTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inuse: RwLock::new(vec![0u64; BITMAP_WORDS]),
            states: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn test(&self, vid: u32) -> bool {
        let vid = vid & (SD_NR_VDIS - 1);
        self.inuse.read()[(vid / 64) as usize] & (1u64 << (vid % 64)) != 0
    }

    pub fn set(&self, vid: u32) {
        let vid = vid & (SD_NR_VDIS - 1);
        self.inuse.write()[(vid / 64) as usize] |= 1u64 << (vid % 64);
    }

    /// Snapshot of the raw bitmap words (`ReadVdis`).
    #[must_use]
    pub fn bitmap(&self) -> Vec<u64> {
        self.inuse.read().clone()
    }

    /// Replace the bitmap wholesale (join, format).
    pub fn load_bitmap(&self, words: Vec<u64>) {
        let mut inuse = self.inuse.write();
        if words.len() == BITMAP_WORDS {
            *inuse = words;
        } else {
            warn!(words = words.len(), "malformed vdi bitmap ignored");
        }
    }

    pub fn clear(&self) {
        *self.inuse.write() = vec![0u64; BITMAP_WORDS];
        self.states.write().clear();
    }

    /// First free vid along the probe chain from `start`.
    #[must_use]
    pub fn find_free(&self, start: u32) -> Option<u32> {
        let inuse = self.inuse.read();
        for i in 0..MAX_PROBES {
            let vid = start.wrapping_add(i) & (SD_NR_VDIS - 1);
            if inuse[(vid / 64) as usize] & (1u64 << (vid % 64)) == 0 {
                return Some(vid);
            }
        }
        None
    }

    pub fn add_state(&self, vid: u32, nr_copies: u32, snapshot: bool) {
        self.states.write().insert(
            vid,
            VdiStateEntry {
                vid,
                nr_copies,
                snapshot,
            },
        );
    }

    pub fn remove_state(&self, vid: u32) {
        self.states.write().remove(&vid);
    }

    #[must_use]
    pub fn state(&self, vid: u32) -> Option<VdiStateEntry> {
        self.states.read().get(&vid).copied()
    }

    /// Replica count for a vid, falling back to the cluster default.
    #[must_use]
    pub fn copy_count(&self, vid: u32, default: u32) -> u32 {
        self.state(vid).map_or(default, |s| s.nr_copies)
    }

    #[must_use]
    pub fn state_list(&self) -> Vec<VdiStateEntry> {
        self.states.read().values().copied().collect()
    }

    pub fn load_states(&self, entries: &[VdiStateEntry]) {
        let mut states = self.states.write();
        for e in entries {
            states.insert(e.vid, *e);
        }
    }
}

/// Probe start for a vdi name.
#[must_use]
pub fn name_to_vid_probe(name: &str) -> u32 {
    (fnv1a_64(name.as_bytes()) & u64::from(SD_NR_VDIS - 1)) as u32
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// A located vdi.
#[derive(Debug, Clone)]
pub struct VdiInfo {
    pub vid: u32,
    pub inode: Inode,
}

/// Find a vdi by name (and optional tag / snapshot id) along its probe
/// chain.
pub async fn lookup(
    sys: &System,
    name: &str,
    tag: Option<&str>,
    snapid: u32,
) -> Result<VdiInfo, ResultCode> {
    let start = name_to_vid_probe(name);
    for i in 0..MAX_PROBES {
        let vid = start.wrapping_add(i) & (SD_NR_VDIS - 1);
        if !sys.vdi.test(vid) {
            // End of the probe chain: the name was never allocated.
            return Err(ResultCode::NoVdi);
        }
        let inode = read_inode(sys, vid).await?;
        if inode.name != name {
            continue;
        }
        let tag_matches = tag.map_or(true, |t| inode.tag == t);
        let snap_matches = snapid == 0 || inode.snap_id == snapid;
        if !tag_matches || !snap_matches {
            continue;
        }
        if snapid != 0 || tag.is_some() {
            return Ok(VdiInfo { vid, inode });
        }
        // Without a snapshot selector only the working vdi matches.
        if !inode.snapshot && !inode.is_deleted() {
            return Ok(VdiInfo { vid, inode });
        }
    }
    Err(if snapid != 0 || tag.is_some() {
        ResultCode::NoTag
    } else {
        ResultCode::NoVdi
    })
}

async fn read_inode(sys: &System, vid: u32) -> Result<Inode, ResultCode> {
    let bytes = gateway::read_object(
        sys,
        vid_to_vdi_oid(vid),
        herd_core::oid::SD_DATA_OBJ_SIZE as u32,
        0,
    )
    .await?;
    Inode::from_bytes(&bytes)
}

// ---------------------------------------------------------------------------
// Create / snapshot / delete
// ---------------------------------------------------------------------------

/// Parameters of a vdi create (the work phase of `NewVdi`).
#[derive(Debug, Clone)]
pub struct VdiCreateParams {
    pub name: String,
    pub size: u64,
    pub base_vid: u32,
    pub create_snapshot: bool,
    pub nr_copies: u32,
}

/// Outcome of a vdi create, broadcast to every node's main phase.
#[derive(Debug, Clone, Copy)]
pub struct VdiCreated {
    pub vid: u32,
    pub nr_copies: u32,
    /// The previous working vid that became a snapshot, or 0.
    pub old_vid: u32,
}

/// Allocate a vid and write the new inode through the gateway.
///
/// Runs on the originating node only; the resulting vid travels with the
/// cluster-op result so every node installs identical state.
pub async fn create(sys: &System, params: &VdiCreateParams) -> Result<VdiCreated, ResultCode> {
    let copies = if params.nr_copies == 0 {
        sys.nr_copies()
    } else {
        params.nr_copies
    };
    let now = sys.wall_clock_ms();

    if params.create_snapshot {
        let base = lookup(sys, &params.name, None, 0).await?;
        let new_vid = sys
            .vdi
            .find_free(base.vid.wrapping_add(1))
            .ok_or(ResultCode::NoVdi)?;

        let mut parent = base.inode.clone();
        let child = parent.derive_child(new_vid, now);
        parent.set_snapshot("", now);

        write_inode(sys, &parent, copies).await?;
        write_inode(sys, &child, copies).await?;
        info!(name = %params.name, vid = new_vid, parent = base.vid, "vdi snapshot created");
        return Ok(VdiCreated {
            vid: new_vid,
            nr_copies: copies,
            old_vid: base.vid,
        });
    }

    if params.base_vid != 0 {
        // Clone a new working vdi on top of an existing vid; the restore
        // path of the snapshot archive comes through here. The base
        // becomes read-only so exactly one working vdi carries the name.
        let mut base_inode = read_inode(sys, params.base_vid).await?;
        let new_vid = sys
            .vdi
            .find_free(params.base_vid.wrapping_add(1))
            .ok_or(ResultCode::NoVdi)?;
        let child = base_inode.derive_child(new_vid, now);
        let mut old_vid = 0;
        if !base_inode.snapshot {
            base_inode.set_snapshot("", now);
            write_inode(sys, &base_inode, copies).await?;
            old_vid = params.base_vid;
        }
        write_inode(sys, &child, copies).await?;
        info!(name = %child.name, vid = new_vid, base = params.base_vid, "vdi cloned");
        return Ok(VdiCreated {
            vid: new_vid,
            nr_copies: copies,
            old_vid,
        });
    }

    match lookup(sys, &params.name, None, 0).await {
        Ok(_) => return Err(ResultCode::VdiExist),
        Err(ResultCode::NoVdi) => {}
        Err(e) => return Err(e),
    }

    let probe = name_to_vid_probe(&params.name);
    let vid = sys.vdi.find_free(probe).ok_or(ResultCode::NoVdi)?;
    let inode = Inode::new(&params.name, params.size, vid, copies, now)?;
    write_inode(sys, &inode, copies).await?;
    info!(name = %params.name, vid, copies, "vdi created");
    Ok(VdiCreated {
        vid,
        nr_copies: copies,
        old_vid: 0,
    })
}

/// Inode objects are always replaced wholesale: their encoding can
/// shrink, and an offset write would leave stale trailing bytes behind.
async fn write_inode(sys: &System, inode: &Inode, copies: u32) -> Result<(), ResultCode> {
    let bytes = inode.to_bytes()?;
    gateway::write_object(sys, vid_to_vdi_oid(inode.vdi_id), 0, &bytes, 0, copies, true).await
}

/// Install the main-phase effects of a successful create on this node.
pub fn post_create(sys: &System, created: &VdiCreated) {
    sys.vdi.set(created.vid);
    sys.vdi.add_state(created.vid, created.nr_copies, false);
    if created.old_vid != 0 {
        let copies = sys.vdi.copy_count(created.old_vid, created.nr_copies);
        sys.vdi.add_state(created.old_vid, copies, true);
    }
    debug!(vid = created.vid, "vdi registered");
}

/// Delete a vdi: zero its name and drop the data objects it owns
/// (the work phase of `DelVdi`).
pub async fn delete(sys: &System, name: &str, tag: Option<&str>, snapid: u32) -> Result<u32, ResultCode> {
    let found = lookup(sys, name, tag, snapid).await?;
    let copies = sys.vdi.copy_count(found.vid, sys.nr_copies());

    let mut dead = found.inode.clone();
    dead.name = String::new();
    write_inode(sys, &dead, copies).await?;

    for (idx, &slot_vid) in found.inode.data_vdi_id.iter().enumerate() {
        if slot_vid != found.vid {
            continue; // shared with a snapshot ancestor
        }
        let oid = vid_to_data_oid(found.vid, idx as u32);
        if let Err(e) = gateway::remove_object(sys, oid, copies).await {
            if e != ResultCode::NoObj {
                warn!(oid = format_args!("{oid:x}"), %e, "failed to remove data object");
            }
        }
    }
    info!(name, vid = found.vid, "vdi deleted");
    Ok(found.vid)
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Locate (or create) a vdi attribute object. Returns
/// `(hashed_vid, attr_id)`.
pub async fn vdi_attr(
    sys: &System,
    payload: &herd_core::proto::VdiAttrPayload,
    create: bool,
    excl: bool,
    del: bool,
) -> Result<(u32, u32), ResultCode> {
    // The current vid can change under snapshots, so attribute objects
    // are indexed by the name hash alone.
    let hashed_vid = name_to_vid_probe(&payload.name);
    let base = (fnv1a_64(payload.key.as_bytes()) & u64::from(MAX_ATTR_PROBES - 1)) as u32;

    for i in 0..MAX_ATTR_PROBES {
        let attr_id = base.wrapping_add(i) & (MAX_ATTR_PROBES - 1);
        let oid = vid_to_attr_oid(hashed_vid, attr_id);
        match gateway::read_object(sys, oid, oid::SD_DATA_OBJ_SIZE as u32, 0).await {
            Ok(bytes) => {
                let stored: herd_core::proto::VdiAttrPayload =
                    herd_core::proto::decode(&bytes)?;
                if stored.key != payload.key {
                    continue; // probe collision, keep walking
                }
                if excl {
                    return Err(ResultCode::VdiExist);
                }
                if del {
                    gateway::remove_object(sys, oid, sys.nr_copies()).await?;
                }
                return Ok((hashed_vid, attr_id));
            }
            Err(ResultCode::NoObj) if create => {
                let bytes = herd_core::proto::encode(payload)?;
                gateway::write_object(sys, oid, 0, &bytes, 0, sys.nr_copies(), true).await?;
                return Ok((hashed_vid, attr_id));
            }
            Err(ResultCode::NoObj) => return Err(ResultCode::NoObj),
            Err(e) => return Err(e),
        }
    }
    Err(ResultCode::NoObj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_set_and_test() {
        let table = VdiTable::new();
        assert!(!table.test(7));
        table.set(7);
        assert!(table.test(7));

        // Setting twice leaves exactly one bit.
        table.set(7);
        let words = table.bitmap();
        assert_eq!(words.iter().map(|w| w.count_ones()).sum::<u32>(), 1);
    }

    #[test]
    fn find_free_walks_probe_chain() {
        let table = VdiTable::new();
        table.set(10);
        table.set(11);
        assert_eq!(table.find_free(10), Some(12));
        assert_eq!(table.find_free(9), Some(9));
    }

    #[test]
    fn find_free_wraps_at_namespace_end() {
        let table = VdiTable::new();
        table.set(SD_NR_VDIS - 1);
        assert_eq!(table.find_free(SD_NR_VDIS - 1), Some(0));
    }

    #[test]
    fn state_table_round_trip() {
        let table = VdiTable::new();
        table.add_state(5, 3, false);
        assert_eq!(table.copy_count(5, 1), 3);
        assert_eq!(table.copy_count(6, 1), 1);

        table.add_state(5, 3, true);
        assert!(table.state(5).unwrap().snapshot);

        table.remove_state(5);
        assert!(table.state(5).is_none());
    }

    #[test]
    fn bitmap_load_rejects_malformed() {
        let table = VdiTable::new();
        table.set(1);
        table.load_bitmap(vec![0; 3]);
        assert!(table.test(1), "malformed load must not clobber the bitmap");

        table.load_bitmap(vec![0; BITMAP_WORDS]);
        assert!(!table.test(1));
    }

    #[test]
    fn name_probe_is_deterministic() {
        assert_eq!(name_to_vid_probe("disk0"), name_to_vid_probe("disk0"));
        assert_ne!(name_to_vid_probe("disk0"), name_to_vid_probe("disk1"));
        assert!(name_to_vid_probe("disk0") < SD_NR_VDIS);
    }
}
