//! VDI inode model.
//!
//! An inode is the root object of a vdi: a fixed set of header fields plus
//! a table mapping each logical 4 MiB slot to the vid whose data object
//! backs it (copy-on-write chains share slots with ancestors). Inodes are
//! created by the cluster-serialized `NewVdi` operation and become
//! read-only once marked as snapshots.

use serde::{Deserialize, Serialize};

use crate::oid::{SD_DATA_OBJ_SIZE, SD_MAX_DATA_OBJS, SD_MAX_VDI_LEN, SD_MAX_VDI_TAG_LEN};
use crate::proto::ResultCode;

/// A vdi inode: header plus the per-slot backing-vid table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Vdi name; empty once the vdi has been deleted.
    pub name: String,
    /// Snapshot tag; empty for the working vdi.
    pub tag: String,
    pub create_time: u64,
    pub snap_ctime: u64,
    pub vdi_size: u64,
    pub vdi_id: u32,
    /// Previous vid in the snapshot chain; 0 at the chain head.
    pub parent_vdi_id: u32,
    pub snap_id: u32,
    pub nr_copies: u32,
    /// Read-only marker; set when a snapshot supersedes this vid.
    pub snapshot: bool,
    /// Slot table: `data_vdi_id[idx]` is the vid backing data object
    /// `idx`, or 0 for an unallocated slot.
    pub data_vdi_id: Vec<u32>,
}

impl Inode {
    /// A fresh working inode for a new vdi.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParms` when the name or size is out of range.
    pub fn new(
        name: &str,
        size: u64,
        vid: u32,
        nr_copies: u32,
        create_time: u64,
    ) -> Result<Self, ResultCode> {
        if name.is_empty() || name.len() > SD_MAX_VDI_LEN {
            return Err(ResultCode::InvalidParms);
        }
        let nr_objs = size.div_ceil(SD_DATA_OBJ_SIZE);
        if nr_objs > u64::from(SD_MAX_DATA_OBJS) {
            return Err(ResultCode::InvalidParms);
        }
        Ok(Self {
            name: name.to_string(),
            tag: String::new(),
            create_time,
            snap_ctime: 0,
            vdi_size: size,
            vdi_id: vid,
            parent_vdi_id: 0,
            snap_id: 0,
            nr_copies,
            snapshot: false,
            data_vdi_id: vec![0; nr_objs as usize],
        })
    }

    /// Number of data-object slots.
    #[must_use]
    pub fn nr_objs(&self) -> usize {
        self.data_vdi_id.len()
    }

    /// Whether this vdi has been deleted (name zeroed).
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.name.is_empty()
    }

    /// Mark this inode as a read-only snapshot taken at `ctime` with the
    /// given tag.
    pub fn set_snapshot(&mut self, tag: &str, ctime: u64) {
        self.snapshot = true;
        self.snap_ctime = ctime;
        self.tag = tag.chars().take(SD_MAX_VDI_TAG_LEN).collect();
    }

    /// Derive the working child of this inode in a snapshot chain: a new
    /// vid sharing all allocated slots with the parent.
    #[must_use]
    pub fn derive_child(&self, new_vid: u32, ctime: u64) -> Self {
        let mut child = self.clone();
        child.vdi_id = new_vid;
        child.parent_vdi_id = self.vdi_id;
        child.snap_id = self.snap_id + 1;
        child.snapshot = false;
        child.snap_ctime = 0;
        child.tag = String::new();
        child.create_time = ctime;
        child
    }

    /// Encode for storage as the vdi's inode object.
    ///
    /// # Errors
    ///
    /// Returns `SystemError` on encoding failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ResultCode> {
        crate::proto::encode(self)
    }

    /// Decode an inode object.
    ///
    /// # Errors
    ///
    /// Returns `NoVdi` when the bytes do not decode as an inode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ResultCode> {
        rmp_serde::from_slice(bytes).map_err(|_| ResultCode::NoVdi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_inode_sizes_slot_table() {
        let inode = Inode::new("disk0", 10 * SD_DATA_OBJ_SIZE + 1, 7, 3, 1).unwrap();
        assert_eq!(inode.nr_objs(), 11);
        assert!(inode.data_vdi_id.iter().all(|&v| v == 0));
        assert!(!inode.snapshot);
    }

    #[test]
    fn rejects_bad_names_and_sizes() {
        assert_eq!(
            Inode::new("", 1, 1, 3, 0).unwrap_err(),
            ResultCode::InvalidParms
        );
        let long = "x".repeat(SD_MAX_VDI_LEN + 1);
        assert_eq!(
            Inode::new(&long, 1, 1, 3, 0).unwrap_err(),
            ResultCode::InvalidParms
        );
        let too_big = (u64::from(SD_MAX_DATA_OBJS) + 1) * SD_DATA_OBJ_SIZE;
        assert_eq!(
            Inode::new("big", too_big, 1, 3, 0).unwrap_err(),
            ResultCode::InvalidParms
        );
    }

    #[test]
    fn snapshot_chain_links_parent() {
        let mut parent = Inode::new("disk0", 4 * SD_DATA_OBJ_SIZE, 7, 3, 1).unwrap();
        parent.data_vdi_id[0] = 7;

        let child = parent.derive_child(8, 2);
        parent.set_snapshot("v1", 2);

        assert!(parent.snapshot);
        assert_eq!(parent.tag, "v1");
        assert_eq!(child.parent_vdi_id, 7);
        assert_eq!(child.vdi_id, 8);
        assert_eq!(child.snap_id, 1);
        assert!(!child.snapshot);
        // Slots are shared until the child's first write.
        assert_eq!(child.data_vdi_id[0], 7);
    }

    #[test]
    fn bytes_round_trip() {
        let inode = Inode::new("disk0", SD_DATA_OBJ_SIZE, 3, 2, 99).unwrap();
        let bytes = inode.to_bytes().unwrap();
        let back = Inode::from_bytes(&bytes).unwrap();
        assert_eq!(inode, back);
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert_eq!(
            Inode::from_bytes(&[1, 2, 3]).unwrap_err(),
            ResultCode::NoVdi
        );
    }
}
