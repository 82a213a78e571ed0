//! Trunk files: the per-snapshot manifest of live objects.
//!
//! A trunk is an array of `(oid, nr_copies, sha1)` entries, itself stored
//! as a content-addressed blob; restoring a snapshot walks this list.

use herd_core::proto::Sha1Digest;
use serde::{Deserialize, Serialize};

use super::sha1_file::Sha1Store;

/// One live object at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrunkEntry {
    pub oid: u64,
    pub nr_copies: u32,
    pub sha1: Sha1Digest,
}

/// Store a trunk as a blob, returning its content hash.
pub fn write(store: &Sha1Store, entries: &[TrunkEntry]) -> anyhow::Result<Sha1Digest> {
    let bytes = rmp_serde::to_vec_named(&entries.to_vec())?;
    store.write(&bytes)
}

/// Load a trunk blob.
pub fn read(store: &Sha1Store, sha1: &Sha1Digest) -> anyhow::Result<Vec<TrunkEntry>> {
    let bytes = store.read(sha1)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trunk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Sha1Store::new(&dir.path().join("objects"));
        store.init().unwrap();

        let entries = vec![
            TrunkEntry {
                oid: 0x0080_0000_0000_0001,
                nr_copies: 3,
                sha1: [1; 20],
            },
            TrunkEntry {
                oid: 42,
                nr_copies: 2,
                sha1: [2; 20],
            },
        ];
        let sha1 = write(&store, &entries).unwrap();
        assert_eq!(read(&store, &sha1).unwrap(), entries);
    }

    #[test]
    fn identical_trunks_share_one_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = Sha1Store::new(&dir.path().join("objects"));
        store.init().unwrap();

        let entries = vec![TrunkEntry {
            oid: 1,
            nr_copies: 1,
            sha1: [9; 20],
        }];
        let a = write(&store, &entries).unwrap();
        let b = write(&store, &entries).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.refcount(&a), Some(2));
    }
}
