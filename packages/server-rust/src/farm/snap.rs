//! Snap files and the append-only snap-log.
//!
//! A snap file pairs a snapshot index with its trunk hash and is stored
//! as a content-addressed blob. The snap-log at `<farm>/snap` appends one
//! `(index, tag, time, snap-sha1)` record per snapshot; it is the index
//! operators resolve tags against.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use herd_core::proto::Sha1Digest;
use serde::{Deserialize, Serialize};

use super::sha1_file::Sha1Store;

/// A snapshot root: index plus trunk hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapFile {
    pub idx: u32,
    pub trunk_sha1: Sha1Digest,
}

/// One snap-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapLogEntry {
    pub idx: u32,
    pub tag: String,
    pub time_ms: u64,
    pub sha1: Sha1Digest,
}

/// Store a snap file blob, returning its content hash.
pub fn file_write(store: &Sha1Store, idx: u32, trunk_sha1: Sha1Digest) -> anyhow::Result<Sha1Digest> {
    let bytes = rmp_serde::to_vec_named(&SnapFile { idx, trunk_sha1 })?;
    store.write(&bytes)
}

/// Load a snap file blob.
pub fn file_read(store: &Sha1Store, sha1: &Sha1Digest) -> anyhow::Result<SnapFile> {
    let bytes = store.read(sha1)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

// ---------------------------------------------------------------------------
// SnapLog
// ---------------------------------------------------------------------------

/// The `<farm>/snap` append-only log.
#[derive(Debug, Clone)]
pub struct SnapLog {
    path: PathBuf,
}

impl SnapLog {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// All records, oldest first.
    pub fn read_all(&self) -> anyhow::Result<Vec<SnapLogEntry>> {
        let mut raw = Vec::new();
        match std::fs::File::open(&self.path) {
            Ok(mut f) => {
                f.read_to_end(&mut raw)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("open snap log"),
        }

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= raw.len() {
            let len = u32::from_be_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]])
                as usize;
            pos += 4;
            anyhow::ensure!(pos + len <= raw.len(), "truncated snap log record");
            entries.push(rmp_serde::from_slice(&raw[pos..pos + len])?);
            pos += len;
        }
        Ok(entries)
    }

    /// Append one record.
    pub fn append(&self, entry: &SnapLogEntry) -> anyhow::Result<()> {
        let bytes = rmp_serde::to_vec_named(entry)?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(&(bytes.len() as u32).to_be_bytes())?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        Ok(())
    }

    /// Resolve a snapshot by index or tag to its snap-file hash.
    pub fn resolve(&self, idx: Option<u32>, tag: Option<&str>) -> anyhow::Result<Option<SnapLogEntry>> {
        let entries = self.read_all()?;
        Ok(entries.into_iter().find(|e| {
            idx.map_or(false, |i| e.idx == i) || tag.map_or(false, |t| e.tag == t)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_appends_and_reads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapLog::new(&dir.path().join("snap"));
        assert!(log.read_all().unwrap().is_empty());

        for i in 1..=3u32 {
            log.append(&SnapLogEntry {
                idx: i,
                tag: format!("v{i}"),
                time_ms: u64::from(i) * 100,
                sha1: [i as u8; 20],
            })
            .unwrap();
        }

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].tag, "v1");
        assert_eq!(entries[2].idx, 3);
    }

    #[test]
    fn resolve_by_index_and_tag() {
        let dir = tempfile::tempdir().unwrap();
        let log = SnapLog::new(&dir.path().join("snap"));
        log.append(&SnapLogEntry {
            idx: 1,
            tag: "golden".to_string(),
            time_ms: 1,
            sha1: [7; 20],
        })
        .unwrap();

        assert_eq!(log.resolve(Some(1), None).unwrap().unwrap().tag, "golden");
        assert_eq!(log.resolve(None, Some("golden")).unwrap().unwrap().idx, 1);
        assert!(log.resolve(Some(9), None).unwrap().is_none());
        assert!(log.resolve(None, Some("missing")).unwrap().is_none());
    }

    #[test]
    fn snap_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Sha1Store::new(&dir.path().join("objects"));
        store.init().unwrap();

        let sha1 = file_write(&store, 4, [3; 20]).unwrap();
        let snap = file_read(&store, &sha1).unwrap();
        assert_eq!(snap.idx, 4);
        assert_eq!(snap.trunk_sha1, [3; 20]);
    }
}
