//! Content-addressed blob files with xattr refcounts.
//!
//! A blob's name is the SHA-1 over its canonical form: the zero-trimmed
//! window prefixed by the window's offset and length. Two buffers with the
//! same logical content therefore hash identically regardless of sparse
//! padding. Blobs live at `<objdir>/<hex[0..2]>/<hex[2..]>` with a 32-bit
//! refcount in the `user.farm.count` extended attribute; a blob file
//! exists iff its refcount is at least 1.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use herd_core::proto::Sha1Digest;
use herd_core::trim::trim_zero_sectors;
use sha1::{Digest, Sha1};
use tracing::debug;

/// Extended attribute holding the blob refcount.
pub const COUNT_XATTR: &str = "user.farm.count";

/// Canonical content hash: `sha1(offset || length || trimmed-bytes)`.
#[must_use]
pub fn content_sha1(data: &[u8]) -> Sha1Digest {
    let (offset, window) = trim_zero_sectors(data);
    let mut h = Sha1::new();
    h.update(offset.to_le_bytes());
    h.update((window.len() as u32).to_le_bytes());
    h.update(window);
    h.finalize().into()
}

// ---------------------------------------------------------------------------
// Sha1Store
// ---------------------------------------------------------------------------

/// A directory of content-addressed blobs.
#[derive(Debug, Clone)]
pub struct Sha1Store {
    objdir: PathBuf,
}

impl Sha1Store {
    #[must_use]
    pub fn new(objdir: &Path) -> Self {
        Self {
            objdir: objdir.to_path_buf(),
        }
    }

    /// Create the object directory and its 256 fan-out subdirectories.
    pub fn init(&self) -> anyhow::Result<()> {
        for i in 0..256 {
            fs::create_dir_all(self.objdir.join(format!("{i:02x}")))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn path_for(&self, sha1: &Sha1Digest) -> PathBuf {
        let hex = hex::encode(sha1);
        self.objdir.join(&hex[..2]).join(&hex[2..])
    }

    #[must_use]
    pub fn exists(&self, sha1: &Sha1Digest) -> bool {
        self.path_for(sha1).exists()
    }

    /// Current refcount, or `None` when the blob is absent.
    #[must_use]
    pub fn refcount(&self, sha1: &Sha1Digest) -> Option<u32> {
        read_count(&self.path_for(sha1)).ok()
    }

    /// Store `data`, returning its content hash.
    ///
    /// First create sets the refcount to 1; writing content that already
    /// exists increments it instead.
    pub fn write(&self, data: &[u8]) -> anyhow::Result<Sha1Digest> {
        let sha1 = content_sha1(data);
        let path = self.path_for(&sha1);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                f.write_all(data)
                    .with_context(|| format!("write blob {}", hex::encode(sha1)))?;
                f.sync_all()?;
                write_count(&path, 1)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let count = read_count(&path)?;
                write_count(&path, count + 1)?;
                debug!(sha1 = %hex::encode(sha1), count = count + 1, "blob ref");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("create blob {}", hex::encode(sha1)))
            }
        }
        Ok(sha1)
    }

    /// Read and verify a blob.
    pub fn read(&self, sha1: &Sha1Digest) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(sha1);
        let buf =
            fs::read(&path).with_context(|| format!("read blob {}", hex::encode(sha1)))?;
        let actual = content_sha1(&buf);
        if &actual != sha1 {
            bail!(
                "blob corrupt: expected {}, content hashes to {}",
                hex::encode(sha1),
                hex::encode(actual)
            );
        }
        Ok(buf)
    }

    /// Drop one reference; the blob file is unlinked exactly when the
    /// count reaches zero. Deleting an absent blob is a caller error and
    /// surfaces.
    pub fn try_delete(&self, sha1: &Sha1Digest) -> anyhow::Result<()> {
        let path = self.path_for(sha1);
        let count = read_count(&path)
            .with_context(|| format!("deref missing blob {}", hex::encode(sha1)))?;
        if count <= 1 {
            fs::remove_file(&path)?;
        } else {
            write_count(&path, count - 1)?;
        }
        Ok(())
    }
}

fn read_count(path: &Path) -> anyhow::Result<u32> {
    let raw = xattr::get(path, COUNT_XATTR)?;
    match raw {
        Some(bytes) if bytes.len() == 4 => {
            Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        Some(_) => bail!("malformed {COUNT_XATTR} on {}", path.display()),
        None => bail!("missing {COUNT_XATTR} on {}", path.display()),
    }
}

fn write_count(path: &Path, count: u32) -> anyhow::Result<()> {
    xattr::set(path, COUNT_XATTR, &count.to_le_bytes())?;
    Ok(())
}

/// Parse a 40-character hex digest.
pub fn parse_sha1_hex(hex_str: &str) -> anyhow::Result<Sha1Digest> {
    let bytes = hex::decode(hex_str)?;
    Sha1Digest::try_from(bytes.as_slice()).map_err(|_| anyhow::anyhow!("digest length != 20"))
}

#[cfg(test)]
mod tests {
    use herd_core::trim::SECTOR_SIZE;

    use super::*;

    fn store() -> (tempfile::TempDir, Sha1Store) {
        let dir = tempfile::tempdir().unwrap();
        let s = Sha1Store::new(&dir.path().join("objects"));
        s.init().unwrap();
        (dir, s)
    }

    #[test]
    fn hash_is_sparse_invariant() {
        let mib = 1 << 20;
        let mut sparse = vec![0u8; 4 * mib];
        sparse[mib..].fill(0x5a);

        // Hash of the full buffer equals the hash computed over the
        // canonical (offset, window) form directly.
        let direct = {
            let mut h = Sha1::new();
            h.update((mib as u64).to_le_bytes());
            h.update(((3 * mib) as u32).to_le_bytes());
            h.update(&sparse[mib..]);
            let d: Sha1Digest = h.finalize().into();
            d
        };
        assert_eq!(content_sha1(&sparse), direct);
    }

    #[test]
    fn hash_determinism_across_padding() {
        let payload = vec![0x5au8; SECTOR_SIZE];
        let mut padded = vec![0u8; 2 * SECTOR_SIZE];
        padded.extend_from_slice(&payload);
        padded.extend_from_slice(&[0u8; 4 * SECTOR_SIZE]);

        let mut same_window = vec![0u8; 2 * SECTOR_SIZE];
        same_window.extend_from_slice(&payload);

        assert_eq!(content_sha1(&padded), content_sha1(&same_window));
        assert_ne!(content_sha1(&padded), content_sha1(&payload));
    }

    #[test]
    fn write_read_round_trip() {
        let (_d, s) = store();
        let sha1 = s.write(b"hello farm").unwrap();
        assert!(s.exists(&sha1));
        assert_eq!(s.read(&sha1).unwrap(), b"hello farm");
    }

    #[test]
    fn refcount_accounting() {
        let (_d, s) = store();
        let sha1 = s.write(b"blob").unwrap();
        assert_eq!(s.refcount(&sha1), Some(1));

        // Same content again: increment, no second file.
        let again = s.write(b"blob").unwrap();
        assert_eq!(again, sha1);
        assert_eq!(s.refcount(&sha1), Some(2));

        s.try_delete(&sha1).unwrap();
        assert_eq!(s.refcount(&sha1), Some(1));
        assert!(s.exists(&sha1));

        s.try_delete(&sha1).unwrap();
        assert!(!s.exists(&sha1));

        // Net count is zero: deleting again is a caller error.
        assert!(s.try_delete(&sha1).is_err());
    }

    #[test]
    fn refcount_sequence_matches_net_count() {
        let (_d, s) = store();
        let data = b"sequence";
        let mut net = 0i32;
        let mut sha1 = None;
        for op in [1, 1, 1, -1, 1, -1, -1] {
            if op > 0 {
                sha1 = Some(s.write(data).unwrap());
                net += 1;
            } else {
                s.try_delete(&sha1.unwrap()).unwrap();
                net -= 1;
            }
            let d = sha1.unwrap();
            if net > 0 {
                assert!(s.exists(&d));
                assert_eq!(s.refcount(&d), Some(net as u32));
            } else {
                assert!(!s.exists(&d));
            }
        }
    }

    #[test]
    fn read_detects_corruption() {
        let (_d, s) = store();
        let sha1 = s.write(b"pristine").unwrap();
        std::fs::write(s.path_for(&sha1), b"tampered").unwrap();
        assert!(s.read(&sha1).is_err());
    }

    #[test]
    fn hex_digest_parsing() {
        let digest = content_sha1(b"x");
        let parsed = parse_sha1_hex(&hex::encode(digest)).unwrap();
        assert_eq!(parsed, digest);
        assert!(parse_sha1_hex("zz").is_err());
    }
}
