//! Backend object stores.
//!
//! A store driver persists object bytes on one node. Drivers are
//! synchronous (callers hop through `spawn_blocking`); `create_and_write`
//! must be atomic so concurrent peers racing on one oid serialize at the
//! store. Drivers are registered in a static table and selected by name
//! at format time.

mod plain;

pub use plain::PlainStore;

use std::path::Path;
use std::sync::Arc;

use herd_core::proto::{ResultCode, Sha1Digest};

// ---------------------------------------------------------------------------
// StoreDriver
// ---------------------------------------------------------------------------

/// Operations every backend store implements.
pub trait StoreDriver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Prepare on-disk layout; idempotent.
    fn init(&self) -> Result<(), ResultCode>;

    /// Destroy all stored objects (cluster format).
    fn format(&self) -> Result<(), ResultCode>;

    fn exist(&self, oid: u64) -> bool;

    /// Atomically create `oid` with `data` at `offset`. An existing
    /// object is replaced wholesale; readers never observe a partial
    /// write because the content lands under a temporary name first.
    fn create_and_write(&self, oid: u64, data: &[u8], offset: u64) -> Result<(), ResultCode>;

    /// Overwrite part of an existing object.
    fn write(&self, oid: u64, data: &[u8], offset: u64) -> Result<(), ResultCode>;

    /// Read up to `length` bytes at `offset`. Data objects read as their
    /// full sparse size (missing tails are zeros); variable-length
    /// objects return only the bytes present.
    fn read(&self, oid: u64, length: u32, offset: u64) -> Result<Vec<u8>, ResultCode>;

    fn remove(&self, oid: u64) -> Result<(), ResultCode>;

    /// Content hash of the stored object, computed exactly the way the
    /// snapshot archive hashes blobs. `tgt_epoch` selects a historic
    /// version for stores with epoch-versioned layouts.
    fn get_hash(&self, oid: u64, tgt_epoch: u32) -> Result<Sha1Digest, ResultCode>;

    /// All oids currently present.
    fn list(&self) -> Result<Vec<u64>, ResultCode>;

    /// (total size, used bytes).
    fn stat(&self) -> Result<(u64, u64), ResultCode>;

    /// Drop stale data left behind by finished recoveries.
    fn cleanup(&self) -> Result<(), ResultCode> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Driver registry
// ---------------------------------------------------------------------------

/// Names of the available store drivers, in preference order.
pub const STORE_DRIVERS: &[&str] = &["plain"];

/// Instantiate a store driver by name, rooted at `obj_dir`.
///
/// # Errors
///
/// Returns `NoStore` for an unknown driver name.
pub fn create_store(name: &str, obj_dir: &Path) -> Result<Arc<dyn StoreDriver>, ResultCode> {
    match name {
        "plain" => Ok(Arc::new(PlainStore::new(obj_dir))),
        _ => Err(ResultCode::NoStore),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_plain() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_store("plain", dir.path()).unwrap();
        assert_eq!(store.name(), "plain");
    }

    #[test]
    fn registry_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            create_store("exotic", dir.path()).unwrap_err(),
            ResultCode::NoStore
        );
    }
}
