//! The farm: a content-addressed snapshot archive for whole-cluster
//! states.
//!
//! Blobs are SHA-1-named files with xattr refcounts ([`sha1_file`]); a
//! trunk ([`trunk`]) lists every live object of one snapshot; the
//! snap-log ([`snap`]) indexes snapshots by index and tag; the archive
//! pipelines ([`archive`]) save and restore snapshots through the
//! cluster's gateway interface.

pub mod archive;
pub mod sha1_file;
pub mod snap;
pub mod trunk;

pub use archive::{ClusterIo, Farm};
pub use sha1_file::{content_sha1, Sha1Store};
pub use snap::{SnapFile, SnapLog, SnapLogEntry};
pub use trunk::TrunkEntry;
