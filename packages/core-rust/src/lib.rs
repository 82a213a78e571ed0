//! herd core -- node identity, object ids, placement, and wire protocol.
//!
//! This crate is the pure foundation layer of the herd object store:
//!
//! - **Node** ([`node`]): node identity and the cluster node record
//! - **Oid** ([`oid`]): 64-bit object-id arithmetic and size constants
//! - **Hash** ([`hash`]): FNV-1a 64, the shared placement contract
//! - **Vnode** ([`vnode`]): consistent-hash ring and replica placement
//! - **Trim** ([`trim`]): zero-run trimming of sparse payloads
//! - **Proto** ([`proto`]): wire headers, opcodes, flags, result codes
//! - **Inode** ([`inode`]): the vdi inode model
//!
//! No I/O happens here; the server crate owns sockets, disks, and the
//! membership drivers.

pub mod hash;
pub mod inode;
pub mod node;
pub mod oid;
pub mod proto;
pub mod trim;
pub mod vnode;

// Node
pub use node::{Node, NodeId, NodeParseError, DEFAULT_VNODES};

// Hash
pub use hash::{fnv1a_64, fnv1a_64_seed};

// Vnode
pub use vnode::VnodeView;

// Trim
pub use trim::{trim_zero_sectors, untrim_zero_sectors, SECTOR_SIZE};

// Proto
pub use proto::{
    ClusterStatus, Opcode, ReqDetail, ResultCode, RspDetail, SdReq, SdRsp, Sha1Digest,
    SD_PROTO_VER,
};

// Inode
pub use inode::Inode;
