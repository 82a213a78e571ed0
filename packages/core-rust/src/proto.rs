//! Wire protocol: opcodes, flags, result codes, and request/response
//! headers.
//!
//! Every request is a fixed header followed by an optional body. The
//! header is MsgPack-encoded and length-prefixed on the wire; the body is
//! raw bytes whose meaning depends on the opcode. Responses alias the
//! request header shape and add a result code plus a response detail
//! (e.g., the trimmed-read window for object reads).

use serde::{Deserialize, Serialize};

use crate::node::Node;

/// Protocol version; joins with a different version are rejected.
pub const SD_PROTO_VER: u8 = 2;

/// 20-byte SHA-1 digest used for object content hashes.
pub type Sha1Digest = [u8; 20];

// ---------------------------------------------------------------------------
// Command flags
// ---------------------------------------------------------------------------

/// Request flag bits carried in `SdReq::flags`.
pub mod flag {
    /// The request carries data to write.
    pub const CMD_WRITE: u32 = 0x01;
    /// Copy-on-write: `cow_oid` names the base object to copy from.
    pub const CMD_COW: u32 = 0x02;
    /// Bypass any caching layer.
    pub const CMD_DIRECT: u32 = 0x04;
    /// Create the object if it does not exist.
    pub const CMD_CREAT: u32 = 0x08;
    /// Fail instead of overwriting an existing entry.
    pub const CMD_EXCL: u32 = 0x10;
    /// Delete the named entry.
    pub const CMD_DEL: u32 = 0x20;
}

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    // cluster operations
    NewVdi,
    DelVdi,
    GetVdiInfo,
    GetVdiAttr,
    MakeFs,
    Shutdown,
    ForceRecover,
    NotifyVdiAdd,
    NotifyVdiDel,
    CompleteRecovery,
    EnableRecover,
    DisableRecover,

    // local operations
    GetNodeList,
    StatCluster,
    StatSheep,
    StatRecovery,
    ReadVdis,
    GetVdiCopies,
    GetEpoch,
    GetObjList,
    GetHash,
    GetStoreList,
    DiscardObj,

    // gateway I/O operations
    ReadObj,
    WriteObj,
    CreateAndWriteObj,
    RemoveObj,

    // peer I/O operations
    ReadPeer,
    WritePeer,
    CreateAndWritePeer,
    RemovePeer,
}

impl Opcode {
    /// Gateway to peer opcode rewrite; the only opcode translation in
    /// the system.
    #[must_use]
    pub fn to_peer(self) -> Option<Opcode> {
        match self {
            Opcode::ReadObj => Some(Opcode::ReadPeer),
            Opcode::WriteObj => Some(Opcode::WritePeer),
            Opcode::CreateAndWriteObj => Some(Opcode::CreateAndWritePeer),
            Opcode::RemoveObj => Some(Opcode::RemovePeer),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// Wire-level operation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    #[error("success")]
    Success,
    #[error("I/O error")]
    Eio,
    #[error("no such object")]
    NoObj,
    #[error("no such vdi")]
    NoVdi,
    #[error("vdi already exists")]
    VdiExist,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("system error")]
    SystemError,
    #[error("node is in recovery")]
    NodeInRecovery,
    #[error("no such snapshot tag")]
    NoTag,
    #[error("no such store driver")]
    NoStore,
    #[error("cluster needs forced recovery")]
    ForceRecoverError,
    #[error("cluster is shut down")]
    Shutdown,
    #[error("cluster is halted")]
    Halt,
    #[error("cluster waits for format")]
    WaitForFormat,
    #[error("cluster waits for join")]
    WaitForJoin,
    #[error("try again")]
    Again,
    #[error("operation not supported")]
    NoSupport,
    #[error("network error")]
    NetworkError,
    #[error("unknown error")]
    Unknown,
}

impl ResultCode {
    #[must_use]
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

// ---------------------------------------------------------------------------
// Cluster status
// ---------------------------------------------------------------------------

/// Cluster lifecycle status, reported by `StatCluster` and gating
/// non-force operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Fresh cluster; waiting for `MakeFs`.
    WaitForFormat,
    /// Formatted but not all previous members have returned.
    WaitForJoin,
    Ok,
    /// Not enough failure domains to host the configured copy count.
    Halt,
    Shutdown,
    Killed,
}

impl ClusterStatus {
    /// The result code a request receives when refused in this status.
    #[must_use]
    pub fn to_result(self) -> ResultCode {
        match self {
            ClusterStatus::Ok => ResultCode::Success,
            ClusterStatus::WaitForFormat => ResultCode::WaitForFormat,
            ClusterStatus::WaitForJoin => ResultCode::WaitForJoin,
            ClusterStatus::Halt => ResultCode::Halt,
            ClusterStatus::Shutdown | ClusterStatus::Killed => ResultCode::Shutdown,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response headers
// ---------------------------------------------------------------------------

/// Object-addressed request fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjReq {
    pub oid: u64,
    /// Copy-on-write source; 0 when unused.
    pub cow_oid: u64,
    pub offset: u64,
    /// Requested replica count; 0 derives it from the current view.
    pub copies: u32,
    /// Target epoch for hash/epoch-log queries.
    pub tgt_epoch: u32,
}

/// Vdi-addressed request fields; the vdi name (and optional tag) ride in
/// the request body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiReq {
    pub vdi_size: u64,
    pub base_vid: u32,
    pub copies: u32,
    pub snapid: u32,
}

/// Vdi-state propagation fields (`NotifyVdiAdd`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiStateReq {
    pub new_vid: u32,
    pub old_vid: u32,
    pub copies: u32,
    pub set_bitmap: bool,
}

/// Cluster-format fields (`MakeFs`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReq {
    pub copies: u32,
    pub flags: u16,
    pub ctime: u64,
}

/// Opcode-dependent request detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReqDetail {
    None,
    Obj(ObjReq),
    Vdi(VdiReq),
    VdiState(VdiStateReq),
    Cluster(ClusterReq),
}

impl ReqDetail {
    #[must_use]
    pub fn obj(&self) -> ObjReq {
        match self {
            ReqDetail::Obj(o) => *o,
            _ => ObjReq::default(),
        }
    }

    #[must_use]
    pub fn vdi(&self) -> VdiReq {
        match self {
            ReqDetail::Vdi(v) => *v,
            _ => VdiReq::default(),
        }
    }
}

/// Request header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdReq {
    pub proto_ver: u8,
    pub opcode: Opcode,
    pub flags: u32,
    /// The sender's view of the current epoch; stamps every write.
    pub epoch: u32,
    /// Request id, echoed in the response.
    pub id: u64,
    /// Body length in bytes.
    pub data_length: u32,
    pub detail: ReqDetail,
}

impl SdReq {
    /// A fresh request header for `opcode` with empty detail.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            proto_ver: SD_PROTO_VER,
            opcode,
            flags: 0,
            epoch: 0,
            id: 0,
            data_length: 0,
            detail: ReqDetail::None,
        }
    }
}

/// Opcode-dependent response detail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RspDetail {
    None,
    /// Trimmed-read window: the body covers `[offset, offset+len)` of the
    /// object; the rest is zeros. `copies` is the effective replica count.
    Obj { offset: u64, copies: u32 },
    Vdi { vdi_id: u32, attr_id: u32, copies: u32 },
    Node { store_size: u64, store_free: u64 },
    Hash { digest: Sha1Digest },
}

/// Response header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdRsp {
    pub proto_ver: u8,
    pub opcode: Opcode,
    pub result: ResultCode,
    pub epoch: u32,
    pub id: u64,
    pub data_length: u32,
    pub detail: RspDetail,
}

impl SdRsp {
    /// A response header answering `req` with `result` and no body.
    #[must_use]
    pub fn for_req(req: &SdReq, result: ResultCode) -> Self {
        Self {
            proto_ver: SD_PROTO_VER,
            opcode: req.opcode,
            result,
            epoch: req.epoch,
            id: req.id,
            data_length: 0,
            detail: RspDetail::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// Body of vdi-by-name operations (`NewVdi`, `DelVdi`, `GetVdiInfo`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiNamePayload {
    pub name: String,
    pub tag: Option<String>,
}

/// Body of `GetVdiAttr`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiAttrPayload {
    pub name: String,
    pub tag: Option<String>,
    pub key: String,
    pub value: Vec<u8>,
}

/// One committed epoch: the node list plus the commit timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochLog {
    pub nodes: Vec<Node>,
    pub timestamp_ms: u64,
}

/// One `StatCluster` entry, latest epoch first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochLogEntry {
    pub epoch: u32,
    pub ctime: u64,
    pub nodes: Vec<Node>,
    pub timestamp_ms: u64,
    pub disable_recovery: bool,
}

/// Per-vdi replication state, exchanged at join and via `NotifyVdiAdd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiStateEntry {
    pub vid: u32,
    pub nr_copies: u32,
    pub snapshot: bool,
}

/// One object-list entry reported by `GetObjList`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjListEntry {
    pub oid: u64,
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// MsgPack-encode a payload.
///
/// # Errors
///
/// Returns `SystemError` when the value cannot be encoded (should not
/// happen for the types defined here).
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ResultCode> {
    rmp_serde::to_vec_named(value).map_err(|_| ResultCode::SystemError)
}

/// MsgPack-decode a payload; malformed input is an invalid-argument
/// protocol error.
///
/// # Errors
///
/// Returns `InvalidParms` when the bytes do not decode as `T`.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ResultCode> {
    rmp_serde::from_slice(bytes).map_err(|_| ResultCode::InvalidParms)
}
