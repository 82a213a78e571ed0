//! Cluster client: short-lived connections driving a cluster from the
//! outside (snapshot tooling, admin paths, tests).
//!
//! One connection per request keeps the client stateless; data-plane
//! peers use the sock-pool instead. The client implements the farm's
//! [`ClusterIo`] seam.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use herd_core::inode::Inode;
use herd_core::oid::{oid_to_vid, vid_to_vdi_oid, SD_DATA_OBJ_SIZE, SD_NR_VDIS};
use herd_core::proto::{
    decode, encode, flag, ClusterReq, ObjReq, Opcode, ReqDetail, ResultCode, RspDetail, SdReq,
    SdRsp, Sha1Digest, VdiNamePayload, VdiReq, VdiStateEntry, VdiStateReq,
};
use herd_core::{untrim_zero_sectors, Node, VnodeView};
use tokio::net::TcpStream;
use tracing::debug;

use super::wire;
use crate::farm::ClusterIo;

/// A client of one cluster node.
#[derive(Debug)]
pub struct ClusterClient {
    addr: SocketAddr,
    /// Last epoch observed in a response; stamps follow-up requests.
    epoch: AtomicU32,
}

impl ClusterClient {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            epoch: AtomicU32::new(0),
        }
    }

    /// Execute one request against the configured node.
    pub async fn exec(&self, req: &SdReq, body: &[u8]) -> Result<(SdRsp, Vec<u8>), ResultCode> {
        self.exec_at(self.addr, req, body).await
    }

    /// Execute one request against an explicit node address.
    pub async fn exec_at(
        &self,
        addr: SocketAddr,
        req: &SdReq,
        body: &[u8],
    ) -> Result<(SdRsp, Vec<u8>), ResultCode> {
        let mut req = req.clone();
        req.id = rand::random();
        if req.epoch == 0 {
            req.epoch = self.epoch.load(Ordering::Acquire);
        }
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|_| ResultCode::NetworkError)?;
        let (rsp, data) = wire::exec_req(&mut stream, &req, body)
            .await
            .map_err(|_| ResultCode::NetworkError)?;
        if rsp.epoch != 0 {
            self.epoch.store(rsp.epoch, Ordering::Release);
        }
        Ok((rsp, data))
    }

    async fn exec_expect(&self, req: &SdReq, body: &[u8]) -> Result<(SdRsp, Vec<u8>), ResultCode> {
        let (rsp, data) = self.exec(req, body).await?;
        if rsp.result.is_success() {
            Ok((rsp, data))
        } else {
            Err(rsp.result)
        }
    }

    // -- admin ---------------------------------------------------------------

    /// Format the cluster (`MakeFs`).
    pub async fn make_fs(&self, store: &str, copies: u32) -> Result<(), ResultCode> {
        let mut req = SdReq::new(Opcode::MakeFs);
        req.flags = flag::CMD_WRITE;
        req.detail = ReqDetail::Cluster(ClusterReq {
            copies,
            flags: 0,
            ctime: now_ms(),
        });
        self.exec_expect(&req, store.as_bytes()).await?;
        Ok(())
    }

    /// Ask the cluster to shut down.
    pub async fn shutdown(&self) -> Result<(), ResultCode> {
        let req = SdReq::new(Opcode::Shutdown);
        self.exec_expect(&req, &[]).await?;
        Ok(())
    }

    /// The current member list.
    pub async fn node_list(&self) -> Result<Vec<Node>, ResultCode> {
        let req = SdReq::new(Opcode::GetNodeList);
        let (_, body) = self.exec_expect(&req, &[]).await?;
        decode(&body)
    }

    /// The vdi-inuse bitmap words.
    pub async fn read_vdis(&self) -> Result<Vec<u64>, ResultCode> {
        let req = SdReq::new(Opcode::ReadVdis);
        let (_, body) = self.exec_expect(&req, &[]).await?;
        decode(&body)
    }

    /// Per-vid replication state.
    pub async fn vdi_states(&self) -> Result<Vec<VdiStateEntry>, ResultCode> {
        let req = SdReq::new(Opcode::GetVdiCopies);
        let (_, body) = self.exec_expect(&req, &[]).await?;
        decode(&body)
    }

    /// Look up a vdi by name, returning `(vid, nr_copies)`.
    pub async fn vdi_info(&self, name: &str) -> Result<(u32, u32), ResultCode> {
        let req = SdReq::new(Opcode::GetVdiInfo);
        let body = encode(&VdiNamePayload {
            name: name.to_string(),
            tag: None,
        })?;
        let (rsp, _) = self.exec_expect(&req, &body).await?;
        match rsp.detail {
            RspDetail::Vdi { vdi_id, copies, .. } => Ok((vdi_id, copies)),
            _ => Err(ResultCode::SystemError),
        }
    }

    /// Delete a vdi by name.
    pub async fn delete_vdi(&self, name: &str) -> Result<(), ResultCode> {
        let mut req = SdReq::new(Opcode::DelVdi);
        req.flags = flag::CMD_WRITE;
        let body = encode(&VdiNamePayload {
            name: name.to_string(),
            tag: None,
        })?;
        self.exec_expect(&req, &body).await?;
        Ok(())
    }

    /// Snapshot a vdi (new working vid, old one becomes read-only).
    pub async fn snapshot_vdi(&self, name: &str) -> Result<u32, ResultCode> {
        let mut req = SdReq::new(Opcode::NewVdi);
        req.flags = flag::CMD_WRITE;
        req.detail = ReqDetail::Vdi(VdiReq {
            snapid: 1,
            ..Default::default()
        });
        let body = encode(&VdiNamePayload {
            name: name.to_string(),
            tag: None,
        })?;
        let (rsp, _) = self.exec_expect(&req, &body).await?;
        match rsp.detail {
            RspDetail::Vdi { vdi_id, .. } => Ok(vdi_id),
            _ => Err(ResultCode::SystemError),
        }
    }

    /// Read the inode of every non-deleted vdi.
    pub async fn parse_vdis(&self) -> Result<Vec<Inode>, ResultCode> {
        let bitmap = self.read_vdis().await?;
        let mut inodes = Vec::new();
        for (word_idx, word) in bitmap.iter().enumerate() {
            let mut bits = *word;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                let vid = (word_idx as u32) * 64 + bit;
                if vid >= SD_NR_VDIS {
                    break;
                }
                let oid = vid_to_vdi_oid(vid);
                match self.read_object(oid, SD_DATA_OBJ_SIZE as u32, 0).await {
                    Ok(bytes) => {
                        if let Ok(inode) = Inode::from_bytes(&bytes) {
                            if !inode.is_deleted() {
                                inodes.push(inode);
                            }
                        }
                    }
                    Err(ResultCode::NoObj) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(inodes)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// ClusterIo for the farm
// ---------------------------------------------------------------------------

#[async_trait]
impl ClusterIo for ClusterClient {
    async fn read_object(
        &self,
        oid: u64,
        length: u32,
        offset: u64,
    ) -> Result<Vec<u8>, ResultCode> {
        let mut req = SdReq::new(Opcode::ReadObj);
        req.data_length = length;
        req.detail = ReqDetail::Obj(ObjReq {
            oid,
            offset,
            ..Default::default()
        });
        let (rsp, mut body) = self.exec_expect(&req, &[]).await?;
        // The gateway already expands data objects; keep the defensive
        // expansion for any trimmed window it passes through.
        if let RspDetail::Obj {
            offset: trim_offset,
            ..
        } = rsp.detail
        {
            if trim_offset != 0 {
                let full = body.len() + trim_offset as usize;
                untrim_zero_sectors(&mut body, trim_offset, full);
            }
        }
        Ok(body)
    }

    async fn write_object(
        &self,
        oid: u64,
        data: &[u8],
        offset: u64,
        copies: u32,
        create: bool,
    ) -> Result<(), ResultCode> {
        let mut req = SdReq::new(if create {
            Opcode::CreateAndWriteObj
        } else {
            Opcode::WriteObj
        });
        req.flags = flag::CMD_WRITE;
        req.detail = ReqDetail::Obj(ObjReq {
            oid,
            offset,
            copies,
            ..Default::default()
        });
        self.exec_expect(&req, data).await?;
        Ok(())
    }

    async fn object_sha1(
        &self,
        oid: u64,
        tgt_epoch: u32,
        nr_copies: u32,
    ) -> Result<Sha1Digest, ResultCode> {
        // Ask the replicas directly, in placement order.
        let nodes = self.node_list().await?;
        let view = VnodeView::new(&nodes);
        let mut req = SdReq::new(Opcode::GetHash);
        req.detail = ReqDetail::Obj(ObjReq {
            oid,
            tgt_epoch,
            ..Default::default()
        });

        let copies = view.obj_copy_count(nr_copies as usize);
        for node in view.replicas_for(oid, copies) {
            match self.exec_at(node.nid.primary(), &req, &[]).await {
                Ok((rsp, _)) if rsp.result.is_success() => {
                    if let RspDetail::Hash { digest } = rsp.detail {
                        return Ok(digest);
                    }
                }
                Ok(_) | Err(_) => {
                    debug!(oid = format_args!("{oid:x}"), node = %node, "hash probe failed");
                }
            }
        }
        Err(ResultCode::NoObj)
    }

    async fn notify_vdi_add(&self, vid: u32, nr_copies: u32) -> Result<(), ResultCode> {
        let mut req = SdReq::new(Opcode::NotifyVdiAdd);
        req.detail = ReqDetail::VdiState(VdiStateReq {
            new_vid: vid,
            old_vid: 0,
            copies: nr_copies,
            set_bitmap: true,
        });
        self.exec_expect(&req, &[]).await?;
        Ok(())
    }

    async fn create_vdi(
        &self,
        name: &str,
        size: u64,
        base_vid: u32,
        nr_copies: u32,
    ) -> Result<u32, ResultCode> {
        let mut req = SdReq::new(Opcode::NewVdi);
        req.flags = flag::CMD_WRITE;
        req.detail = ReqDetail::Vdi(VdiReq {
            vdi_size: size,
            base_vid,
            copies: nr_copies,
            snapid: 0,
        });
        let body = encode(&VdiNamePayload {
            name: name.to_string(),
            tag: None,
        })?;
        let (rsp, _) = self.exec_expect(&req, &body).await?;
        match rsp.detail {
            RspDetail::Vdi { vdi_id, .. } => Ok(vdi_id),
            _ => Err(ResultCode::SystemError),
        }
    }

    async fn object_list(&self) -> Result<Vec<(u64, u32)>, ResultCode> {
        let nodes = self.node_list().await?;
        let states = self.vdi_states().await?;
        let copies_of = |vid: u32| {
            states
                .iter()
                .find(|s| s.vid == vid)
                .map_or(0, |s| s.nr_copies)
        };

        let mut all = std::collections::BTreeSet::new();
        for node in &nodes {
            let req = SdReq::new(Opcode::GetObjList);
            let (rsp, body) = self.exec_at(node.nid.primary(), &req, &[]).await?;
            if !rsp.result.is_success() {
                return Err(rsp.result);
            }
            let oids: Vec<u64> = decode(&body)?;
            all.extend(oids);
        }
        Ok(all
            .into_iter()
            .map(|oid| (oid, copies_of(oid_to_vid(oid))))
            .collect())
    }

    fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }
}
