//! The operation table: every opcode's class, force flag, and phases.
//!
//! Four classes exist. Cluster ops run their work phase on the
//! originating node, broadcast the result, and run their main phase on
//! every node in total order. Local ops run both phases on the
//! originating node. Gateway ops replicate to peers; peer ops hit the
//! local backend. Non-force ops are refused unless the cluster status is
//! OK.

pub mod cluster_ops;
pub mod local_ops;

use herd_core::proto::{Opcode, ResultCode, RspDetail, SdReq, SdRsp};

use crate::system::System;

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Cluster,
    Local,
    Gateway,
    Peer,
}

/// Static per-opcode attributes.
#[derive(Debug, Clone, Copy)]
pub struct OpAttrs {
    pub kind: OpKind,
    /// May run even when the cluster status is not OK.
    pub force: bool,
    pub has_work: bool,
    pub has_main: bool,
}

const fn attrs(kind: OpKind, force: bool, has_work: bool, has_main: bool) -> OpAttrs {
    OpAttrs {
        kind,
        force,
        has_work,
        has_main,
    }
}

/// The opcode attribute table.
#[must_use]
pub fn op_attrs(op: Opcode) -> OpAttrs {
    use OpKind::{Cluster, Gateway, Local, Peer};
    match op {
        // cluster operations
        Opcode::NewVdi => attrs(Cluster, false, true, true),
        Opcode::DelVdi => attrs(Cluster, false, true, true),
        Opcode::GetVdiInfo => attrs(Cluster, false, true, false),
        Opcode::GetVdiAttr => attrs(Cluster, false, true, false),
        Opcode::MakeFs => attrs(Cluster, true, false, true),
        Opcode::Shutdown => attrs(Cluster, true, false, true),
        Opcode::ForceRecover => attrs(Cluster, true, true, true),
        Opcode::NotifyVdiAdd => attrs(Cluster, true, false, true),
        Opcode::NotifyVdiDel => attrs(Cluster, true, false, true),
        Opcode::CompleteRecovery => attrs(Cluster, true, false, true),
        Opcode::EnableRecover => attrs(Cluster, false, false, true),
        Opcode::DisableRecover => attrs(Cluster, false, false, true),

        // local operations
        Opcode::GetNodeList => attrs(Local, true, false, true),
        Opcode::StatCluster => attrs(Local, true, true, false),
        Opcode::StatSheep => attrs(Local, false, true, false),
        Opcode::StatRecovery => attrs(Local, false, false, true),
        Opcode::ReadVdis => attrs(Local, true, false, true),
        Opcode::GetVdiCopies => attrs(Local, true, false, true),
        Opcode::GetEpoch => attrs(Local, false, true, false),
        Opcode::GetObjList => attrs(Local, false, true, false),
        Opcode::GetHash => attrs(Local, false, true, false),
        Opcode::GetStoreList => attrs(Local, true, true, false),
        Opcode::DiscardObj => attrs(Local, false, true, false),

        // gateway I/O operations
        Opcode::ReadObj
        | Opcode::WriteObj
        | Opcode::CreateAndWriteObj
        | Opcode::RemoveObj => attrs(Gateway, false, true, false),

        // peer I/O operations
        Opcode::ReadPeer
        | Opcode::WritePeer
        | Opcode::CreateAndWritePeer
        | Opcode::RemovePeer => attrs(Peer, false, true, false),
    }
}

// ---------------------------------------------------------------------------
// OpReply
// ---------------------------------------------------------------------------

/// The outcome of one phase of an operation.
#[derive(Debug, Clone)]
pub struct OpReply {
    pub result: ResultCode,
    pub detail: RspDetail,
    pub data: Vec<u8>,
}

impl OpReply {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            result: ResultCode::Success,
            detail: RspDetail::None,
            data: Vec::new(),
        }
    }

    #[must_use]
    pub fn err(result: ResultCode) -> Self {
        Self {
            result,
            detail: RspDetail::None,
            data: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: RspDetail) -> Self {
        self.detail = detail;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Render as a wire response to `req`.
    #[must_use]
    pub fn into_rsp(self, req: &SdReq, epoch: u32) -> (SdRsp, Vec<u8>) {
        let mut rsp = SdRsp::for_req(req, self.result);
        rsp.epoch = epoch;
        rsp.detail = self.detail;
        rsp.data_length = self.data.len() as u32;
        (rsp, self.data)
    }
}

impl From<Result<OpReply, ResultCode>> for OpReply {
    fn from(r: Result<OpReply, ResultCode>) -> Self {
        r.unwrap_or_else(OpReply::err)
    }
}

// ---------------------------------------------------------------------------
// Phase dispatch
// ---------------------------------------------------------------------------

/// Run the work phase of a cluster or local op.
pub async fn process_work(sys: &std::sync::Arc<System>, req: &SdReq, data: &[u8]) -> OpReply {
    match req.opcode {
        Opcode::NewVdi => cluster_ops::new_vdi(sys, req, data).await,
        Opcode::DelVdi => cluster_ops::del_vdi(sys, req, data).await,
        Opcode::GetVdiInfo => cluster_ops::get_vdi_info(sys, req, data).await,
        Opcode::GetVdiAttr => cluster_ops::get_vdi_attr(sys, req, data).await,
        Opcode::ForceRecover => cluster_ops::force_recover_work(sys),

        Opcode::StatCluster => local_ops::stat_cluster(sys).await,
        Opcode::StatSheep => local_ops::stat_sheep(sys).await,
        Opcode::GetEpoch => local_ops::get_epoch(sys, req),
        Opcode::GetObjList => local_ops::get_obj_list(sys),
        Opcode::GetHash => local_ops::get_hash(sys, req).await,
        Opcode::GetStoreList => local_ops::get_store_list(),
        Opcode::DiscardObj => local_ops::discard_obj(sys, req).await,

        _ => OpReply::err(ResultCode::NoSupport),
    }
}

/// Run the main phase. For cluster ops this executes on every node with
/// the broadcast work result; for local ops on the originator only.
pub async fn process_main(
    sys: &std::sync::Arc<System>,
    req: &SdReq,
    work: OpReply,
) -> OpReply {
    match req.opcode {
        Opcode::NewVdi => cluster_ops::post_new_vdi(sys, work),
        Opcode::DelVdi => cluster_ops::post_del_vdi(sys, work),
        Opcode::MakeFs => cluster_ops::make_fs(sys, req, work).await,
        Opcode::Shutdown => cluster_ops::shutdown(sys, work),
        Opcode::ForceRecover => cluster_ops::force_recover_main(sys, work),
        Opcode::NotifyVdiAdd => cluster_ops::notify_vdi_add(sys, req, work),
        Opcode::NotifyVdiDel => cluster_ops::notify_vdi_del(sys, work),
        Opcode::CompleteRecovery => cluster_ops::complete_recovery(sys, req, work),
        Opcode::EnableRecover => cluster_ops::enable_recover(sys, work),
        Opcode::DisableRecover => cluster_ops::disable_recover(sys, work),

        Opcode::GetNodeList => local_ops::get_node_list(sys),
        Opcode::StatRecovery => local_ops::stat_recovery(sys),
        Opcode::ReadVdis => local_ops::read_vdis(sys),
        Opcode::GetVdiCopies => local_ops::get_vdi_copies(sys),

        _ => work,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_ops_are_classified_cluster() {
        for op in [
            Opcode::NewVdi,
            Opcode::DelVdi,
            Opcode::MakeFs,
            Opcode::Shutdown,
            Opcode::NotifyVdiAdd,
        ] {
            assert_eq!(op_attrs(op).kind, OpKind::Cluster, "{op:?}");
        }
    }

    #[test]
    fn gateway_ops_map_to_peer_ops() {
        for op in [
            Opcode::ReadObj,
            Opcode::WriteObj,
            Opcode::CreateAndWriteObj,
            Opcode::RemoveObj,
        ] {
            assert_eq!(op_attrs(op).kind, OpKind::Gateway);
            let peer = op.to_peer().unwrap();
            assert_eq!(op_attrs(peer).kind, OpKind::Peer);
        }
    }

    #[test]
    fn force_ops_include_format_and_shutdown() {
        assert!(op_attrs(Opcode::MakeFs).force);
        assert!(op_attrs(Opcode::Shutdown).force);
        assert!(op_attrs(Opcode::StatCluster).force);
        assert!(!op_attrs(Opcode::NewVdi).force);
        assert!(!op_attrs(Opcode::WriteObj).force);
    }

    #[test]
    fn reply_renders_to_response() {
        let req = SdReq::new(Opcode::GetObjList);
        let (rsp, body) = OpReply::ok().with_data(vec![1, 2, 3]).into_rsp(&req, 7);
        assert_eq!(rsp.result, ResultCode::Success);
        assert_eq!(rsp.epoch, 7);
        assert_eq!(rsp.data_length, 3);
        assert_eq!(body, vec![1, 2, 3]);
    }
}
