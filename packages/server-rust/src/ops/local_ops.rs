//! Local operation handlers: status, epoch, and object enumeration.

use std::sync::Arc;

use herd_core::inode::Inode;
use herd_core::oid::{data_oid_to_idx, oid_to_vid, vid_to_vdi_oid, SD_DATA_OBJ_SIZE};
use herd_core::proto::{encode, EpochLogEntry, ResultCode, RspDetail, SdReq};
use tracing::warn;

use super::OpReply;
use crate::system::System;
use crate::{gateway, peer, recovery, store};

/// Most recent epochs reported by `StatCluster`.
const STAT_CLUSTER_EPOCHS: u32 = 8;

pub fn get_node_list(sys: &Arc<System>) -> OpReply {
    match encode(&sys.nodes()) {
        Ok(bytes) => OpReply::ok().with_data(bytes),
        Err(e) => OpReply::err(e),
    }
}

pub async fn stat_cluster(sys: &Arc<System>) -> OpReply {
    let latest = sys.epoch_store.latest();
    let mut entries = Vec::new();
    let first = latest.saturating_sub(STAT_CLUSTER_EPOCHS - 1).max(1);
    for epoch in (first..=latest).rev() {
        let log = match sys.epoch_store.read(epoch) {
            Ok(log) => Some(log),
            // A node that joined late may miss old epochs locally.
            Err(_) => recovery::read_epoch_remote(sys, epoch).await,
        };
        let Some(log) = log else { continue };
        entries.push(EpochLogEntry {
            epoch,
            ctime: sys.ctime(),
            nodes: log.nodes,
            timestamp_ms: log.timestamp_ms,
            disable_recovery: sys
                .recovery
                .disabled
                .load(std::sync::atomic::Ordering::Acquire),
        });
    }
    let mut reply = match encode(&entries) {
        Ok(bytes) => OpReply::ok().with_data(bytes),
        Err(e) => OpReply::err(e),
    };
    // The response result reports the cluster status itself.
    if reply.result.is_success() {
        reply.result = sys.status().to_result();
    }
    reply
}

pub async fn stat_sheep(sys: &Arc<System>) -> OpReply {
    let Some(driver) = sys.store() else {
        return OpReply::err(ResultCode::NoStore);
    };
    let stat = tokio::task::spawn_blocking(move || driver.stat()).await;
    match stat {
        Ok(Ok((_, used))) => {
            let size = sys.this_node().space;
            OpReply::ok().with_detail(RspDetail::Node {
                store_size: size,
                store_free: size.saturating_sub(used),
            })
        }
        Ok(Err(e)) => OpReply::err(e),
        Err(_) => OpReply::err(ResultCode::SystemError),
    }
}

pub fn stat_recovery(sys: &Arc<System>) -> OpReply {
    if sys
        .recovery
        .in_progress
        .load(std::sync::atomic::Ordering::Acquire)
    {
        OpReply::err(ResultCode::NodeInRecovery)
    } else {
        OpReply::ok()
    }
}

pub fn read_vdis(sys: &Arc<System>) -> OpReply {
    match encode(&sys.vdi.bitmap()) {
        Ok(bytes) => OpReply::ok().with_data(bytes),
        Err(e) => OpReply::err(e),
    }
}

pub fn get_vdi_copies(sys: &Arc<System>) -> OpReply {
    match encode(&sys.vdi.state_list()) {
        Ok(bytes) => OpReply::ok().with_data(bytes),
        Err(e) => OpReply::err(e),
    }
}

pub fn get_epoch(sys: &Arc<System>, req: &SdReq) -> OpReply {
    let epoch = req.detail.obj().tgt_epoch;
    match sys.epoch_store.read(epoch) {
        Ok(log) => match encode(&log) {
            Ok(bytes) => OpReply::ok().with_data(bytes),
            Err(e) => OpReply::err(e),
        },
        Err(e) => OpReply::err(e),
    }
}

pub fn get_obj_list(sys: &Arc<System>) -> OpReply {
    match encode(&sys.objlist.all()) {
        Ok(bytes) => OpReply::ok().with_data(bytes),
        Err(e) => OpReply::err(e),
    }
}

pub async fn get_hash(sys: &Arc<System>, req: &SdReq) -> OpReply {
    let obj = req.detail.obj();
    peer::get_hash(sys, obj.oid, obj.tgt_epoch).await
}

pub fn get_store_list() -> OpReply {
    let names: Vec<String> = store::STORE_DRIVERS.iter().map(|s| s.to_string()).collect();
    match encode(&names) {
        Ok(bytes) => OpReply::ok().with_data(bytes),
        Err(e) => OpReply::err(e),
    }
}

/// Drop one data object from a vdi: clear its inode slot, then remove
/// the object itself. The inode update is what matters; a failed object
/// removal is only logged.
pub async fn discard_obj(sys: &Arc<System>, req: &SdReq) -> OpReply {
    let oid = req.detail.obj().oid;
    let vid = oid_to_vid(oid);
    let idx = data_oid_to_idx(oid) as usize;
    let copies = sys.vdi.copy_count(vid, sys.nr_copies());

    let inode_oid = vid_to_vdi_oid(vid);
    let bytes = match gateway::read_object(sys, inode_oid, SD_DATA_OBJ_SIZE as u32, 0).await {
        Ok(b) => b,
        Err(e) => return OpReply::err(e),
    };
    let mut inode = match Inode::from_bytes(&bytes) {
        Ok(i) => i,
        Err(e) => return OpReply::err(e),
    };
    if idx >= inode.nr_objs() {
        return OpReply::err(ResultCode::InvalidParms);
    }
    inode.data_vdi_id[idx] = 0;
    let bytes = match inode.to_bytes() {
        Ok(b) => b,
        Err(e) => return OpReply::err(e),
    };
    if let Err(e) = gateway::write_object(sys, inode_oid, 0, &bytes, 0, copies, true).await {
        return OpReply::err(e);
    }

    if let Err(e) = gateway::remove_object(sys, oid, copies).await {
        warn!(oid = format_args!("{oid:x}"), %e, "discard left the object behind");
    }
    OpReply::ok()
}
