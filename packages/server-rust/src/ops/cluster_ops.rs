//! Cluster operation handlers.
//!
//! Work phases run on the originating node and may block on I/O; main
//! phases run on every node in the same total order and must stay quick.
//! The work result travels inside the broadcast payload, so every main
//! phase sees the identical verdict even when the work failed.

use std::sync::Arc;

use herd_core::proto::{
    decode, encode, flag, ReqDetail, ResultCode, RspDetail, SdReq, VdiAttrPayload,
    VdiNamePayload, VdiStateReq,
};
use herd_core::proto::{ClusterStatus, EpochLog};
use herd_core::{Node, VnodeView};
use tracing::{error, info, warn};

use super::OpReply;
use crate::config::SD_DEFAULT_COPIES;
use crate::recovery;
use crate::store::create_store;
use crate::system::System;
use crate::vdi;

// ---------------------------------------------------------------------------
// NewVdi / DelVdi / lookups
// ---------------------------------------------------------------------------

pub async fn new_vdi(sys: &Arc<System>, req: &SdReq, data: &[u8]) -> OpReply {
    let Ok(payload) = decode::<VdiNamePayload>(data) else {
        return OpReply::err(ResultCode::InvalidParms);
    };
    let v = req.detail.vdi();
    let params = vdi::VdiCreateParams {
        name: payload.name,
        size: v.vdi_size,
        base_vid: v.base_vid,
        create_snapshot: v.snapid != 0,
        nr_copies: v.copies,
    };

    match vdi::create(sys, &params).await {
        Ok(created) => {
            // The main phase on every node installs the bitmap bit and
            // state from this record.
            let state = VdiStateReq {
                new_vid: created.vid,
                old_vid: created.old_vid,
                copies: created.nr_copies,
                set_bitmap: true,
            };
            let Ok(bytes) = encode(&state) else {
                return OpReply::err(ResultCode::SystemError);
            };
            OpReply::ok()
                .with_detail(RspDetail::Vdi {
                    vdi_id: created.vid,
                    attr_id: 0,
                    copies: created.nr_copies,
                })
                .with_data(bytes)
        }
        Err(e) => OpReply::err(e),
    }
}

pub fn post_new_vdi(sys: &Arc<System>, work: OpReply) -> OpReply {
    if !work.result.is_success() {
        return work;
    }
    let Ok(state) = decode::<VdiStateReq>(&work.data) else {
        error!("new-vdi broadcast carried a malformed state record");
        return OpReply::err(ResultCode::SystemError);
    };
    vdi::post_create(
        sys,
        &vdi::VdiCreated {
            vid: state.new_vid,
            nr_copies: state.copies,
            old_vid: state.old_vid,
        },
    );
    work
}

pub async fn del_vdi(sys: &Arc<System>, req: &SdReq, data: &[u8]) -> OpReply {
    let Ok(payload) = decode::<VdiNamePayload>(data) else {
        return OpReply::err(ResultCode::InvalidParms);
    };
    let snapid = req.detail.vdi().snapid;
    match vdi::delete(sys, &payload.name, payload.tag.as_deref(), snapid).await {
        Ok(vid) => OpReply::ok().with_detail(RspDetail::Vdi {
            vdi_id: vid,
            attr_id: 0,
            copies: 0,
        }),
        Err(e) => OpReply::err(e),
    }
}

pub fn post_del_vdi(sys: &Arc<System>, work: OpReply) -> OpReply {
    if let RspDetail::Vdi { vdi_id, .. } = work.detail {
        if work.result.is_success() {
            sys.vdi.remove_state(vdi_id);
        }
    }
    work
}

pub async fn get_vdi_info(sys: &Arc<System>, req: &SdReq, data: &[u8]) -> OpReply {
    let Ok(payload) = decode::<VdiNamePayload>(data) else {
        return OpReply::err(ResultCode::InvalidParms);
    };
    let snapid = req.detail.vdi().snapid;
    match vdi::lookup(sys, &payload.name, payload.tag.as_deref(), snapid).await {
        Ok(found) => {
            let copies = sys.vdi.copy_count(found.vid, sys.nr_copies());
            OpReply::ok().with_detail(RspDetail::Vdi {
                vdi_id: found.vid,
                attr_id: 0,
                copies,
            })
        }
        Err(e) => OpReply::err(e),
    }
}

pub async fn get_vdi_attr(sys: &Arc<System>, req: &SdReq, data: &[u8]) -> OpReply {
    let Ok(payload) = decode::<VdiAttrPayload>(data) else {
        return OpReply::err(ResultCode::InvalidParms);
    };
    // The vdi must exist even though attributes are indexed by name hash.
    if let Err(e) = vdi::lookup(sys, &payload.name, payload.tag.as_deref(), 0).await {
        return OpReply::err(e);
    }
    let create = req.flags & flag::CMD_CREAT != 0;
    let excl = req.flags & flag::CMD_EXCL != 0;
    let del = req.flags & flag::CMD_DEL != 0;
    match vdi::vdi_attr(sys, &payload, create, excl, del).await {
        Ok((hashed_vid, attr_id)) => OpReply::ok().with_detail(RspDetail::Vdi {
            vdi_id: hashed_vid,
            attr_id,
            copies: sys.nr_copies(),
        }),
        Err(e) => OpReply::err(e),
    }
}

// ---------------------------------------------------------------------------
// MakeFs / Shutdown
// ---------------------------------------------------------------------------

pub async fn make_fs(sys: &Arc<System>, req: &SdReq, work: OpReply) -> OpReply {
    let store_name = String::from_utf8_lossy(&work.data).trim().to_string();
    let store_name = if store_name.is_empty() {
        "plain".to_string()
    } else {
        store_name
    };

    let store = match create_store(&store_name, &sys.config.obj_dir()) {
        Ok(s) => s,
        Err(e) => return OpReply::err(e),
    };
    let formatted = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.format().and_then(|()| store.init())).await
    };
    match formatted {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return OpReply::err(e),
        Err(_) => return OpReply::err(ResultCode::SystemError),
    }
    sys.set_store(store);
    sys.objlist.clear();

    let cluster = match req.detail {
        ReqDetail::Cluster(c) => c,
        _ => return OpReply::err(ResultCode::InvalidParms),
    };
    sys.set_nr_copies(if cluster.copies == 0 {
        SD_DEFAULT_COPIES
    } else {
        cluster.copies
    });
    sys.set_cluster_flags(cluster.flags);
    sys.set_ctime(cluster.ctime);
    if let Err(e) = sys.save_cluster_config(&store_name) {
        error!(%e, "cannot persist cluster config");
        return OpReply::err(ResultCode::Eio);
    }

    let latest = sys.epoch_store.latest();
    for epoch in 1..=latest {
        let _ = sys.epoch_store.remove(epoch);
    }
    sys.vdi.clear();

    sys.set_epoch(1);
    let nodes = sys.nodes();
    if let Err(e) = sys.epoch_store.write(1, &nodes, sys.wall_clock_ms()) {
        return OpReply::err(e);
    }
    sys.publish_view(VnodeView::new(&nodes));

    sys.set_status(if sys.have_enough_zones() {
        ClusterStatus::Ok
    } else {
        ClusterStatus::Halt
    });
    info!(store = %store_name, copies = sys.nr_copies(), "cluster formatted");
    OpReply::ok()
}

pub fn shutdown(sys: &Arc<System>, work: OpReply) -> OpReply {
    sys.set_status(ClusterStatus::Shutdown);
    work
}

// ---------------------------------------------------------------------------
// Recovery control
// ---------------------------------------------------------------------------

pub fn force_recover_work(sys: &Arc<System>) -> OpReply {
    // Forced recovery only makes sense while the cluster refuses to
    // assemble on its own.
    if sys.status() != ClusterStatus::WaitForJoin {
        return OpReply::err(ResultCode::ForceRecoverError);
    }
    let latest = sys.epoch_store.latest();
    let log = match sys.epoch_store.read(latest) {
        Ok(log) => log,
        Err(e) => {
            error!(epoch = latest, %e, "cannot read epoch log for forced recovery");
            return OpReply::err(ResultCode::ForceRecoverError);
        }
    };
    match encode(&log) {
        Ok(bytes) => OpReply::ok().with_data(bytes),
        Err(e) => OpReply::err(e),
    }
}

pub fn force_recover_main(sys: &Arc<System>, work: OpReply) -> OpReply {
    if !work.result.is_success() {
        return work;
    }
    let Ok(old_log) = decode::<EpochLog>(&work.data) else {
        error!("forced recovery broadcast carried a malformed epoch log");
        return OpReply::err(ResultCode::ForceRecoverError);
    };

    let epoch = sys.epoch() + 1;
    sys.set_epoch(epoch);
    let nodes = sys.nodes();
    if let Err(e) = sys.epoch_store.write(epoch, &nodes, sys.wall_clock_ms()) {
        error!(%e, "cannot log forced-recovery epoch");
        return OpReply::err(ResultCode::Eio);
    }

    let old_view = Arc::new(VnodeView::new(&old_log.nodes));
    let new_view = Arc::new(VnodeView::new(&nodes));
    sys.publish_view(VnodeView::new(&nodes));
    sys.set_status(if sys.have_enough_zones() {
        ClusterStatus::Ok
    } else {
        ClusterStatus::Halt
    });

    info!(epoch, "forced recovery");
    recovery::start(sys, old_view, new_view, epoch);
    work
}

pub fn enable_recover(sys: &Arc<System>, work: OpReply) -> OpReply {
    sys.recovery
        .disabled
        .store(false, std::sync::atomic::Ordering::Release);
    info!("recovery enabled");
    work
}

pub fn disable_recover(sys: &Arc<System>, work: OpReply) -> OpReply {
    sys.recovery
        .disabled
        .store(true, std::sync::atomic::Ordering::Release);
    info!("recovery disabled");
    work
}

pub fn complete_recovery(sys: &Arc<System>, req: &SdReq, work: OpReply) -> OpReply {
    let Ok(node) = decode::<Node>(&work.data) else {
        warn!("malformed recovery completion record");
        return work;
    };
    let epoch = req.detail.obj().tgt_epoch;
    recovery::completion(sys, epoch, node);
    work
}

// ---------------------------------------------------------------------------
// Vdi state propagation
// ---------------------------------------------------------------------------

pub fn notify_vdi_add(sys: &Arc<System>, req: &SdReq, work: OpReply) -> OpReply {
    let state = match req.detail {
        ReqDetail::VdiState(s) => s,
        _ => return OpReply::err(ResultCode::InvalidParms),
    };
    if state.old_vid != 0 {
        // The previous working vdi becomes a snapshot.
        let copies = sys.vdi.copy_count(state.old_vid, state.copies);
        sys.vdi.add_state(state.old_vid, copies, true);
    }
    if state.set_bitmap {
        sys.vdi.set(state.new_vid);
    }
    sys.vdi.add_state(state.new_vid, state.copies, false);
    work
}

pub fn notify_vdi_del(sys: &Arc<System>, work: OpReply) -> OpReply {
    let Ok(vid) = decode::<u32>(&work.data) else {
        return OpReply::err(ResultCode::InvalidParms);
    };
    sys.objlist.cleanup_vid(vid);
    sys.vdi.remove_state(vid);
    work
}
