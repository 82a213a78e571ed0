//! Epoch-change recovery: pulling authoritative replicas after the
//! membership (and therefore placement) moved.
//!
//! On every epoch bump a background task walks the cluster's object
//! list, recomputes placement in the new view, and fetches any object
//! this node should now hold from the replicas of the previous view.
//! Writes keep flowing meanwhile; divergence windows close as objects
//! land. When a node finishes it broadcasts `CompleteRecovery`; once
//! every member of the epoch reported in, stale backend state is
//! reclaimed.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use herd_core::oid::{data_obj_size, oid_to_vid, SD_DATA_OBJ_SIZE};
use herd_core::proto::{decode, encode, EpochLog, ObjReq, Opcode, ReqDetail, RspDetail, SdReq};
use herd_core::{Node, VnodeView};
use tracing::{debug, info, warn};

use crate::system::System;

/// Kick a recovery run against the previous placement view.
///
/// A no-op while recovery is administratively disabled or before a
/// backend store exists.
pub fn start(sys: &Arc<System>, old_view: Arc<VnodeView>, new_view: Arc<VnodeView>, epoch: u32) {
    if sys.recovery.disabled.load(Ordering::Acquire) {
        info!(epoch, "recovery suppressed (disabled)");
        return;
    }
    if sys.store().is_none() {
        return;
    }

    let sys = Arc::clone(sys);
    tokio::spawn(async move {
        sys.recovery.in_progress.store(true, Ordering::Release);
        info!(epoch, "recovery started");
        if let Err(e) = run(&sys, &old_view, &new_view, epoch).await {
            warn!(epoch, %e, "recovery pass failed");
        }
        sys.recovery.in_progress.store(false, Ordering::Release);
        info!(epoch, "recovery finished");

        // Announce completion so the cluster can reclaim stale state
        // once everyone caught up.
        if let Some(main) = sys.main_handle() {
            let mut req = SdReq::new(Opcode::CompleteRecovery);
            req.epoch = sys.epoch();
            req.detail = ReqDetail::Obj(ObjReq {
                tgt_epoch: epoch,
                ..Default::default()
            });
            if let Ok(body) = encode(&sys.this_node()) {
                main.cluster_request_detached(req, body);
            }
        }
    });
}

async fn run(
    sys: &Arc<System>,
    old_view: &Arc<VnodeView>,
    new_view: &Arc<VnodeView>,
    epoch: u32,
) -> anyhow::Result<()> {
    let Some(store) = sys.store() else {
        return Ok(());
    };
    let this = sys.this_node();

    // The object population is the union of every member's object list.
    let mut oids: BTreeSet<u64> = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.list())
            .await?
            .unwrap_or_default()
            .into_iter()
            .collect()
    };
    oids.extend(sys.objlist.all());
    for node in new_view.nodes() {
        if node.nid == this.nid {
            continue;
        }
        let req = SdReq::new(Opcode::GetObjList);
        match sys.sockpool.exec_req(node.nid, &req, &[]).await {
            Ok((rsp, body)) if rsp.result.is_success() => {
                if let Ok(list) = decode::<Vec<u64>>(&body) {
                    oids.extend(list);
                }
            }
            Ok((rsp, _)) => {
                debug!(node = %node, result = %rsp.result, "object list unavailable");
            }
            Err(e) => debug!(node = %node, %e, "object list fetch failed"),
        }
    }

    let mut pulled = 0usize;
    for oid in oids {
        let requested = sys.vdi.copy_count(oid_to_vid(oid), sys.nr_copies());
        let copies = new_view.obj_copy_count(requested as usize) as u32;
        if !new_view.is_replica(oid, copies as usize, &this) {
            continue;
        }
        if store.exist(oid) {
            sys.objlist.insert(oid);
            continue;
        }
        if pull_object(sys, old_view, oid, copies, epoch).await {
            pulled += 1;
        }
    }
    info!(epoch, pulled, "recovery pass complete");
    Ok(())
}

/// Fetch one object from any replica of the previous view and install
/// it locally.
async fn pull_object(
    sys: &Arc<System>,
    old_view: &Arc<VnodeView>,
    oid: u64,
    copies: u32,
    epoch: u32,
) -> bool {
    let Some(store) = sys.store() else {
        return false;
    };
    let this = sys.this_node();

    let mut req = SdReq::new(Opcode::ReadPeer);
    req.epoch = epoch;
    req.data_length = data_obj_size(oid).unwrap_or(SD_DATA_OBJ_SIZE) as u32;
    req.detail = ReqDetail::Obj(ObjReq {
        oid,
        copies,
        tgt_epoch: epoch.saturating_sub(1),
        ..Default::default()
    });

    for src in old_view.replicas_for(oid, copies as usize) {
        if src.nid == this.nid {
            continue;
        }
        match sys.sockpool.exec_req(src.nid, &req, &[]).await {
            Ok((rsp, body)) if rsp.result.is_success() => {
                let offset = match rsp.detail {
                    RspDetail::Obj { offset, .. } => offset,
                    _ => 0,
                };
                let store = Arc::clone(&store);
                let written = tokio::task::spawn_blocking(move || {
                    store.create_and_write(oid, &body, offset)
                })
                .await;
                match written {
                    Ok(Ok(())) => {
                        sys.objlist.insert(oid);
                        debug!(oid = format_args!("{oid:x}"), src = %src, "object recovered");
                        return true;
                    }
                    Ok(Err(e)) => {
                        warn!(oid = format_args!("{oid:x}"), %e, "cannot install recovered object");
                        return false;
                    }
                    Err(_) => return false,
                }
            }
            Ok((rsp, _)) => {
                debug!(oid = format_args!("{oid:x}"), src = %src, result = %rsp.result,
                       "replica cannot serve recovery read");
            }
            Err(e) => {
                debug!(oid = format_args!("{oid:x}"), src = %src, %e, "recovery read failed");
            }
        }
    }
    warn!(oid = format_args!("{oid:x}"), "no replica could provide the object");
    false
}

/// Record a member's recovery completion; reclaim stale state once the
/// whole membership reported in for the current epoch.
pub fn completion(sys: &Arc<System>, epoch: u32, node: Node) {
    let mut rec = sys.recovery.recovered.lock();
    if rec.0 > epoch {
        return;
    }
    if rec.0 < epoch {
        *rec = (epoch, Vec::new());
    }
    if !rec.1.iter().any(|n| n.nid == node.nid) {
        rec.1.push(node);
        rec.1.sort();
    }
    debug!(epoch, node = %node, recovered = rec.1.len(), "recovery completion");

    if epoch != sys.epoch() {
        return;
    }
    let members = sys.nodes();
    let all_done = members
        .iter()
        .all(|m| rec.1.iter().any(|n| n.nid == m.nid));
    if all_done {
        info!(epoch, "all nodes recovered");
        if let Some(store) = sys.store() {
            tokio::spawn(async move {
                let _ = tokio::task::spawn_blocking(move || store.cleanup()).await;
            });
        }
    }
}

/// Fetch a missing epoch log from any live peer (`GetEpoch`).
pub async fn read_epoch_remote(sys: &Arc<System>, epoch: u32) -> Option<EpochLog> {
    let this = sys.this_node();
    for node in sys.nodes() {
        if node.nid == this.nid {
            continue;
        }
        let mut req = SdReq::new(Opcode::GetEpoch);
        req.detail = ReqDetail::Obj(ObjReq {
            tgt_epoch: epoch,
            ..Default::default()
        });
        if let Ok((rsp, body)) = sys.sockpool.exec_req(node.nid, &req, &[]).await {
            if rsp.result.is_success() {
                if let Ok(log) = decode::<EpochLog>(&body) {
                    return Some(log);
                }
            }
        }
    }
    None
}
