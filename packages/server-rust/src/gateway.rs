//! Gateway replicator: the originating node's fan-out to replicas.
//!
//! Writes go to all N replicas in parallel and succeed only when every
//! replica acknowledges; a transport failure invalidates the pooled
//! socket and surfaces as an I/O error without rollback (epoch-based
//! recovery repairs divergence later). Reads try replicas in placement
//! order and re-expand the zero-trimmed window a peer returns.

use futures_util::future::join_all;
use herd_core::oid::{data_obj_size, oid_to_vid};
use herd_core::proto::{flag, ObjReq, Opcode, ReqDetail, ResultCode, RspDetail, SdReq};
use herd_core::untrim_zero_sectors;
use herd_core::Node;
use tracing::{debug, warn};

use crate::ops::OpReply;
use crate::system::System;

/// Replica targets for an oid in the current view, with the effective
/// copy count resolved.
fn targets_for(sys: &System, oid: u64, requested: u32) -> (Vec<Node>, u32) {
    let view = sys.view();
    let requested = if requested == 0 {
        sys.vdi.copy_count(oid_to_vid(oid), sys.nr_copies())
    } else {
        requested
    };
    let copies = view.obj_copy_count(requested as usize) as u32;
    let targets = view
        .replicas_for(oid, copies as usize)
        .into_iter()
        .copied()
        .collect();
    (targets, copies)
}

/// Entry point for the gateway opcodes.
pub async fn process(sys: &System, req: &SdReq, data: &[u8]) -> OpReply {
    match req.opcode {
        Opcode::ReadObj => read_obj(sys, req).await,
        Opcode::WriteObj | Opcode::CreateAndWriteObj | Opcode::RemoveObj => {
            forward_req(sys, req, data).await
        }
        _ => OpReply::err(ResultCode::NoSupport),
    }
}

/// Fan a write-class request out to every replica.
async fn forward_req(sys: &System, req: &SdReq, data: &[u8]) -> OpReply {
    let obj = req.detail.obj();
    let Some(peer_op) = req.opcode.to_peer() else {
        return OpReply::err(ResultCode::NoSupport);
    };
    let (targets, copies) = targets_for(sys, obj.oid, obj.copies);
    if targets.is_empty() {
        return OpReply::err(ResultCode::Halt);
    }

    let mut fwd = req.clone();
    fwd.opcode = peer_op;
    fwd.epoch = sys.epoch();
    fwd.detail = ReqDetail::Obj(ObjReq { copies, ..obj });

    let calls = targets.iter().map(|node| {
        let fwd = fwd.clone();
        let pool = sys.sockpool.clone();
        let nid = node.nid;
        let body = data.to_vec();
        async move { pool.exec_req(nid, &fwd, &body).await }
    });

    let mut result = ResultCode::Success;
    for (node, outcome) in targets.iter().zip(join_all(calls).await) {
        match outcome {
            Ok((rsp, _)) if rsp.result.is_success() => {}
            Ok((rsp, _)) => {
                warn!(oid = format_args!("{:x}", obj.oid), node = %node, peer = %rsp.result,
                      "replica refused write");
                if result.is_success() {
                    result = rsp.result;
                }
            }
            Err(_) => {
                // The socket has been invalidated; recovery repairs the
                // replica once membership settles.
                warn!(oid = format_args!("{:x}", obj.oid), node = %node, "replica unreachable");
                result = ResultCode::Eio;
            }
        }
    }

    if result.is_success() {
        OpReply::ok().with_detail(RspDetail::Obj { offset: 0, copies })
    } else {
        OpReply::err(result)
    }
}

/// Read from the first replica that answers, expanding the trimmed
/// window back to the requested length.
async fn read_obj(sys: &System, req: &SdReq) -> OpReply {
    let obj = req.detail.obj();
    let (targets, copies) = targets_for(sys, obj.oid, obj.copies);
    if targets.is_empty() {
        return OpReply::err(ResultCode::Halt);
    }

    let mut fwd = req.clone();
    fwd.opcode = Opcode::ReadPeer;
    fwd.epoch = sys.epoch();
    fwd.detail = ReqDetail::Obj(ObjReq { copies, ..obj });

    let mut last = ResultCode::Eio;
    for node in &targets {
        match sys.sockpool.exec_req(node.nid, &fwd, &[]).await {
            Ok((rsp, mut body)) if rsp.result.is_success() => {
                let full_len = match rsp.detail {
                    RspDetail::Obj { offset, .. } => {
                        let want =
                            effective_read_len(obj.oid, obj.offset, req.data_length, &body, offset);
                        untrim_zero_sectors(&mut body, offset, want);
                        want
                    }
                    _ => body.len(),
                };
                debug!(oid = format_args!("{:x}", obj.oid), node = %node, len = full_len, "read served");
                return OpReply::ok()
                    .with_detail(RspDetail::Obj { offset: 0, copies })
                    .with_data(body);
            }
            Ok((rsp, _)) => {
                debug!(oid = format_args!("{:x}", obj.oid), node = %node, peer = %rsp.result,
                       "replica cannot serve read, failing over");
                last = rsp.result;
            }
            Err(e) => {
                debug!(oid = format_args!("{:x}", obj.oid), node = %node, %e, "replica unreachable");
                last = ResultCode::Eio;
            }
        }
    }
    OpReply::err(last)
}

/// The full payload length a read expands to: the requested window
/// (capped to the object tail) for fixed-size data objects, the
/// returned bytes plus their trim offset for variable objects.
fn effective_read_len(
    oid: u64,
    read_offset: u64,
    requested: u32,
    body: &[u8],
    trim_offset: u64,
) -> usize {
    match data_obj_size(oid) {
        Some(size) => u64::from(requested).min(size.saturating_sub(read_offset)) as usize,
        None => body.len() + trim_offset as usize,
    }
}

// ---------------------------------------------------------------------------
// Internal object API
// ---------------------------------------------------------------------------
//
// The vdi machinery, recovery, and the snapshot loader reuse the gateway
// from inside the node instead of opening a loopback connection.

/// Read `length` bytes of an object at `offset`, fully expanded.
pub async fn read_object(
    sys: &System,
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
    let reply = read_obj(sys, &req).await;
    if reply.result.is_success() {
        Ok(reply.data)
    } else {
        Err(reply.result)
    }
}

/// Write (or create) an object through the replica fan-out.
pub async fn write_object(
    sys: &System,
    oid: u64,
    cow_oid: u64,
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
    if cow_oid != 0 {
        req.flags |= flag::CMD_COW;
    }
    req.data_length = data.len() as u32;
    req.detail = ReqDetail::Obj(ObjReq {
        oid,
        cow_oid,
        offset,
        copies,
        ..Default::default()
    });
    let reply = forward_req(sys, &req, data).await;
    if reply.result.is_success() {
        Ok(())
    } else {
        Err(reply.result)
    }
}

/// Remove an object from every replica.
pub async fn remove_object(sys: &System, oid: u64, copies: u32) -> Result<(), ResultCode> {
    let mut req = SdReq::new(Opcode::RemoveObj);
    req.detail = ReqDetail::Obj(ObjReq {
        oid,
        copies,
        ..Default::default()
    });
    let reply = forward_req(sys, &req, &[]).await;
    if reply.result.is_success() {
        Ok(())
    } else {
        Err(reply.result)
    }
}
