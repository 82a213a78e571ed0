//! Peer object path: a node executing I/O against its own backend.
//!
//! Thin adapter between the peer opcodes and the store driver. Reads
//! reply with a zero-trimmed window plus the effective copy count;
//! copy-on-write creates materialize the base object, overlay the
//! incoming bytes, and re-trim before hitting the store. Blocking disk
//! I/O runs on the blocking pool.

use std::sync::Arc;

use herd_core::oid::{data_obj_size, is_data_obj};
use herd_core::proto::{flag, Opcode, ResultCode, RspDetail, SdReq};
use herd_core::trim_zero_sectors;
use tracing::{debug, warn};

use crate::gateway;
use crate::ops::OpReply;
use crate::store::StoreDriver;
use crate::system::System;

/// Entry point for the peer opcodes.
pub async fn process(sys: &System, req: &SdReq, data: &[u8]) -> OpReply {
    let Some(store) = sys.store() else {
        return OpReply::err(ResultCode::NoStore);
    };
    match req.opcode {
        Opcode::ReadPeer => read_obj(sys, store, req).await,
        Opcode::WritePeer => write_obj(store, req, data).await,
        Opcode::CreateAndWritePeer => create_and_write_obj(sys, store, req, data).await,
        Opcode::RemovePeer => remove_obj(sys, store, req).await,
        _ => OpReply::err(ResultCode::NoSupport),
    }
}

async fn read_obj(sys: &System, store: Arc<dyn StoreDriver>, req: &SdReq) -> OpReply {
    let obj = req.detail.obj();
    let length = req.data_length;
    let read = tokio::task::spawn_blocking(move || store.read(obj.oid, length, obj.offset)).await;
    let buf = match read {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => return OpReply::err(e),
        Err(_) => return OpReply::err(ResultCode::SystemError),
    };

    // Only fixed-size data objects trim: the reader re-expands them to
    // a known length. Variable-length objects (inodes, attributes) must
    // travel verbatim, trailing zero bytes included.
    let (offset, window) = if is_data_obj(obj.oid) {
        trim_zero_sectors(&buf)
    } else {
        (0, &buf[..])
    };
    let copies = if obj.copies != 0 {
        obj.copies
    } else {
        sys.view().obj_copy_count(sys.nr_copies() as usize) as u32
    };
    debug!(
        oid = format_args!("{:x}", obj.oid),
        window = window.len(),
        offset,
        "peer read"
    );
    OpReply::ok()
        .with_detail(RspDetail::Obj { offset, copies })
        .with_data(window.to_vec())
}

async fn write_obj(store: Arc<dyn StoreDriver>, req: &SdReq, data: &[u8]) -> OpReply {
    let obj = req.detail.obj();
    let buf = data.to_vec();
    let written =
        tokio::task::spawn_blocking(move || store.write(obj.oid, &buf, obj.offset)).await;
    match written {
        Ok(Ok(())) => OpReply::ok(),
        Ok(Err(e)) => OpReply::err(e),
        Err(_) => OpReply::err(ResultCode::SystemError),
    }
}

async fn create_and_write_obj(
    sys: &System,
    store: Arc<dyn StoreDriver>,
    req: &SdReq,
    data: &[u8],
) -> OpReply {
    let obj = req.detail.obj();
    let oid = obj.oid;

    let (payload, offset) = if req.flags & flag::CMD_COW != 0 && is_data_obj(oid) {
        // Materialize the base object, overlay the incoming bytes, and
        // store the re-trimmed result.
        let full = data_obj_size(oid).unwrap_or(0) as usize;
        debug!(
            oid = format_args!("{oid:x}"),
            cow = format_args!("{:x}", obj.cow_oid),
            "copy-on-write create"
        );
        let mut buf = if data.len() < full {
            match gateway::read_object(sys, obj.cow_oid, full as u32, 0).await {
                Ok(b) => {
                    let mut b = b;
                    b.resize(full, 0);
                    b
                }
                Err(e) => {
                    warn!(cow = format_args!("{:x}", obj.cow_oid), %e, "cannot read cow base");
                    return OpReply::err(e);
                }
            }
        } else {
            vec![0u8; full]
        };
        let off = obj.offset as usize;
        let end = (off + data.len()).min(full);
        if off < end {
            buf[off..end].copy_from_slice(&data[..end - off]);
        }
        let (toff, window) = trim_zero_sectors(&buf);
        (window.to_vec(), toff)
    } else {
        (data.to_vec(), obj.offset)
    };

    let created =
        tokio::task::spawn_blocking(move || store.create_and_write(oid, &payload, offset)).await;
    match created {
        Ok(Ok(())) => {
            sys.objlist.insert(oid);
            OpReply::ok()
        }
        Ok(Err(e)) => OpReply::err(e),
        Err(_) => OpReply::err(ResultCode::SystemError),
    }
}

async fn remove_obj(sys: &System, store: Arc<dyn StoreDriver>, req: &SdReq) -> OpReply {
    let oid = req.detail.obj().oid;
    sys.objlist.remove(oid);
    let removed = tokio::task::spawn_blocking(move || store.remove(oid)).await;
    match removed {
        Ok(Ok(())) => OpReply::ok(),
        Ok(Err(e)) => OpReply::err(e),
        Err(_) => OpReply::err(ResultCode::SystemError),
    }
}

/// `GetHash` support: the content hash the snapshot archive compares
/// against.
pub async fn get_hash(sys: &System, oid: u64, tgt_epoch: u32) -> OpReply {
    let Some(store) = sys.store() else {
        return OpReply::err(ResultCode::NoStore);
    };
    let hashed = tokio::task::spawn_blocking(move || store.get_hash(oid, tgt_epoch)).await;
    match hashed {
        Ok(Ok(digest)) => OpReply::ok().with_detail(RspDetail::Hash { digest }),
        Ok(Err(e)) => OpReply::err(e),
        Err(_) => OpReply::err(ResultCode::SystemError),
    }
}
