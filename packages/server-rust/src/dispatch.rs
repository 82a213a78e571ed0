//! The request dispatcher and the main loop task.
//!
//! One task owns the membership upcalls, the pending-cluster-request
//! queue, and every `process_main` execution; it never blocks on disk or
//! sockets. Cluster ops follow the block/unblock protocol: the
//! originator enqueues the request and blocks; when its block event
//! reaches the head of the queue everywhere, the work phase runs on a
//! worker task and the result is unblocked as an ordered notify, which
//! every node's main phase consumes identically.

use std::collections::VecDeque;
use std::sync::Arc;

use herd_core::proto::{decode, encode, ClusterStatus, ResultCode, RspDetail, SdReq, SdRsp};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::cluster::{DriverUpcall, UpcallReceiver, UpcallSender};
use crate::ops::{self, op_attrs, OpKind, OpReply};
use crate::system::System;
use crate::{gateway, membership, peer};

// ---------------------------------------------------------------------------
// NotifyPayload
// ---------------------------------------------------------------------------

/// The broadcast form of a cluster-op result: the original request plus
/// the work phase's verdict. Every node's main phase consumes this, so a
/// failed work phase still reaches every node as the same failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub req: SdReq,
    pub result: ResultCode,
    pub detail: RspDetail,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// MainHandle
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum MainMsg {
    Upcall(DriverUpcall),
    ClusterRequest {
        req: SdReq,
        data: Vec<u8>,
        reply: Option<oneshot::Sender<(SdRsp, Vec<u8>)>>,
    },
    LocalMain {
        req: SdReq,
        work: OpReply,
        reply: oneshot::Sender<(SdRsp, Vec<u8>)>,
    },
}

/// Cloneable handle feeding the main loop.
#[derive(Debug, Clone)]
pub struct MainHandle {
    tx: mpsc::UnboundedSender<MainMsg>,
}

impl MainHandle {
    /// Submit a cluster op and wait for its serialized completion.
    pub async fn cluster_request(&self, req: SdReq, data: Vec<u8>) -> (SdRsp, Vec<u8>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let fallback = SdRsp::for_req(&req, ResultCode::SystemError);
        if self
            .tx
            .send(MainMsg::ClusterRequest {
                req,
                data,
                reply: Some(reply_tx),
            })
            .is_err()
        {
            return (fallback, Vec::new());
        }
        reply_rx.await.unwrap_or((fallback, Vec::new()))
    }

    /// Submit a cluster op without waiting (internal notifications such
    /// as recovery completion).
    pub fn cluster_request_detached(&self, req: SdReq, data: Vec<u8>) {
        let _ = self.tx.send(MainMsg::ClusterRequest {
            req,
            data,
            reply: None,
        });
    }

    /// Run a local op's main phase on the main loop.
    pub async fn local_main(&self, req: SdReq, work: OpReply) -> (SdRsp, Vec<u8>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let fallback = SdRsp::for_req(&req, ResultCode::SystemError);
        if self
            .tx
            .send(MainMsg::LocalMain {
                req,
                work,
                reply: reply_tx,
            })
            .is_err()
        {
            return (fallback, Vec::new());
        }
        reply_rx.await.unwrap_or((fallback, Vec::new()))
    }
}

/// Create the main loop and its driver upcall channel.
///
/// The returned upcall sender is handed to the membership driver; the
/// forwarder task preserves the driver's delivery order.
pub fn start_main_loop(
    sys: Arc<System>,
) -> (MainHandle, UpcallSender, tokio::task::JoinHandle<()>) {
    let (main_tx, main_rx) = mpsc::unbounded_channel();
    let (up_tx, up_rx) = mpsc::unbounded_channel();

    let forward_tx = main_tx.clone();
    tokio::spawn(forward_upcalls(up_rx, forward_tx));

    let handle = MainHandle { tx: main_tx };
    sys.set_main_handle(handle.clone());
    let join = tokio::spawn(main_loop(sys, main_rx));
    (handle, up_tx, join)
}

async fn forward_upcalls(mut rx: UpcallReceiver, tx: mpsc::UnboundedSender<MainMsg>) {
    while let Some(up) = rx.recv().await {
        if tx.send(MainMsg::Upcall(up)).is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

struct PendingReq {
    req: SdReq,
    data: Vec<u8>,
    reply: Option<oneshot::Sender<(SdRsp, Vec<u8>)>>,
}

async fn main_loop(sys: Arc<System>, mut rx: mpsc::UnboundedReceiver<MainMsg>) {
    let mut pending: VecDeque<PendingReq> = VecDeque::new();
    let mut in_flight: Option<PendingReq> = None;

    while let Some(msg) = rx.recv().await {
        match msg {
            MainMsg::ClusterRequest { req, data, reply } => {
                debug!(opcode = ?req.opcode, "cluster op queued");
                pending.push_back(PendingReq { req, data, reply });
                match sys.cluster_driver() {
                    Some(driver) => {
                        // Block events are anonymous, so their bus order
                        // need not match the pending queue; the push runs
                        // off the main loop, which must stay free to
                        // answer driver upcalls.
                        tokio::spawn(async move {
                            if let Err(e) = driver.block().await {
                                error!(%e, "cannot enter cluster critical section");
                            }
                        });
                    }
                    None => {
                        if let Some(p) = pending.pop_back() {
                            if let Some(reply) = p.reply {
                                let rsp = SdRsp::for_req(&p.req, ResultCode::SystemError);
                                let _ = reply.send((rsp, Vec::new()));
                            }
                        }
                    }
                }
            }

            MainMsg::LocalMain { req, work, reply } => {
                let out = ops::process_main(&sys, &req, work).await;
                let _ = reply.send(out.into_rsp(&req, sys.epoch()));
            }

            MainMsg::Upcall(up) => {
                handle_upcall(&sys, up, &mut pending, &mut in_flight).await;
            }
        }
    }
}

async fn handle_upcall(
    sys: &Arc<System>,
    up: DriverUpcall,
    pending: &mut VecDeque<PendingReq>,
    in_flight: &mut Option<PendingReq>,
) {
    match up {
        DriverUpcall::CheckJoin {
            joining,
            opaque,
            reply,
        } => {
            let verdict = membership::check_join(sys, &joining, &opaque);
            let _ = reply.send(verdict);
        }

        DriverUpcall::Join {
            joining,
            members,
            result,
            opaque,
        } => {
            membership::handle_join(sys, &joining, &members, result, &opaque).await;
        }

        DriverUpcall::Leave { left, members } => {
            membership::handle_leave(sys, &left, &members).await;
        }

        DriverUpcall::Notify { sender, payload } => {
            let Ok(np) = decode::<NotifyPayload>(&payload) else {
                error!(sender = %sender, "malformed cluster notify, dropping");
                return;
            };
            let work = OpReply {
                result: np.result,
                detail: np.detail,
                data: np.data,
            };
            let out = if op_attrs(np.req.opcode).has_main {
                ops::process_main(sys, &np.req, work).await
            } else {
                work
            };
            // The originator completes its client request only after its
            // own main phase ran, in the same order as everyone else's.
            if sender.nid == sys.this_node().nid {
                if let Some(p) = in_flight.take() {
                    if let Some(reply) = p.reply {
                        let _ = reply.send(out.into_rsp(&np.req, sys.epoch()));
                    }
                }
            }
        }

        DriverUpcall::Block { sender, reply } => {
            if sender.nid != sys.this_node().nid {
                let _ = reply.send(false);
                return;
            }
            let Some(p) = pending.pop_front() else {
                warn!("block event for this node with no pending cluster op");
                let _ = reply.send(false);
                return;
            };
            let req = p.req.clone();
            let data = p.data.clone();
            *in_flight = Some(p);

            // Work runs off the main loop; the unblock carries its
            // result to every node.
            let sys = Arc::clone(sys);
            tokio::spawn(async move {
                let attrs = op_attrs(req.opcode);
                let work = if attrs.has_work {
                    ops::process_work(&sys, &req, &data).await
                } else {
                    // Mains of work-less ops consume the request body.
                    OpReply::ok().with_data(data)
                };
                let np = NotifyPayload {
                    req,
                    result: work.result,
                    detail: work.detail,
                    data: work.data,
                };
                match encode(&np) {
                    Ok(bytes) => {
                        if let Some(driver) = sys.cluster_driver() {
                            if let Err(e) = driver.unblock(bytes).await {
                                error!(%e, "cannot leave cluster critical section");
                            }
                        }
                    }
                    Err(e) => error!(%e, "cannot encode cluster op result"),
                }
            });
            let _ = reply.send(true);
        }

        DriverUpcall::Shutdown { reason } => {
            error!(%reason, "membership driver failed, shutting down");
            sys.set_status(ClusterStatus::Shutdown);
        }
    }
}

// ---------------------------------------------------------------------------
// Request entry point
// ---------------------------------------------------------------------------

/// Route one wire request to its class handler.
pub async fn handle_request(
    sys: &Arc<System>,
    main: &MainHandle,
    req: SdReq,
    data: Vec<u8>,
) -> (SdRsp, Vec<u8>) {
    let attrs = op_attrs(req.opcode);

    let status = sys.status();
    if !attrs.force && status != ClusterStatus::Ok {
        debug!(opcode = ?req.opcode, ?status, "op refused by cluster status");
        return (SdRsp::for_req(&req, status.to_result()), Vec::new());
    }

    match attrs.kind {
        OpKind::Peer => {
            let epoch = sys.epoch();
            peer::process(sys, &req, &data).await.into_rsp(&req, epoch)
        }
        OpKind::Gateway => {
            let epoch = sys.epoch();
            gateway::process(sys, &req, &data)
                .await
                .into_rsp(&req, epoch)
        }
        OpKind::Local => {
            let work = if attrs.has_work {
                ops::process_work(sys, &req, &data).await
            } else {
                OpReply::ok()
            };
            if attrs.has_main && work.result.is_success() {
                main.local_main(req, work).await
            } else {
                let epoch = sys.epoch();
                work.into_rsp(&req, epoch)
            }
        }
        OpKind::Cluster => main.cluster_request(req, data).await,
    }
}
