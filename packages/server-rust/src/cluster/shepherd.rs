//! Shepherd membership driver: a TCP client of the `herd-shepherd`
//! coordinator.
//!
//! The coordinator serializes all cluster events onto one ordered stream
//! per member; this driver consumes its stream in arrival order and
//! forwards upcalls. Joins are validated by the current master: the
//! coordinator relays the join request to it, the master answers through
//! its join check, and the coordinator broadcasts the outcome.

use async_trait::async_trait;
use herd_core::Node;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::queue::EventQueue;
use super::{ClusterDriver, DriverUpcall, JoinResult, UpcallSender};
use crate::net::wire;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Messages exchanged with the coordinator, framed as length-prefixed
/// MsgPack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SphMsg {
    // sheep -> coordinator
    Join { node: Node, opaque: Vec<u8> },
    NewNodeReply { node: Node, result: JoinResult, opaque: Vec<u8> },
    Notify { unblock: bool, payload: Vec<u8> },
    Block,
    Leave,

    // coordinator -> sheep
    JoinRetry,
    NewNode { node: Node, opaque: Vec<u8> },
    JoinReply { result: JoinResult, nodes: Vec<Node>, opaque: Vec<u8> },
    NewNodeFinish { node: Node, result: JoinResult, nodes: Vec<Node>, opaque: Vec<u8> },
    NotifyForward { from: Node, unblock: bool, payload: Vec<u8> },
    BlockForward { from: Node },
    LeaveForward { node: Node },
    Remove { node: Node },
    MasterElection,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SphState {
    this: Option<Node>,
    opaque: Vec<u8>,
    joined: bool,
    is_master: bool,
    nodes: Vec<Node>,
    queue: EventQueue,
}

struct Inner {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    upcalls: UpcallSender,
    st: tokio::sync::Mutex<SphState>,
}

/// The shepherd driver; one TCP connection to the coordinator.
#[derive(Clone)]
pub struct ShepherdDriver(Arc<Inner>);

impl ShepherdDriver {
    /// Connect to the coordinator at `addr` (`host:port`).
    pub async fn connect(addr: &str, upcalls: UpcallSender) -> anyhow::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();

        let driver = Arc::new(Self(Arc::new(Inner {
            writer: tokio::sync::Mutex::new(writer),
            upcalls,
            st: tokio::sync::Mutex::new(SphState {
                this: None,
                opaque: Vec::new(),
                joined: false,
                is_master: false,
                nodes: Vec::new(),
                queue: EventQueue::new(),
            }),
        })));

        tokio::spawn(comm_loop(Arc::clone(&driver.0), reader));
        info!(%addr, "connected to shepherd coordinator");
        Ok(driver)
    }
}

impl Inner {
    async fn send(&self, msg: &SphMsg) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        wire::write_msg(&mut *writer, msg).await?;
        Ok(())
    }

    async fn check_join(&self, joining: Node, opaque: Vec<u8>) -> (JoinResult, Vec<u8>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.upcalls.send(DriverUpcall::CheckJoin {
            joining,
            opaque,
            reply: reply_tx,
        });
        reply_rx.await.unwrap_or((JoinResult::Fail, Vec::new()))
    }

    async fn handle(&self, msg: SphMsg) -> anyhow::Result<()> {
        let mut st = self.st.lock().await;
        match msg {
            SphMsg::JoinRetry => {
                info!("join rejected for now, retrying");
                let node = st.this.ok_or_else(|| anyhow::anyhow!("retry before join"))?;
                let opaque = st.opaque.clone();
                drop(st);
                self.send(&SphMsg::Join { node, opaque }).await?;
            }
            SphMsg::NewNode { node, opaque } => {
                // We are (or just became) the validating master.
                let (result, reply_opaque) = self.check_join(node, opaque).await;
                st.is_master = true;
                let transferring = result == JoinResult::MasterTransfer;
                drop(st);
                self.send(&SphMsg::NewNodeReply {
                    node,
                    result,
                    opaque: reply_opaque,
                })
                .await?;
                if transferring {
                    error!("master transferred to a rejoining node, shutting down");
                    let _ = self.upcalls.send(DriverUpcall::Shutdown {
                        reason: "master transferred to a rejoining node".to_string(),
                    });
                }
            }
            SphMsg::JoinReply {
                result,
                nodes,
                opaque,
            } => {
                let this = st.this.ok_or_else(|| anyhow::anyhow!("reply before join"))?;
                if result == JoinResult::MasterTransfer {
                    // The cluster assumes a single survivor here: we
                    // bootstrap from a single-node view.
                    st.is_master = true;
                    st.nodes = vec![this];
                } else {
                    st.nodes = nodes;
                }
                st.joined = true;
                let members = st.nodes.clone();
                debug!(nr_nodes = members.len(), ?result, "join reply");
                let _ = self.upcalls.send(DriverUpcall::Join {
                    joining: this,
                    members,
                    result,
                    opaque,
                });
            }
            SphMsg::NewNodeFinish {
                node,
                result,
                nodes,
                opaque,
            } => {
                st.nodes = nodes.clone();
                let _ = self.upcalls.send(DriverUpcall::Join {
                    joining: node,
                    members: nodes,
                    result,
                    opaque,
                });
            }
            SphMsg::NotifyForward {
                from,
                unblock,
                payload,
            } => {
                if unblock {
                    st.queue.remove_one_block();
                }
                st.queue.push_notify(from, payload);
                let upcalls = self.upcalls.clone();
                st.queue.drain(&upcalls).await;
            }
            SphMsg::BlockForward { from } => {
                st.queue.push_block(from);
                let upcalls = self.upcalls.clone();
                st.queue.drain(&upcalls).await;
            }
            SphMsg::LeaveForward { node } | SphMsg::Remove { node } => {
                st.nodes.retain(|n| n.nid != node.nid);
                let members = st.nodes.clone();
                info!(left = %node, nr_nodes = members.len(), "member gone");
                let _ = self.upcalls.send(DriverUpcall::Leave {
                    left: node,
                    members,
                });
            }
            SphMsg::MasterElection => {
                info!("elected as master");
                st.is_master = true;
            }
            other => {
                // Client-direction messages must never arrive here.
                error!(?other, "unexpected message from coordinator");
                anyhow::bail!("protocol violation from coordinator");
            }
        }
        Ok(())
    }
}

async fn comm_loop(inner: Arc<Inner>, mut reader: OwnedReadHalf) {
    loop {
        let msg: SphMsg = match wire::read_msg(&mut reader).await {
            Ok(m) => m,
            Err(e) => {
                // Losing the coordinator is fatal: the epoch log and
                // vnode view would drift if we kept serving.
                warn!(%e, "coordinator connection lost");
                let _ = inner.upcalls.send(DriverUpcall::Shutdown {
                    reason: format!("coordinator connection lost: {e}"),
                });
                return;
            }
        };
        if let Err(e) = inner.handle(msg).await {
            error!(%e, "shepherd driver error");
            let _ = inner.upcalls.send(DriverUpcall::Shutdown {
                reason: e.to_string(),
            });
            return;
        }
    }
}

#[async_trait]
impl ClusterDriver for ShepherdDriver {
    async fn join(&self, myself: Node, opaque: Vec<u8>) -> anyhow::Result<()> {
        {
            let mut st = self.0.st.lock().await;
            st.this = Some(myself);
            st.opaque.clone_from(&opaque);
        }
        self.0.send(&SphMsg::Join {
            node: myself,
            opaque,
        })
        .await
    }

    async fn leave(&self) -> anyhow::Result<()> {
        {
            let mut st = self.0.st.lock().await;
            st.is_master = false;
        }
        self.0.send(&SphMsg::Leave).await
    }

    async fn notify(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.0
            .send(&SphMsg::Notify {
                unblock: false,
                payload,
            })
            .await
    }

    async fn block(&self) -> anyhow::Result<()> {
        self.0.send(&SphMsg::Block).await
    }

    async fn unblock(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        self.0
            .send(&SphMsg::Notify {
                unblock: true,
                payload,
            })
            .await
    }

    async fn update_node(&self, node: Node) -> anyhow::Result<()> {
        let mut st = self.0.st.lock().await;
        st.this = Some(node);
        if let Some(entry) = st.nodes.iter_mut().find(|n| n.nid == node.nid) {
            *entry = node;
        }
        Ok(())
    }
}
