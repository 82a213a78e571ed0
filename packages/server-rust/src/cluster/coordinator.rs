//! The shepherd coordinator: the centralized membership server.
//!
//! A single state-owning task serializes every cluster event. Joins are
//! processed one at a time: the coordinator relays each join request to
//! the current master for validation and broadcasts the verdict. Because
//! all broadcasts are emitted from one task into per-member ordered
//! streams, every member observes the identical event order.

use std::collections::HashMap;

use herd_core::Node;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::shepherd::SphMsg;
use super::JoinResult;
use crate::net::wire;

type ConnId = u64;

#[derive(Debug)]
enum CoordEvent {
    Connected(ConnId, mpsc::UnboundedSender<SphMsg>),
    Msg(ConnId, SphMsg),
    Gone(ConnId),
}

#[derive(Debug)]
struct Member {
    conn: ConnId,
    node: Node,
}

#[derive(Debug, Default)]
struct CoordState {
    conns: HashMap<ConnId, mpsc::UnboundedSender<SphMsg>>,
    /// Members sorted by node identity; the first is the master.
    members: Vec<Member>,
    /// The join currently being validated: (joiner conn, node, opaque).
    joining: Option<(ConnId, Node, Vec<u8>)>,
    pending: Vec<(ConnId, Node, Vec<u8>)>,
    last_master: Option<ConnId>,
}

impl CoordState {
    fn send_to(&self, conn: ConnId, msg: SphMsg) {
        if let Some(tx) = self.conns.get(&conn) {
            let _ = tx.send(msg);
        }
    }

    fn broadcast_members(&self, msg: &SphMsg) {
        for member in &self.members {
            self.send_to(member.conn, msg.clone());
        }
    }

    fn member_nodes(&self) -> Vec<Node> {
        self.members.iter().map(|m| m.node).collect()
    }

    fn insert_member(&mut self, conn: ConnId, node: Node) {
        self.members.push(Member { conn, node });
        self.members.sort_by(|a, b| a.node.cmp(&b.node));
    }

    fn master(&self) -> Option<&Member> {
        self.members.first()
    }

    /// Re-elect after membership shrinks; the smallest remaining node
    /// becomes master and is told so explicitly.
    fn maybe_elect(&mut self) {
        let new_master = self.master().map(|m| m.conn);
        if new_master != self.last_master {
            self.last_master = new_master;
            if let Some(conn) = new_master {
                info!("master election: conn {conn}");
                self.send_to(conn, SphMsg::MasterElection);
            }
        }
    }

    fn start_next_join(&mut self) {
        if self.joining.is_some() || self.pending.is_empty() {
            return;
        }
        let (conn, node, opaque) = self.pending.remove(0);
        if !self.conns.contains_key(&conn) {
            return self.start_next_join();
        }

        match self.master() {
            None => {
                // Empty cluster: the joiner validates itself and becomes
                // master.
                debug!(node = %node, "bootstrap join, self-validated");
                self.joining = Some((conn, node, opaque.clone()));
                self.last_master = Some(conn);
                self.send_to(conn, SphMsg::NewNode { node, opaque });
            }
            Some(master) => {
                debug!(node = %node, master = %master.node, "relaying join to master");
                let master_conn = master.conn;
                self.joining = Some((conn, node, opaque.clone()));
                self.send_to(master_conn, SphMsg::NewNode { node, opaque });
            }
        }
    }

    fn handle_msg(&mut self, conn: ConnId, msg: SphMsg) {
        match msg {
            SphMsg::Join { node, opaque } => {
                self.pending.push((conn, node, opaque));
                self.start_next_join();
            }
            SphMsg::NewNodeReply {
                node,
                result,
                opaque,
            } => {
                let Some((joiner_conn, joiner, join_opaque)) = self.joining.take() else {
                    warn!("stray join reply, dropping");
                    return;
                };
                if joiner.nid != node.nid {
                    warn!(expected = %joiner, got = %node, "join reply for the wrong node");
                    self.joining = Some((joiner_conn, joiner, join_opaque));
                    return;
                }
                match result {
                    JoinResult::Success => {
                        let mut nodes = self.member_nodes();
                        nodes.push(node);
                        nodes.sort();
                        self.send_to(
                            joiner_conn,
                            SphMsg::JoinReply {
                                result,
                                nodes: nodes.clone(),
                                opaque: opaque.clone(),
                            },
                        );
                        self.broadcast_members(&SphMsg::NewNodeFinish {
                            node,
                            result,
                            nodes,
                            opaque,
                        });
                        self.insert_member(joiner_conn, node);
                        info!(node = %node, nr_members = self.members.len(), "member joined");
                    }
                    JoinResult::MasterTransfer => {
                        // The answering master steps aside; the joiner
                        // bootstraps from a single-node view. The old
                        // master is dropped right away, its process is
                        // about to exit anyway.
                        self.members.retain(|m| m.conn != conn);
                        self.send_to(
                            joiner_conn,
                            SphMsg::JoinReply {
                                result,
                                nodes: vec![node],
                                opaque,
                            },
                        );
                        self.insert_member(joiner_conn, node);
                        info!(node = %node, "master transfer accepted");
                    }
                    JoinResult::Fail | JoinResult::JoinLater => {
                        self.send_to(
                            joiner_conn,
                            SphMsg::JoinReply {
                                result,
                                nodes: Vec::new(),
                                opaque,
                            },
                        );
                        debug!(node = %node, ?result, "join refused");
                    }
                }
                self.maybe_elect();
                self.start_next_join();
            }
            SphMsg::Notify { unblock, payload } => {
                if let Some(member) = self.members.iter().find(|m| m.conn == conn) {
                    let from = member.node;
                    self.broadcast_members(&SphMsg::NotifyForward {
                        from,
                        unblock,
                        payload,
                    });
                }
            }
            SphMsg::Block => {
                if let Some(member) = self.members.iter().find(|m| m.conn == conn) {
                    let from = member.node;
                    self.broadcast_members(&SphMsg::BlockForward { from });
                }
            }
            SphMsg::Leave => {
                if let Some(pos) = self.members.iter().position(|m| m.conn == conn) {
                    let node = self.members.remove(pos).node;
                    info!(node = %node, "member left");
                    self.broadcast_members(&SphMsg::LeaveForward { node });
                    self.maybe_elect();
                }
            }
            other => {
                warn!(?other, "unexpected message from sheep, dropping");
            }
        }
    }

    fn handle_gone(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        if let Some(pos) = self.members.iter().position(|m| m.conn == conn) {
            let node = self.members.remove(pos).node;
            info!(node = %node, "member connection lost");
            self.broadcast_members(&SphMsg::Remove { node });
            self.maybe_elect();
        }
        // A join in flight through this connection (as joiner or as the
        // validating master) cannot finish; restart the queue.
        if let Some((joiner_conn, joiner, opaque)) = self.joining.take() {
            if joiner_conn != conn {
                debug!(node = %joiner, "revalidating join after master loss");
                self.pending.insert(0, (joiner_conn, joiner, opaque));
            }
            self.start_next_join();
        }
        self.pending.retain(|(c, _, _)| *c != conn);
    }
}

/// Run the coordinator until the listener fails.
pub async fn run(listener: TcpListener) -> anyhow::Result<()> {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<CoordEvent>();

    let accept_tx = ev_tx.clone();
    tokio::spawn(async move {
        let mut next_conn: ConnId = 1;
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            debug!(%peer, conn = next_conn, "sheep connected");
            spawn_conn(next_conn, stream, accept_tx.clone());
            next_conn += 1;
        }
    });

    let mut state = CoordState::default();
    while let Some(ev) = ev_rx.recv().await {
        match ev {
            CoordEvent::Connected(conn, tx) => {
                state.conns.insert(conn, tx);
            }
            CoordEvent::Msg(conn, msg) => state.handle_msg(conn, msg),
            CoordEvent::Gone(conn) => state.handle_gone(conn),
        }
    }
    Ok(())
}

fn spawn_conn(conn: ConnId, stream: TcpStream, events: mpsc::UnboundedSender<CoordEvent>) {
    let (mut reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<SphMsg>();
    let _ = events.send(CoordEvent::Connected(conn, out_tx));

    tokio::spawn(write_loop(writer, out_rx));

    tokio::spawn(async move {
        loop {
            match wire::read_msg::<_, SphMsg>(&mut reader).await {
                Ok(msg) => {
                    if events.send(CoordEvent::Msg(conn, msg)).is_err() {
                        return;
                    }
                }
                Err(_) => {
                    let _ = events.send(CoordEvent::Gone(conn));
                    return;
                }
            }
        }
    });
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<SphMsg>) {
    while let Some(msg) = rx.recv().await {
        if wire::write_msg(&mut writer, &msg).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use herd_core::NodeId;
    use tokio::sync::mpsc as tokio_mpsc;

    use super::super::shepherd::ShepherdDriver;
    use super::super::{ClusterDriver, DriverUpcall};
    use super::*;

    fn node(last: u8) -> Node {
        Node::new(NodeId::new(IpAddr::from([10, 0, 0, last]), 7000), 1, 0)
    }

    async fn start_coordinator() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run(listener));
        addr
    }

    /// A member whose check-join always succeeds; records join, leave,
    /// notify, and block upcalls as strings.
    async fn spawn_member(
        addr: std::net::SocketAddr,
        me: Node,
    ) -> (Arc<ShepherdDriver>, tokio_mpsc::UnboundedReceiver<String>) {
        spawn_member_answering(addr, me, JoinResult::Success).await
    }

    async fn spawn_member_answering(
        addr: std::net::SocketAddr,
        me: Node,
        answer: JoinResult,
    ) -> (Arc<ShepherdDriver>, tokio_mpsc::UnboundedReceiver<String>) {
        let (up_tx, mut up_rx) = tokio_mpsc::unbounded_channel();
        let (log_tx, log_rx) = tokio_mpsc::unbounded_channel();
        let driver = ShepherdDriver::connect(&addr.to_string(), up_tx)
            .await
            .unwrap();

        tokio::spawn(async move {
            while let Some(up) = up_rx.recv().await {
                match up {
                    DriverUpcall::CheckJoin { joining, reply, .. } => {
                        // Bootstrap self-joins always pass; the answer
                        // under test applies to other nodes.
                        let verdict = if joining.nid == me.nid {
                            JoinResult::Success
                        } else {
                            answer
                        };
                        let _ = reply.send((verdict, b"view".to_vec()));
                    }
                    DriverUpcall::Join {
                        joining, members, ..
                    } => {
                        let _ = log_tx.send(format!("join:{}:{}", joining, members.len()));
                    }
                    DriverUpcall::Leave { left, members } => {
                        let _ = log_tx.send(format!("leave:{}:{}", left, members.len()));
                    }
                    DriverUpcall::Notify { payload, .. } => {
                        let _ = log_tx
                            .send(format!("notify:{}", String::from_utf8_lossy(&payload)));
                    }
                    DriverUpcall::Block { sender, reply } => {
                        let _ = log_tx.send(format!("block:{sender}"));
                        let _ = reply.send(sender.nid == me.nid);
                    }
                    DriverUpcall::Shutdown { reason } => {
                        let _ = log_tx.send(format!("shutdown:{reason}"));
                    }
                }
            }
        });

        (driver, log_rx)
    }

    async fn recv_n(rx: &mut tokio_mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for upcall")
                .expect("channel closed");
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn joins_build_identical_views() {
        let addr = start_coordinator().await;

        let (d1, mut l1) = spawn_member(addr, node(1)).await;
        d1.join(node(1), b"j1".to_vec()).await.unwrap();
        assert_eq!(recv_n(&mut l1, 1).await, vec!["join:10.0.0.1:7000:1"]);

        let (d2, mut l2) = spawn_member(addr, node(2)).await;
        d2.join(node(2), b"j2".to_vec()).await.unwrap();
        assert_eq!(recv_n(&mut l1, 1).await, vec!["join:10.0.0.2:7000:2"]);
        assert_eq!(recv_n(&mut l2, 1).await, vec!["join:10.0.0.2:7000:2"]);

        let (d3, mut l3) = spawn_member(addr, node(3)).await;
        d3.join(node(3), b"j3".to_vec()).await.unwrap();
        assert_eq!(recv_n(&mut l1, 1).await, vec!["join:10.0.0.3:7000:3"]);
        assert_eq!(recv_n(&mut l2, 1).await, vec!["join:10.0.0.3:7000:3"]);
        assert_eq!(recv_n(&mut l3, 1).await, vec!["join:10.0.0.3:7000:3"]);
    }

    #[tokio::test]
    async fn notifies_are_totally_ordered() {
        let addr = start_coordinator().await;
        let (d1, mut l1) = spawn_member(addr, node(1)).await;
        d1.join(node(1), Vec::new()).await.unwrap();
        recv_n(&mut l1, 1).await;
        let (d2, mut l2) = spawn_member(addr, node(2)).await;
        d2.join(node(2), Vec::new()).await.unwrap();
        recv_n(&mut l1, 1).await;
        recv_n(&mut l2, 1).await;

        for i in 0..5u8 {
            let driver: &Arc<ShepherdDriver> = if i % 2 == 0 { &d1 } else { &d2 };
            driver.notify(vec![b'0' + i]).await.unwrap();
        }

        let o1 = recv_n(&mut l1, 5).await;
        let o2 = recv_n(&mut l2, 5).await;
        assert_eq!(o1, o2, "members observed different notify orders");
    }

    #[tokio::test]
    async fn block_unblock_round_trip() {
        let addr = start_coordinator().await;
        let (d1, mut l1) = spawn_member(addr, node(1)).await;
        d1.join(node(1), Vec::new()).await.unwrap();
        recv_n(&mut l1, 1).await;
        let (d2, mut l2) = spawn_member(addr, node(2)).await;
        d2.join(node(2), Vec::new()).await.unwrap();
        recv_n(&mut l1, 1).await;
        recv_n(&mut l2, 1).await;

        // d1 enters the critical section; when its block callback fires
        // it unblocks with a result payload.
        d1.block().await.unwrap();
        assert_eq!(recv_n(&mut l1, 1).await, vec!["block:10.0.0.1:7000"]);
        assert_eq!(recv_n(&mut l2, 1).await, vec!["block:10.0.0.1:7000"]);

        d1.unblock(b"result".to_vec()).await.unwrap();
        assert_eq!(recv_n(&mut l1, 1).await, vec!["notify:result"]);
        assert_eq!(recv_n(&mut l2, 1).await, vec!["notify:result"]);
    }

    #[tokio::test]
    async fn leave_shrinks_view_and_reelects() {
        let addr = start_coordinator().await;
        let (d1, mut l1) = spawn_member(addr, node(1)).await;
        d1.join(node(1), Vec::new()).await.unwrap();
        recv_n(&mut l1, 1).await;
        let (d2, mut l2) = spawn_member(addr, node(2)).await;
        d2.join(node(2), Vec::new()).await.unwrap();
        recv_n(&mut l1, 1).await;
        recv_n(&mut l2, 1).await;

        d1.leave().await.unwrap();
        assert_eq!(recv_n(&mut l2, 1).await, vec!["leave:10.0.0.1:7000:1"]);

        // d2 is now master: a third join is validated by it.
        let (d3, mut l3) = spawn_member(addr, node(3)).await;
        d3.join(node(3), Vec::new()).await.unwrap();
        assert_eq!(recv_n(&mut l2, 1).await, vec!["join:10.0.0.3:7000:2"]);
        assert_eq!(recv_n(&mut l3, 1).await, vec!["join:10.0.0.3:7000:2"]);
    }

    #[tokio::test]
    async fn master_transfer_hands_the_cluster_to_the_joiner() {
        let addr = start_coordinator().await;

        // A survivor that cannot validate anyone: its join check demands
        // a master transfer (the joiner knows a newer cluster state).
        let (d1, mut l1) = spawn_member_answering(addr, node(1), JoinResult::MasterTransfer).await;
        d1.join(node(1), Vec::new()).await.unwrap();
        recv_n(&mut l1, 1).await;

        let (d2, mut l2) = spawn_member(addr, node(2)).await;
        d2.join(node(2), Vec::new()).await.unwrap();

        // The joiner bootstraps from a single-node view...
        assert_eq!(recv_n(&mut l2, 1).await, vec!["join:10.0.0.2:7000:1"]);
        // ...and the old master steps aside.
        let survivor = recv_n(&mut l1, 1).await;
        assert!(
            survivor[0].starts_with("shutdown:"),
            "survivor kept running: {survivor:?}"
        );

        // Later joins are validated by the new master with a full view.
        let (d3, mut l3) = spawn_member(addr, node(3)).await;
        d3.join(node(3), Vec::new()).await.unwrap();
        assert_eq!(recv_n(&mut l3, 1).await, vec!["join:10.0.0.3:7000:2"]);
        assert_eq!(recv_n(&mut l2, 1).await, vec!["join:10.0.0.3:7000:2"]);
    }

    #[tokio::test]
    async fn crash_is_broadcast_as_remove() {
        let addr = start_coordinator().await;
        let (d1, mut l1) = spawn_member(addr, node(1)).await;
        d1.join(node(1), Vec::new()).await.unwrap();
        recv_n(&mut l1, 1).await;

        // A raw member that joins by hand and then drops its socket
        // without saying leave.
        let mut raw = TcpStream::connect(addr).await.unwrap();
        wire::write_msg(
            &mut raw,
            &SphMsg::Join {
                node: node(2),
                opaque: Vec::new(),
            },
        )
        .await
        .unwrap();
        loop {
            let msg: SphMsg = wire::read_msg(&mut raw).await.unwrap();
            if matches!(msg, SphMsg::JoinReply { .. }) {
                break;
            }
        }
        recv_n(&mut l1, 1).await; // d1 sees the join
        drop(raw);

        let got = recv_n(&mut l1, 1).await;
        assert_eq!(got, vec!["leave:10.0.0.2:7000:1"]);
    }
}
