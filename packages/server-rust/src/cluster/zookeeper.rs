//! ZooKeeper membership driver (cargo feature `zookeeper`).
//!
//! A sequence-znode queue under `/herd/queue` gives the totally-ordered
//! event bus: every event is one znode created with a monotonic sequence
//! number; each driver consumes the queue through a strictly advancing
//! local cursor. Ephemeral znodes under `/herd/member` detect crashes;
//! `/herd/master` arbitrates the bootstrap master race. A push that times
//! out scans forward from the cursor for a znode carrying the same event
//! id before retrying, so transport retries never duplicate events.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herd_core::{Node, NodeId};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use zookeeper::{Acl, CreateMode, WatchedEvent, WatchedEventType, Watcher, ZkError, ZooKeeper};

use super::{
    ClusterDriver, ClusterEvent, DriverUpcall, EventIdGen, EventKind, JoinResult, UpcallSender,
};

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

const BASE_ZNODE: &str = "/herd";
const QUEUE_ZNODE: &str = "/herd/queue";
const MEMBER_ZNODE: &str = "/herd/member";
const MASTER_ZNODE: &str = "/herd/master";

fn queue_path(pos: u64) -> String {
    format!("{QUEUE_ZNODE}/q{pos:010}")
}

fn member_path(node: &Node) -> String {
    format!("{MEMBER_ZNODE}/{}", node.nid)
}

// ---------------------------------------------------------------------------
// Watcher plumbing
// ---------------------------------------------------------------------------

enum Wake {
    /// Something happened; re-scan the queue.
    Kick,
    /// A member znode disappeared (crash).
    MemberGone(NodeId),
}

struct QueueWatcher {
    wake: std_mpsc::Sender<Wake>,
}

impl Watcher for QueueWatcher {
    fn handle(&self, event: WatchedEvent) {
        if event.event_type == WatchedEventType::NodeDeleted {
            if let Some(path) = &event.path {
                if let Some(name) = path.strip_prefix(&format!("{MEMBER_ZNODE}/")) {
                    if let Ok(nid) = name.parse::<NodeId>() {
                        let _ = self.wake.send(Wake::MemberGone(nid));
                        return;
                    }
                }
            }
        }
        let _ = self.wake.send(Wake::Kick);
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct ZkState {
    this: Option<Node>,
    queue_pos: u64,
    first_push: bool,
    tree: BTreeMap<NodeId, (Node, bool)>,
    blocks: VecDeque<(Node, bool)>,
    stopped: bool,
}

struct Inner {
    zk: ZooKeeper,
    upcalls: UpcallSender,
    st: Mutex<ZkState>,
    ids: EventIdGen,
    wake: std_mpsc::Sender<Wake>,
}

/// The ZooKeeper driver.
#[derive(Clone)]
pub struct ZkDriver(Arc<Inner>);

impl ZkDriver {
    /// Connect to the ensemble (`host:port[,host:port...]`).
    pub fn connect(hosts: &str, upcalls: UpcallSender) -> anyhow::Result<Arc<Self>> {
        let (wake_tx, wake_rx) = std_mpsc::channel();
        let zk = ZooKeeper::connect(
            hosts,
            SESSION_TIMEOUT,
            QueueWatcher {
                wake: wake_tx.clone(),
            },
        )?;

        let inner = Arc::new(Inner {
            zk,
            upcalls,
            st: Mutex::new(ZkState {
                this: None,
                queue_pos: 0,
                first_push: true,
                tree: BTreeMap::new(),
                blocks: VecDeque::new(),
                stopped: false,
            }),
            ids: EventIdGen::new(),
            wake: wake_tx,
        });

        inner.init_base_znodes()?;
        {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("zk-events".to_string())
                .spawn(move || inner.event_loop(&wake_rx))?;
        }
        info!(%hosts, "connected to zookeeper");
        Ok(Arc::new(Self(inner)))
    }
}

impl Inner {
    fn init_base_znodes(&self) -> anyhow::Result<()> {
        for path in [BASE_ZNODE, QUEUE_ZNODE, MEMBER_ZNODE] {
            match self.zk.create(
                path,
                Vec::new(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(e) => anyhow::bail!("cannot create {path}: {e:?}"),
            }
        }
        Ok(())
    }

    fn retryable(e: &ZkError) -> bool {
        matches!(e, ZkError::ConnectionLoss | ZkError::OperationTimeout)
    }

    /// Does a queue znode carrying `id` exist at or after the cursor?
    /// Used to deduplicate pushes retried after a transport timeout.
    fn find_seq_node(&self, id: u64, from: u64) -> bool {
        for pos in from.. {
            match self.zk.get_data(&queue_path(pos), false) {
                Ok((data, _)) => {
                    if let Ok(ev) = rmp_serde::from_slice::<ClusterEvent>(&data) {
                        if ev.id == id {
                            debug!(id = format_args!("{id:x}"), pos, "retried event found");
                            return true;
                        }
                    }
                }
                Err(ZkError::NoNode) => return false,
                Err(e) if Self::retryable(&e) => continue,
                Err(e) => {
                    error!(?e, "queue scan failed");
                    return false;
                }
            }
        }
        false
    }

    /// Push one event onto the sequence queue, deduplicating retries.
    fn queue_push(&self, ev: &ClusterEvent) -> anyhow::Result<()> {
        let data = rmp_serde::to_vec_named(ev)?;
        loop {
            match self.zk.create(
                &format!("{QUEUE_ZNODE}/q"),
                data.clone(),
                Acl::open_unsafe().clone(),
                CreateMode::PersistentSequential,
            ) {
                Ok(created) => {
                    let mut st = self.st.lock();
                    if st.first_push {
                        // Start consuming from our own first event.
                        if let Some(seq) = created
                            .rsplit('q')
                            .next()
                            .and_then(|s| s.parse::<u64>().ok())
                        {
                            st.queue_pos = seq;
                        }
                        st.first_push = false;
                        let _ = self.wake.send(Wake::Kick);
                    }
                    return Ok(());
                }
                Err(e) if Self::retryable(&e) => {
                    let from = self.st.lock().queue_pos;
                    if self.find_seq_node(ev.id, from) {
                        return Ok(());
                    }
                    // The create never landed; retry it.
                }
                Err(e) => anyhow::bail!("queue push failed: {e:?}"),
            }
        }
    }

    fn push_kind(&self, kind: EventKind, payload: Vec<u8>) -> anyhow::Result<()> {
        let this = self
            .st
            .lock()
            .this
            .ok_or_else(|| anyhow::anyhow!("driver not joined"))?;
        let ev = ClusterEvent::new(self.ids.next(&this), kind, this, payload);
        self.queue_push(&ev)
    }

    fn member_empty(&self) -> bool {
        self.zk
            .get_children(MEMBER_ZNODE, true)
            .map(|c| c.is_empty())
            .unwrap_or(true)
    }

    fn is_master(&self, st: &ZkState, this: &Node) -> bool {
        match st.tree.iter().find(|(_, (_, gone))| !gone) {
            Some((nid, _)) => *nid == this.nid,
            None => self.member_empty(),
        }
    }

    fn check_join_blocking(&self, joining: Node, opaque: Vec<u8>) -> (JoinResult, Vec<u8>) {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let _ = self.upcalls.send(DriverUpcall::CheckJoin {
            joining,
            opaque,
            reply: reply_tx,
        });
        reply_rx
            .blocking_recv()
            .unwrap_or((JoinResult::Fail, Vec::new()))
    }

    // -- event loop ---------------------------------------------------------

    fn event_loop(self: Arc<Self>, wake: &std_mpsc::Receiver<Wake>) {
        loop {
            if self.st.lock().stopped {
                return;
            }
            while self.step() {}
            self.kick_block();

            match wake.recv_timeout(Duration::from_millis(500)) {
                Ok(Wake::MemberGone(nid)) => self.on_member_gone(nid),
                Ok(Wake::Kick) | Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    error!("zookeeper session lost, shutting down");
                    let _ = self.upcalls.send(DriverUpcall::Shutdown {
                        reason: "zookeeper session lost".to_string(),
                    });
                    return;
                }
            }
        }
    }

    fn on_member_gone(&self, nid: NodeId) {
        let leaver = {
            let mut st = self.st.lock();
            match st.tree.get_mut(&nid) {
                Some((node, gone)) => {
                    *gone = true;
                    Some(*node)
                }
                None => None,
            }
        };
        if let Some(node) = leaver {
            let ev = ClusterEvent::new(self.ids.next(&node), EventKind::Leave, node, Vec::new());
            if let Err(e) = self.queue_push(&ev) {
                warn!(%e, "cannot publish crash leave");
            }
        }
    }

    /// Pop and handle the event at the cursor. Returns `true` on
    /// progress.
    fn step(&self) -> bool {
        let (pos, this) = {
            let st = self.st.lock();
            if st.first_push || st.stopped {
                return false;
            }
            let Some(this) = st.this else { return false };
            (st.queue_pos, this)
        };

        let ev: ClusterEvent = match self.zk.get_data(&queue_path(pos), true) {
            Ok((data, _)) => match rmp_serde::from_slice(&data) {
                Ok(ev) => ev,
                Err(e) => {
                    error!(pos, %e, "undecodable queue event");
                    self.st.lock().queue_pos += 1;
                    return true;
                }
            },
            Err(ZkError::NoNode) => return false,
            Err(e) => {
                warn!(pos, ?e, "queue read failed");
                return false;
            }
        };

        match ev.kind {
            EventKind::JoinRequest => {
                let master = {
                    let st = self.st.lock();
                    self.is_master(&st, &this)
                };
                if !master {
                    // Wait for the master to rewrite this slot.
                    return false;
                }
                let (result, opaque) = self.check_join_blocking(ev.sender, ev.payload.clone());
                let mut resp = ev;
                resp.kind = EventKind::JoinResponse;
                resp.join_result = Some(result);
                resp.payload = opaque;
                resp.members = {
                    let st = self.st.lock();
                    st.tree.values().map(|(n, _)| *n).collect()
                };
                let data = match rmp_serde::to_vec_named(&resp) {
                    Ok(d) => d,
                    Err(e) => {
                        error!(%e, "cannot encode join response");
                        return false;
                    }
                };
                if let Err(e) = self.zk.set_data(&queue_path(pos), data, None) {
                    error!(?e, "cannot answer join request");
                    return false;
                }
                if result == JoinResult::MasterTransfer {
                    info!("master transfer: stepping aside");
                    let _ = self.push_kind(EventKind::Leave, Vec::new());
                    let _ = self.upcalls.send(DriverUpcall::Shutdown {
                        reason: "master transferred to a rejoining node".to_string(),
                    });
                    self.st.lock().stopped = true;
                }
                true
            }
            EventKind::JoinResponse => {
                let mut st = self.st.lock();
                st.queue_pos += 1;
                let result = ev.join_result.unwrap_or(JoinResult::Fail);

                if result == JoinResult::MasterTransfer {
                    st.tree.clear();
                } else if ev.sender.nid == this.nid && st.tree.is_empty() {
                    for member in &ev.members {
                        st.tree.insert(member.nid, (*member, false));
                    }
                }
                if matches!(
                    result,
                    JoinResult::Success | JoinResult::JoinLater | JoinResult::MasterTransfer
                ) {
                    if ev.sender.nid == this.nid {
                        match self.zk.create(
                            &member_path(&ev.sender),
                            Vec::new(),
                            Acl::open_unsafe().clone(),
                            CreateMode::Ephemeral,
                        ) {
                            Ok(_) | Err(ZkError::NodeExists) => {}
                            Err(e) => error!(?e, "cannot create member znode"),
                        }
                    } else {
                        // Arm the crash watch on the new member.
                        let _ = self.zk.exists(&member_path(&ev.sender), true);
                    }
                    st.tree.insert(ev.sender.nid, (ev.sender, false));
                }
                let members: Vec<Node> = st.tree.values().map(|(n, _)| *n).collect();
                drop(st);
                let _ = self.upcalls.send(DriverUpcall::Join {
                    joining: ev.sender,
                    members,
                    result,
                    opaque: ev.payload,
                });
                true
            }
            EventKind::Leave => {
                let mut st = self.st.lock();
                st.queue_pos += 1;
                if st.tree.remove(&ev.sender.nid).is_some() {
                    st.blocks.retain(|(n, _)| n.nid != ev.sender.nid);
                    let members: Vec<Node> = st.tree.values().map(|(n, _)| *n).collect();
                    drop(st);
                    let _ = self.upcalls.send(DriverUpcall::Leave {
                        left: ev.sender,
                        members,
                    });
                }
                true
            }
            EventKind::Block => {
                let mut st = self.st.lock();
                st.queue_pos += 1;
                st.blocks.push_back((ev.sender, false));
                true
            }
            EventKind::Unblock => {
                let mut st = self.st.lock();
                st.queue_pos += 1;
                match st.blocks.pop_front() {
                    Some((sender, callbacked)) => {
                        drop(st);
                        if callbacked {
                            let notify = ClusterEvent::new(
                                self.ids.next(&this),
                                EventKind::Notify,
                                sender,
                                ev.payload,
                            );
                            if let Err(e) = self.queue_push(&notify) {
                                error!(%e, "cannot republish unblock payload");
                            }
                        }
                    }
                    None => {
                        error!("unblock received with no block event pending");
                        debug_assert!(false, "unblock without a preceding block");
                    }
                }
                true
            }
            EventKind::Notify => {
                self.st.lock().queue_pos += 1;
                let _ = self.upcalls.send(DriverUpcall::Notify {
                    sender: ev.sender,
                    payload: ev.payload,
                });
                true
            }
        }
    }

    fn kick_block(&self) {
        let head = {
            let st = self.st.lock();
            st.blocks.front().copied()
        };
        let Some((sender, callbacked)) = head else {
            return;
        };
        if callbacked {
            return;
        }
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let _ = self.upcalls.send(DriverUpcall::Block {
            sender,
            reply: reply_tx,
        });
        let answered = reply_rx.blocking_recv().unwrap_or(false);
        if let Some(front) = self.st.lock().blocks.front_mut() {
            front.1 = answered;
        }
    }
}

#[async_trait]
impl ClusterDriver for ZkDriver {
    async fn join(&self, myself: Node, opaque: Vec<u8>) -> anyhow::Result<()> {
        let inner = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || {
            // A lingering session for our identity means a stale self.
            match inner.zk.exists(&member_path(&myself), false) {
                Ok(Some(_)) => anyhow::bail!("previous session for this node still exists"),
                Ok(None) => {}
                Err(e) => anyhow::bail!("member check failed: {e:?}"),
            }

            // For concurrent bootstraps only one node may proceed first.
            while inner.member_empty() {
                match inner.zk.create(
                    MASTER_ZNODE,
                    Vec::new(),
                    Acl::open_unsafe().clone(),
                    CreateMode::Ephemeral,
                ) {
                    Ok(_) => break, // we are the bootstrap master
                    Err(ZkError::NodeExists) => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => anyhow::bail!("master race failed: {e:?}"),
                }
            }

            inner.st.lock().this = Some(myself);
            let ev = ClusterEvent::new(
                inner.ids.next(&myself),
                EventKind::JoinRequest,
                myself,
                opaque,
            );
            inner.queue_push(&ev)
        })
        .await?
    }

    async fn leave(&self) -> anyhow::Result<()> {
        let inner = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || {
            inner.push_kind(EventKind::Leave, Vec::new())?;
            let this = inner
                .st
                .lock()
                .this
                .ok_or_else(|| anyhow::anyhow!("leave before join"))?;
            match inner.zk.delete(&member_path(&this), None) {
                Ok(()) | Err(ZkError::NoNode) => Ok(()),
                Err(e) => anyhow::bail!("member delete failed: {e:?}"),
            }
        })
        .await?
    }

    async fn notify(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let inner = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || inner.push_kind(EventKind::Notify, payload)).await?
    }

    async fn block(&self) -> anyhow::Result<()> {
        let inner = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || inner.push_kind(EventKind::Block, Vec::new())).await?
    }

    async fn unblock(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let inner = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || inner.push_kind(EventKind::Unblock, payload)).await?
    }

    async fn update_node(&self, node: Node) -> anyhow::Result<()> {
        let mut st = self.0.st.lock();
        st.this = Some(node);
        if let Some(entry) = st.tree.get_mut(&node.nid) {
            entry.0 = node;
        }
        Ok(())
    }
}
