//! In-process membership driver.
//!
//! All drivers sharing one [`LocalBus`] see a single append-only event
//! log; each driver consumes it through its own cursor, which yields the
//! same total order trivially. Join requests are answered in place by the
//! master (the event is rewritten into a join response carrying the
//! piggy-backed member list), exactly like the sequence-queue transports,
//! so the upper layers cannot tell the drivers apart.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use herd_core::{Node, NodeId};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::{
    ClusterDriver, ClusterEvent, DriverUpcall, EventIdGen, EventKind, JoinResult, UpcallSender,
};

// ---------------------------------------------------------------------------
// LocalBus
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BusInner {
    log: Vec<ClusterEvent>,
    /// Nodes whose join response has been committed (the analogue of
    /// member znodes).
    presence: BTreeSet<NodeId>,
    /// First joiner wins the bootstrap master race.
    bootstrap_master: Option<NodeId>,
}

/// Shared ordered event log for one in-process cluster.
#[derive(Debug, Default)]
pub struct LocalBus {
    inner: Mutex<BusInner>,
    notify: Notify,
}

fn bus_registry() -> &'static Mutex<HashMap<String, Arc<LocalBus>>> {
    static BUSES: OnceLock<Mutex<HashMap<String, Arc<LocalBus>>>> = OnceLock::new();
    BUSES.get_or_init(|| Mutex::new(HashMap::new()))
}

impl LocalBus {
    /// A process-wide bus shared by every driver created with the same
    /// name.
    #[must_use]
    pub fn named(name: &str) -> Arc<LocalBus> {
        bus_registry()
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// A private bus (tests).
    #[must_use]
    pub fn fresh() -> Arc<LocalBus> {
        Arc::new(LocalBus::default())
    }

    fn push(&self, ev: ClusterEvent) {
        self.inner.lock().log.push(ev);
        self.notify.notify_waiters();
    }

    fn replace(&self, pos: usize, ev: ClusterEvent) {
        let mut inner = self.inner.lock();
        if pos < inner.log.len() {
            inner.log[pos] = ev;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    fn get(&self, pos: usize) -> Option<ClusterEvent> {
        self.inner.lock().log.get(pos).cloned()
    }
}

// ---------------------------------------------------------------------------
// LocalDriver
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DrvState {
    this: Option<Node>,
    cursor: usize,
    /// Known members, ordered by node identity; the first entry is the
    /// master.
    tree: BTreeMap<NodeId, Node>,
    /// FIFO of pending block events: (sender, callbacked).
    blocks: VecDeque<(Node, bool)>,
    stopped: bool,
    loop_running: bool,
}

struct Inner {
    bus: Arc<LocalBus>,
    upcalls: UpcallSender,
    st: tokio::sync::Mutex<DrvState>,
    ids: EventIdGen,
}

/// Membership driver backed by a [`LocalBus`].
#[derive(Clone)]
pub struct LocalDriver(Arc<Inner>);

impl LocalDriver {
    #[must_use]
    pub fn new(bus: Arc<LocalBus>, upcalls: UpcallSender) -> Arc<Self> {
        Arc::new(Self(Arc::new(Inner {
            bus,
            upcalls,
            st: tokio::sync::Mutex::new(DrvState {
                this: None,
                cursor: 0,
                tree: BTreeMap::new(),
                blocks: VecDeque::new(),
                stopped: false,
                loop_running: false,
            }),
            ids: EventIdGen::new(),
        })))
    }
}

impl Inner {
    fn is_master(&self, st: &DrvState, this: &Node) -> bool {
        match st.tree.keys().next() {
            Some(first) => *first == this.nid,
            None => self.bus.inner.lock().bootstrap_master == Some(this.nid),
        }
    }

    async fn check_join(&self, joining: Node, opaque: Vec<u8>) -> (JoinResult, Vec<u8>) {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let _ = self.upcalls.send(DriverUpcall::CheckJoin {
            joining,
            opaque,
            reply: reply_tx,
        });
        reply_rx.await.unwrap_or((JoinResult::Fail, Vec::new()))
    }

    async fn kick_block(&self, st: &mut DrvState) {
        let Some(&(sender, callbacked)) = st.blocks.front() else {
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
        let answered = reply_rx.await.unwrap_or(false);
        if let Some(front) = st.blocks.front_mut() {
            front.1 = answered;
        }
    }

    /// Process the event at the cursor. Returns `true` when the loop
    /// should immediately try again.
    async fn step(&self) -> bool {
        let mut st = self.st.lock().await;
        let Some(this) = st.this else {
            return false;
        };

        let Some(ev) = self.bus.get(st.cursor) else {
            // Queue exhausted: only now may a block event fire, so
            // notifies and membership changes always advance first.
            self.kick_block(&mut st).await;
            return false;
        };

        match ev.kind {
            EventKind::JoinRequest => {
                if !self.is_master(&st, &this) {
                    // Await the master rewriting this slot into a
                    // response.
                    return false;
                }
                let (result, opaque) = self.check_join(ev.sender, ev.payload.clone()).await;
                debug!(joining = %ev.sender, ?result, "answering join request");
                let mut resp = ev;
                resp.kind = EventKind::JoinResponse;
                resp.join_result = Some(result);
                resp.payload = opaque;
                resp.members = st.tree.values().copied().collect();
                self.bus.replace(st.cursor, resp);

                if result == JoinResult::MasterTransfer {
                    // The joiner knows a newer cluster than we do: hand
                    // it mastership and step aside.
                    info!("master transfer: stepping aside");
                    let id = self.ids.next(&this);
                    self.bus
                        .push(ClusterEvent::new(id, EventKind::Leave, this, Vec::new()));
                    let _ = self.upcalls.send(DriverUpcall::Shutdown {
                        reason: "master transferred to a rejoining node".to_string(),
                    });
                    st.stopped = true;
                }
                true
            }
            EventKind::JoinResponse => {
                st.cursor += 1;
                let result = ev.join_result.unwrap_or(JoinResult::Fail);

                if result == JoinResult::MasterTransfer {
                    // Single-node bootstrap view: only the joiner
                    // remains.
                    st.tree.clear();
                } else if ev.sender.nid == this.nid && st.tree.is_empty() {
                    for member in &ev.members {
                        st.tree.insert(member.nid, *member);
                    }
                }

                if matches!(
                    result,
                    JoinResult::Success | JoinResult::JoinLater | JoinResult::MasterTransfer
                ) {
                    self.bus.inner.lock().presence.insert(ev.sender.nid);
                    st.tree.insert(ev.sender.nid, ev.sender);
                }

                let members: Vec<Node> = st.tree.values().copied().collect();
                let _ = self.upcalls.send(DriverUpcall::Join {
                    joining: ev.sender,
                    members,
                    result,
                    opaque: ev.payload,
                });
                true
            }
            EventKind::Leave => {
                st.cursor += 1;
                self.bus.inner.lock().presence.remove(&ev.sender.nid);
                if st.tree.remove(&ev.sender.nid).is_some() {
                    st.blocks.retain(|(n, _)| n.nid != ev.sender.nid);
                    let members: Vec<Node> = st.tree.values().copied().collect();
                    let _ = self.upcalls.send(DriverUpcall::Leave {
                        left: ev.sender,
                        members,
                    });
                } else {
                    debug!(node = %ev.sender, "leave from unknown node, ignored");
                }
                true
            }
            EventKind::Block => {
                st.cursor += 1;
                st.blocks.push_back((ev.sender, false));
                true
            }
            EventKind::Unblock => {
                st.cursor += 1;
                match st.blocks.pop_front() {
                    Some((sender, callbacked)) => {
                        if callbacked {
                            // The section owner republishes the result
                            // as an ordered notify for every member.
                            let id = self.ids.next(&this);
                            self.bus.push(ClusterEvent::new(
                                id,
                                EventKind::Notify,
                                sender,
                                ev.payload,
                            ));
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
                st.cursor += 1;
                let _ = self.upcalls.send(DriverUpcall::Notify {
                    sender: ev.sender,
                    payload: ev.payload,
                });
                true
            }
        }
    }
}

async fn event_loop(inner: Arc<Inner>) {
    loop {
        // Register for wakeups before inspecting the log, so a push that
        // lands mid-step is never missed.
        let notified = inner.bus.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let progressed = inner.step().await;
        if inner.st.lock().await.stopped {
            break;
        }
        if !progressed {
            notified.await;
        }
    }
    debug!("local driver event loop stopped");
}

#[async_trait]
impl ClusterDriver for LocalDriver {
    async fn join(&self, myself: Node, opaque: Vec<u8>) -> anyhow::Result<()> {
        let inner = &self.0;
        let mut st = inner.st.lock().await;
        st.this = Some(myself);

        {
            let mut bus = inner.bus.inner.lock();
            if bus.presence.is_empty() && bus.bootstrap_master.is_none() {
                bus.bootstrap_master = Some(myself.nid);
            }
        }

        let id = inner.ids.next(&myself);
        inner.bus.push(ClusterEvent::new(
            id,
            EventKind::JoinRequest,
            myself,
            opaque,
        ));

        if !st.loop_running {
            st.loop_running = true;
            tokio::spawn(event_loop(Arc::clone(inner)));
        }
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        let inner = &self.0;
        let st = inner.st.lock().await;
        let Some(this) = st.this else {
            anyhow::bail!("leave before join");
        };
        drop(st);
        let id = inner.ids.next(&this);
        inner
            .bus
            .push(ClusterEvent::new(id, EventKind::Leave, this, Vec::new()));
        Ok(())
    }

    async fn notify(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let inner = &self.0;
        let st = inner.st.lock().await;
        let Some(this) = st.this else {
            anyhow::bail!("notify before join");
        };
        drop(st);
        let id = inner.ids.next(&this);
        inner
            .bus
            .push(ClusterEvent::new(id, EventKind::Notify, this, payload));
        Ok(())
    }

    async fn block(&self) -> anyhow::Result<()> {
        let inner = &self.0;
        let st = inner.st.lock().await;
        let Some(this) = st.this else {
            anyhow::bail!("block before join");
        };
        drop(st);
        let id = inner.ids.next(&this);
        inner
            .bus
            .push(ClusterEvent::new(id, EventKind::Block, this, Vec::new()));
        Ok(())
    }

    async fn unblock(&self, payload: Vec<u8>) -> anyhow::Result<()> {
        let inner = &self.0;
        let st = inner.st.lock().await;
        let Some(this) = st.this else {
            anyhow::bail!("unblock before join");
        };
        drop(st);
        let id = inner.ids.next(&this);
        inner
            .bus
            .push(ClusterEvent::new(id, EventKind::Unblock, this, payload));
        Ok(())
    }

    async fn update_node(&self, node: Node) -> anyhow::Result<()> {
        let inner = &self.0;
        let mut st = inner.st.lock().await;
        st.this = Some(node);
        st.tree.insert(node.nid, node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use tokio::sync::mpsc;

    use super::*;
    use crate::cluster::UpcallReceiver;

    fn node(last: u8) -> Node {
        Node::new(NodeId::new(IpAddr::from([10, 0, 0, last]), 7000), 1, 0)
    }

    /// Answers check-join with success and records everything else.
    fn spawn_member(
        bus: &Arc<LocalBus>,
    ) -> (Arc<LocalDriver>, mpsc::UnboundedReceiver<String>) {
        let (up_tx, mut up_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let driver = LocalDriver::new(Arc::clone(bus), up_tx);

        tokio::spawn(async move {
            while let Some(up) = up_rx.recv().await {
                match up {
                    DriverUpcall::CheckJoin { reply, .. } => {
                        let _ = reply.send((JoinResult::Success, b"reply".to_vec()));
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
                    DriverUpcall::Block { reply, .. } => {
                        // No cluster ops in these tests.
                        let _ = reply.send(false);
                    }
                    DriverUpcall::Shutdown { .. } => {
                        let _ = log_tx.send("shutdown".to_string());
                    }
                }
            }
        });

        (driver, log_rx)
    }

    async fn recv_until(
        rx: &mut mpsc::UnboundedReceiver<String>,
        n: usize,
    ) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            let entry = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for upcall")
                .expect("upcall channel closed");
            out.push(entry);
        }
        out
    }

    #[tokio::test]
    async fn three_members_observe_identical_event_order() {
        let bus = LocalBus::fresh();
        let (d1, mut l1) = spawn_member(&bus);
        let (d2, mut l2) = spawn_member(&bus);
        let (d3, mut l3) = spawn_member(&bus);

        d1.join(node(1), b"j1".to_vec()).await.unwrap();
        // First joiner sees only its own join.
        assert_eq!(recv_until(&mut l1, 1).await, vec!["join:10.0.0.1:7000:1"]);

        d2.join(node(2), b"j2".to_vec()).await.unwrap();
        recv_until(&mut l1, 1).await;
        recv_until(&mut l2, 2).await;

        d3.join(node(3), b"j3".to_vec()).await.unwrap();
        recv_until(&mut l1, 1).await;
        recv_until(&mut l2, 1).await;
        recv_until(&mut l3, 3).await;

        // Interleave notifies from different members.
        d1.notify(b"a".to_vec()).await.unwrap();
        d3.notify(b"b".to_vec()).await.unwrap();
        d2.notify(b"c".to_vec()).await.unwrap();

        let o1 = recv_until(&mut l1, 3).await;
        let o2 = recv_until(&mut l2, 3).await;
        let o3 = recv_until(&mut l3, 3).await;
        assert_eq!(o1, o2);
        assert_eq!(o2, o3);
        assert_eq!(o1, vec!["notify:a", "notify:b", "notify:c"]);
    }

    #[tokio::test]
    async fn leave_is_observed_with_shrunken_view() {
        let bus = LocalBus::fresh();
        let (d1, mut l1) = spawn_member(&bus);
        let (d2, mut l2) = spawn_member(&bus);

        d1.join(node(1), Vec::new()).await.unwrap();
        recv_until(&mut l1, 1).await;
        d2.join(node(2), Vec::new()).await.unwrap();
        recv_until(&mut l1, 1).await;
        recv_until(&mut l2, 2).await;

        d2.leave().await.unwrap();
        assert_eq!(recv_until(&mut l1, 1).await, vec!["leave:10.0.0.2:7000:1"]);
    }

    #[tokio::test]
    async fn join_responses_piggyback_member_list() {
        let bus = LocalBus::fresh();
        let (d1, mut l1) = spawn_member(&bus);
        let (d2, mut l2) = spawn_member(&bus);

        d1.join(node(1), Vec::new()).await.unwrap();
        recv_until(&mut l1, 1).await;
        d2.join(node(2), Vec::new()).await.unwrap();

        // The joiner's first join upcall reports the full two-node view.
        let joins = recv_until(&mut l2, 2).await;
        assert_eq!(joins[0], "join:10.0.0.1:7000:1");
        assert_eq!(joins[1], "join:10.0.0.2:7000:2");
        recv_until(&mut l1, 1).await;
    }
}
