//! Cluster membership drivers and the ordered event bus.
//!
//! A driver connects this node to the membership layer and delivers a
//! totally-ordered stream of upcalls: every node observes the identical
//! sequence of join-response, leave, notify, and unblock events. Three
//! interchangeable drivers exist:
//!
//! - [`local`]: an in-process bus for single-process clusters and tests
//! - [`shepherd`]: a TCP client of the `herd-shepherd` coordinator
//! - `zookeeper` (cargo feature): a ZooKeeper sequence-znode queue
//!
//! Drivers come from an explicit registry table; there is no implicit
//! registration at load time.

pub mod coordinator;
pub mod local;
pub mod queue;
pub mod shepherd;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use herd_core::{fnv1a_64, fnv1a_64_seed, Node};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Outcome of a join attempt, decided by the master's join check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinResult {
    Success,
    Fail,
    /// The cluster cannot take the node yet; retry later.
    JoinLater,
    /// Join accepted, but the joiner must bootstrap the cluster itself;
    /// the answering master steps aside.
    MasterTransfer,
}

/// Kinds of totally-ordered cluster events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JoinRequest,
    JoinResponse,
    Leave,
    Block,
    Unblock,
    Notify,
}

/// One event on the ordered bus.
///
/// `id` is cluster-unique so a driver that retries a push after a
/// transport timeout can detect that the first attempt landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub id: u64,
    pub kind: EventKind,
    pub sender: Node,
    pub payload: Vec<u8>,
    /// Piggy-backed membership view on join responses.
    pub members: Vec<Node>,
    pub join_result: Option<JoinResult>,
}

impl ClusterEvent {
    #[must_use]
    pub fn new(id: u64, kind: EventKind, sender: Node, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind,
            sender,
            payload,
            members: Vec::new(),
            join_result: None,
        }
    }
}

/// Per-driver generator of cluster-unique event ids: FNV over the node
/// identity chained with a local counter.
#[derive(Debug, Default)]
pub struct EventIdGen {
    seq: AtomicU64,
}

impl EventIdGen {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, node: &Node) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        fnv1a_64_seed(&seq.to_le_bytes(), fnv1a_64(&node.nid.identity_bytes()))
    }
}

// ---------------------------------------------------------------------------
// Upcalls
// ---------------------------------------------------------------------------

/// Ordered upcalls from a driver into the main dispatcher task.
///
/// The dispatcher consumes these strictly in delivery order; reply
/// channels let the driver wait where the contract demands an answer
/// (join checks and block callbacks).
#[derive(Debug)]
pub enum DriverUpcall {
    /// The master validates a join request and fills the reply opaque
    /// with the cluster view the joiner needs.
    CheckJoin {
        joining: Node,
        opaque: Vec<u8>,
        reply: oneshot::Sender<(JoinResult, Vec<u8>)>,
    },
    /// A join completed; invoked exactly once per successful join on
    /// every node, with the identical member list.
    Join {
        joining: Node,
        members: Vec<Node>,
        result: JoinResult,
        opaque: Vec<u8>,
    },
    /// A member left (gracefully or by crash).
    Leave { left: Node, members: Vec<Node> },
    /// An ordered broadcast payload.
    Notify { sender: Node, payload: Vec<u8> },
    /// A block event reached the head of the block queue. The reply is
    /// `true` when this node owns the critical section and has started
    /// its work.
    Block {
        sender: Node,
        reply: oneshot::Sender<bool>,
    },
    /// The driver hit an unrecoverable condition; the node must shut
    /// down cleanly so the rest of the cluster observes a clean leave.
    Shutdown { reason: String },
}

/// Sender half of the driver upcall stream.
pub type UpcallSender = mpsc::UnboundedSender<DriverUpcall>;

/// Receiver half of the driver upcall stream.
pub type UpcallReceiver = mpsc::UnboundedReceiver<DriverUpcall>;

// ---------------------------------------------------------------------------
// Driver trait & registry
// ---------------------------------------------------------------------------

/// A membership driver.
///
/// All methods are fire-toward-the-bus; results of membership changes
/// come back through the upcall stream in total order.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Announce this node to the cluster. `opaque` carries the join
    /// message the master's join check inspects.
    async fn join(&self, myself: Node, opaque: Vec<u8>) -> anyhow::Result<()>;

    /// Leave gracefully.
    async fn leave(&self) -> anyhow::Result<()>;

    /// Broadcast an ordered event to every member (including self).
    async fn notify(&self, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Enter the cluster-wide exclusive section.
    async fn block(&self) -> anyhow::Result<()>;

    /// Exit the exclusive section, piggy-backing the result payload as a
    /// notify delivered to every member.
    async fn unblock(&self, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Republish this node's identity record.
    async fn update_node(&self, node: Node) -> anyhow::Result<()>;
}

/// One registry row.
pub struct DriverInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// The driver registry, populated statically.
pub const DRIVERS: &[DriverInfo] = &[
    DriverInfo {
        name: "local",
        description: "in-process ordered bus (tests, single-process clusters)",
    },
    DriverInfo {
        name: "shepherd",
        description: "TCP client of the herd-shepherd coordinator",
    },
    #[cfg(feature = "zookeeper")]
    DriverInfo {
        name: "zookeeper",
        description: "ZooKeeper sequence-znode queue",
    },
];

/// Instantiate a driver by registry name.
pub async fn create_driver(
    name: &str,
    option: Option<&str>,
    upcalls: UpcallSender,
) -> anyhow::Result<Arc<dyn ClusterDriver>> {
    match name {
        "local" => Ok(local::LocalDriver::new(
            local::LocalBus::named(option.unwrap_or("default")),
            upcalls,
        )),
        "shepherd" => {
            let addr = option.unwrap_or("127.0.0.1:7000");
            Ok(shepherd::ShepherdDriver::connect(addr, upcalls).await?)
        }
        #[cfg(feature = "zookeeper")]
        "zookeeper" => {
            let hosts = option
                .ok_or_else(|| anyhow::anyhow!("zookeeper driver needs a host list option"))?;
            Ok(zookeeper::ZkDriver::connect(hosts, upcalls)?)
        }
        other => anyhow::bail!(
            "unknown cluster driver '{other}' (available: {})",
            DRIVERS
                .iter()
                .map(|d| d.name)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use herd_core::NodeId;

    use super::*;

    #[test]
    fn event_ids_are_unique_per_node_and_sequence() {
        let a = Node::new(NodeId::new(IpAddr::from([10, 0, 0, 1]), 7000), 1, 0);
        let b = Node::new(NodeId::new(IpAddr::from([10, 0, 0, 2]), 7000), 1, 0);
        let id_gen = EventIdGen::new();
        let other_gen = EventIdGen::new();

        let a1 = id_gen.next(&a);
        let a2 = id_gen.next(&a);
        let b1 = other_gen.next(&b);
        assert_ne!(a1, a2);
        assert_ne!(a1, b1);
    }

    #[test]
    fn registry_lists_builtin_drivers() {
        let names: Vec<_> = DRIVERS.iter().map(|d| d.name).collect();
        assert!(names.contains(&"local"));
        assert!(names.contains(&"shepherd"));
    }

    #[tokio::test]
    async fn unknown_driver_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(create_driver("nope", None, tx).await.is_err());
    }
}
