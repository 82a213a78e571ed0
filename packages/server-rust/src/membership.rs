//! Membership policy: join validation and the epoch/vnode bookkeeping
//! every node performs on membership change.
//!
//! These handlers run on the main loop in the driver's total order, so
//! every node mutates its node list, epoch log, and vnode view
//! identically. The join check runs on the master only; its reply opaque
//! carries the cluster view a joiner needs to bootstrap.

use std::sync::Arc;

use herd_core::proto::{decode, encode, ClusterStatus, VdiStateEntry, SD_PROTO_VER};
use herd_core::{Node, VnodeView};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cluster::JoinResult;
use crate::recovery;
use crate::store::create_store;
use crate::system::System;

// ---------------------------------------------------------------------------
// Join opaques
// ---------------------------------------------------------------------------

/// What a joining node tells the master about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequestMsg {
    pub proto_ver: u8,
    /// The joiner's latest committed epoch (0 when it has no history).
    pub epoch: u32,
    pub ctime: u64,
    pub status: ClusterStatus,
}

/// What the master hands back: the cluster view a joiner adopts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReplyMsg {
    pub proto_ver: u8,
    pub epoch: u32,
    pub nr_copies: u32,
    pub cluster_flags: u16,
    pub ctime: u64,
    pub status: ClusterStatus,
    pub store: String,
    pub inuse: Vec<u64>,
    pub vdi_states: Vec<VdiStateEntry>,
}

/// Build this node's join request opaque.
#[must_use]
pub fn join_message(sys: &System) -> Vec<u8> {
    let msg = JoinRequestMsg {
        proto_ver: SD_PROTO_VER,
        epoch: sys.epoch_store.latest(),
        ctime: sys.ctime(),
        status: sys.status(),
    };
    encode(&msg).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Join check (master only)
// ---------------------------------------------------------------------------

/// Validate a join request against this node's view of the cluster.
pub fn check_join(sys: &Arc<System>, joining: &Node, opaque: &[u8]) -> (JoinResult, Vec<u8>) {
    let Ok(msg) = decode::<JoinRequestMsg>(opaque) else {
        warn!(joining = %joining, "unreadable join message");
        return (JoinResult::Fail, Vec::new());
    };
    if msg.proto_ver != SD_PROTO_VER {
        warn!(joining = %joining, theirs = msg.proto_ver, "protocol version mismatch");
        return (JoinResult::Fail, Vec::new());
    }

    let result = match sys.status() {
        ClusterStatus::Shutdown | ClusterStatus::Killed => JoinResult::Fail,
        ClusterStatus::WaitForFormat => {
            if msg.epoch > 0 {
                // The joiner carries history we do not have: it must
                // bootstrap the cluster and we step aside.
                JoinResult::MasterTransfer
            } else {
                JoinResult::Success
            }
        }
        ClusterStatus::WaitForJoin => {
            let latest = sys.epoch_store.latest();
            if msg.epoch > latest {
                JoinResult::MasterTransfer
            } else {
                match sys.epoch_store.read(latest) {
                    Ok(log) if log.nodes.iter().any(|n| n.nid == joining.nid) => {
                        JoinResult::Success
                    }
                    Ok(_) => {
                        // A stranger cannot join until the previous
                        // membership has reassembled.
                        JoinResult::JoinLater
                    }
                    Err(_) => JoinResult::Success,
                }
            }
        }
        ClusterStatus::Ok | ClusterStatus::Halt => JoinResult::Success,
    };

    let reply = JoinReplyMsg {
        proto_ver: SD_PROTO_VER,
        epoch: sys.epoch(),
        nr_copies: sys.nr_copies(),
        cluster_flags: sys.cluster_flags(),
        ctime: sys.ctime(),
        status: sys.status(),
        store: sys
            .store()
            .map(|s| s.name().to_string())
            .unwrap_or_default(),
        inuse: sys.vdi.bitmap(),
        vdi_states: sys.vdi.state_list(),
    };
    info!(joining = %joining, ?result, "join checked");
    (result, encode(&reply).unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Join / leave handlers (every node, total order)
// ---------------------------------------------------------------------------

/// Apply a completed join: update the node list, bump the epoch, publish
/// the new vnode view, and kick recovery against the previous view.
pub async fn handle_join(
    sys: &Arc<System>,
    joining: &Node,
    members: &[Node],
    result: JoinResult,
    opaque: &[u8],
) {
    match result {
        JoinResult::Fail | JoinResult::JoinLater => {
            if sys.is_self(joining) {
                error!(?result, "this node was refused by the cluster");
                sys.set_status(ClusterStatus::Killed);
            } else {
                info!(joining = %joining, ?result, "join deferred");
            }
            return;
        }
        JoinResult::Success | JoinResult::MasterTransfer => {}
    }

    sys.set_nodes(members.to_vec());
    let old_view = sys.view();

    if sys.is_self(joining) && !sys.join_finished() {
        adopt_cluster_view(sys, result, opaque);
        sys.set_join_finished();
    }
    sys.sockpool.add_group(members);
    info!(joining = %joining, nr_members = members.len(), "membership grew");

    match sys.status() {
        ClusterStatus::Ok | ClusterStatus::Halt => {
            bump_epoch_and_recover(sys, old_view, members).await;
        }
        ClusterStatus::WaitForJoin => {
            let latest = sys.epoch_store.latest();
            let all_back = match sys.epoch_store.read(latest) {
                Ok(log) => log
                    .nodes
                    .iter()
                    .all(|n| members.iter().any(|m| m.nid == n.nid)),
                Err(_) => true,
            };
            if all_back || result == JoinResult::MasterTransfer {
                info!("previous membership reassembled");
                sys.set_status(ClusterStatus::Ok);
                bump_epoch_and_recover(sys, old_view, members).await;
            } else {
                sys.publish_view(VnodeView::new(members));
            }
        }
        _ => {
            sys.publish_view(VnodeView::new(members));
        }
    }
}

/// Apply a member departure: shrink the view, bump the epoch, recover.
pub async fn handle_leave(sys: &Arc<System>, left: &Node, members: &[Node]) {
    info!(left = %left, nr_members = members.len(), "membership shrank");
    sys.set_nodes(members.to_vec());
    sys.sockpool.del_node(left.nid);
    let old_view = sys.view();

    match sys.status() {
        ClusterStatus::Ok | ClusterStatus::Halt => {
            bump_epoch_and_recover(sys, old_view, members).await;
        }
        _ => {
            sys.publish_view(VnodeView::new(members));
        }
    }
}

/// Adopt the cluster view carried by the join reply (or, for a master
/// transfer, from our own durable state).
fn adopt_cluster_view(sys: &Arc<System>, result: JoinResult, opaque: &[u8]) {
    if result == JoinResult::MasterTransfer {
        let latest = sys.epoch_store.latest();
        sys.set_epoch(latest);
        sys.set_status(ClusterStatus::Ok);
        info!(epoch = latest, "bootstrapping cluster from local state");
        return;
    }

    let Ok(reply) = decode::<JoinReplyMsg>(opaque) else {
        warn!("join reply carried no readable cluster view");
        return;
    };
    sys.set_epoch(reply.epoch);
    if reply.nr_copies != 0 {
        sys.set_nr_copies(reply.nr_copies);
    }
    sys.set_cluster_flags(reply.cluster_flags);
    sys.set_ctime(reply.ctime);
    sys.vdi.load_bitmap(reply.inuse);
    sys.vdi.load_states(&reply.vdi_states);
    sys.set_status(reply.status);

    // Joining a formatted cluster: bring up the same store driver.
    if sys.store().is_none() && !reply.store.is_empty() {
        match create_store(&reply.store, &sys.config.obj_dir()) {
            Ok(store) => {
                if let Err(e) = store.init() {
                    error!(%e, "cannot initialize store after join");
                    return;
                }
                if let Ok(oids) = store.list() {
                    sys.objlist.seed(oids);
                }
                sys.set_store(store);
                if let Err(e) = sys.save_cluster_config(&reply.store) {
                    warn!(%e, "cannot persist cluster config after join");
                }
            }
            Err(e) => error!(store = %reply.store, %e, "unknown store driver from join reply"),
        }
    }
}

/// Shared epilogue of every membership change once the cluster runs:
/// next epoch, durable log, fresh view, recovery against the old view.
async fn bump_epoch_and_recover(sys: &Arc<System>, old_view: Arc<VnodeView>, members: &[Node]) {
    let epoch = sys.epoch() + 1;
    sys.set_epoch(epoch);
    if let Err(e) = sys.epoch_store.write(epoch, members, sys.wall_clock_ms()) {
        error!(epoch, %e, "cannot persist epoch log");
    }

    // A freshly bootstrapped node has no published view yet; recovery
    // then runs against the last committed membership, fetched from a
    // peer when this node joined after that epoch was logged.
    let old_view = if old_view.nr_nodes() == 0 && epoch >= 2 {
        match sys.epoch_store.read(epoch - 1) {
            Ok(log) => Arc::new(VnodeView::new(&log.nodes)),
            Err(_) => match recovery::read_epoch_remote(sys, epoch - 1).await {
                Some(log) => Arc::new(VnodeView::new(&log.nodes)),
                None => old_view,
            },
        }
    } else {
        old_view
    };

    let new_view = Arc::new(VnodeView::new(members));
    sys.publish_view(VnodeView::new(members));
    sys.set_status(if sys.have_enough_zones() {
        ClusterStatus::Ok
    } else {
        ClusterStatus::Halt
    });

    recovery::start(sys, old_view, new_view, epoch);
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use herd_core::NodeId;

    use super::*;
    use crate::config::ServerConfig;

    fn test_system() -> (tempfile::TempDir, Arc<System>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            base_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let node = config.node_with_port(7000);
        let sys = System::new(config, node).unwrap();
        (dir, sys)
    }

    fn node(last: u8) -> Node {
        Node::new(NodeId::new(IpAddr::from([10, 0, 0, last]), 7000), 1, 0)
    }

    #[test]
    fn fresh_cluster_accepts_fresh_joiner() {
        let (_d, sys) = test_system();
        let opaque = join_message(&sys);
        let (result, reply) = check_join(&sys, &node(2), &opaque);
        assert_eq!(result, JoinResult::Success);
        let reply: JoinReplyMsg = decode(&reply).unwrap();
        assert_eq!(reply.status, ClusterStatus::WaitForFormat);
    }

    #[test]
    fn fresh_cluster_defers_to_joiner_with_history() {
        let (_d, sys) = test_system();
        let msg = JoinRequestMsg {
            proto_ver: SD_PROTO_VER,
            epoch: 5,
            ctime: 0,
            status: ClusterStatus::WaitForJoin,
        };
        let (result, _) = check_join(&sys, &node(2), &encode(&msg).unwrap());
        assert_eq!(result, JoinResult::MasterTransfer);
    }

    #[test]
    fn waiting_cluster_rejects_strangers_until_reassembled() {
        let (_d, sys) = test_system();
        sys.epoch_store.write(3, &[node(1), node(2)], 1).unwrap();
        sys.set_epoch(3);
        sys.set_status(ClusterStatus::WaitForJoin);

        let msg = JoinRequestMsg {
            proto_ver: SD_PROTO_VER,
            epoch: 3,
            ctime: 0,
            status: ClusterStatus::WaitForJoin,
        };
        let opaque = encode(&msg).unwrap();

        // A node from the last committed epoch may return.
        let (result, _) = check_join(&sys, &node(2), &opaque);
        assert_eq!(result, JoinResult::Success);

        // A stranger must wait.
        let (result, _) = check_join(&sys, &node(9), &opaque);
        assert_eq!(result, JoinResult::JoinLater);

        // A node with a newer epoch takes over.
        let newer = JoinRequestMsg {
            proto_ver: SD_PROTO_VER,
            epoch: 4,
            ctime: 0,
            status: ClusterStatus::WaitForJoin,
        };
        let (result, _) = check_join(&sys, &node(2), &encode(&newer).unwrap());
        assert_eq!(result, JoinResult::MasterTransfer);
    }

    #[test]
    fn version_mismatch_is_refused() {
        let (_d, sys) = test_system();
        let msg = JoinRequestMsg {
            proto_ver: SD_PROTO_VER + 1,
            epoch: 0,
            ctime: 0,
            status: ClusterStatus::WaitForFormat,
        };
        let (result, _) = check_join(&sys, &node(2), &encode(&msg).unwrap());
        assert_eq!(result, JoinResult::Fail);
    }

    #[tokio::test]
    async fn join_of_member_bumps_epoch_when_running() {
        let (_d, sys) = test_system();
        let me = sys.this_node();
        sys.set_nodes(vec![me]);
        sys.publish_view(VnodeView::new(&[me]));
        sys.set_status(ClusterStatus::Ok);
        sys.set_epoch(1);
        sys.epoch_store.write(1, &[me], 1).unwrap();
        sys.set_join_finished();

        let members = vec![me, node(2)];
        handle_join(&sys, &node(2), &members, JoinResult::Success, &[]).await;

        assert_eq!(sys.epoch(), 2);
        assert_eq!(sys.epoch_store.latest(), 2);
        assert_eq!(sys.view().nr_nodes(), 2);
        assert_eq!(sys.nodes().len(), 2);
    }

    #[tokio::test]
    async fn leave_bumps_epoch_and_shrinks_view() {
        let (_d, sys) = test_system();
        let me = sys.this_node();
        let other = node(2);
        sys.set_nodes(vec![me, other]);
        sys.publish_view(VnodeView::new(&[me, other]));
        sys.set_status(ClusterStatus::Ok);
        sys.set_epoch(2);
        sys.epoch_store.write(2, &[me, other], 1).unwrap();
        sys.set_join_finished();

        handle_leave(&sys, &other, &[me]).await;
        assert_eq!(sys.epoch(), 3);
        assert_eq!(sys.view().nr_nodes(), 1);
    }

    #[tokio::test]
    async fn refused_self_join_kills_the_node() {
        let (_d, sys) = test_system();
        let me = sys.this_node();
        handle_join(&sys, &me, &[me], JoinResult::Fail, &[]).await;
        assert_eq!(sys.status(), ClusterStatus::Killed);
    }
}
