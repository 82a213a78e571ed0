//! herd server -- the node daemon ("sheep") and the snapshot archive
//! ("farm").
//!
//! Subsystems:
//!
//! - **Cluster** ([`cluster`]): membership drivers and the ordered event
//!   bus (local, shepherd, and the feature-gated zookeeper transport)
//! - **Dispatch** ([`dispatch`]): request router and the main loop
//!   serializing cluster ops and membership changes
//! - **Gateway / Peer** ([`gateway`], [`peer`]): replica fan-out and the
//!   local object path
//! - **Sock-pool** ([`sockpool`]): long-lived per-peer connections
//! - **Epoch** ([`epoch`]): the durable membership history
//! - **Vdi** ([`vdi`]): vid allocation and inode operations
//! - **Store** ([`store`]): backend store drivers
//! - **Recovery** ([`recovery`]): epoch-change replica repair
//! - **Farm** ([`farm`]): content-addressed snapshot save/load
//! - **Net** ([`net`]): wire framing, listener, and the cluster client

pub mod cluster;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod epoch;
pub mod farm;
pub mod gateway;
pub mod membership;
pub mod net;
pub mod objlist;
pub mod ops;
pub mod peer;
pub mod pool;
pub mod recovery;
pub mod sockpool;
pub mod store;
pub mod system;
pub mod vdi;

pub use config::ServerConfig;
pub use daemon::{start, NodeHandle};
pub use net::ClusterClient;
pub use system::System;
