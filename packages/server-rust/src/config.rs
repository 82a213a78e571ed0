//! Node configuration and the persisted cluster config file.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use herd_core::{Node, NodeId};
use serde::{Deserialize, Serialize};

/// Default client/peer listener port.
pub const DEFAULT_PORT: u16 = 7000;

/// Default replica count for a freshly formatted cluster.
pub const SD_DEFAULT_COPIES: u32 = 3;

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Static per-node configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root of all persisted state (`obj/`, `epoch/`, `config`).
    pub base_dir: PathBuf,
    pub addr: IpAddr,
    pub port: u16,
    /// Optional dedicated data-plane listener.
    pub io_addr: Option<IpAddr>,
    pub io_port: u16,
    /// Failure domain this node belongs to.
    pub zone: u32,
    /// Advertised capacity in bytes.
    pub space: u64,
    /// Membership driver name (`local`, `shepherd`, `zookeeper`).
    pub cluster_driver: String,
    /// Driver-specific option (e.g., the shepherd `host:port`).
    pub cluster_option: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/herd"),
            addr: IpAddr::from([127, 0, 0, 1]),
            port: DEFAULT_PORT,
            io_addr: None,
            io_port: 0,
            zone: 0,
            space: 0,
            cluster_driver: "local".to_string(),
            cluster_option: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn obj_dir(&self) -> PathBuf {
        self.base_dir.join("obj")
    }

    #[must_use]
    pub fn epoch_dir(&self) -> PathBuf {
        self.base_dir.join("epoch")
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    /// The node identity this configuration describes, with `port`
    /// substituted when the listener bound an ephemeral port.
    #[must_use]
    pub fn node_with_port(&self, port: u16) -> Node {
        let nid = match self.io_addr {
            Some(io) => NodeId::with_io(self.addr, port, io, self.io_port),
            None => NodeId::new(self.addr, port),
        };
        Node::new(nid, self.zone, self.space)
    }
}

// ---------------------------------------------------------------------------
// Persisted cluster config
// ---------------------------------------------------------------------------

/// The `<base>/config` file: cluster-wide parameters fixed at format time
/// plus this node's advertised space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfigFile {
    pub store: String,
    pub nr_copies: u32,
    pub flags: u16,
    pub ctime: u64,
    pub space: u64,
}

impl ClusterConfigFile {
    /// Load the config file, returning `None` when the cluster has never
    /// been formatted.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist atomically via a temp file rename.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = rmp_serde::to_vec_named(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");

        assert!(ClusterConfigFile::load(&path).unwrap().is_none());

        let cfg = ClusterConfigFile {
            store: "plain".to_string(),
            nr_copies: 3,
            flags: 0,
            ctime: 1_700_000_000_000,
            space: 1 << 30,
        };
        cfg.save(&path).unwrap();
        assert_eq!(ClusterConfigFile::load(&path).unwrap(), Some(cfg));
    }

    #[test]
    fn node_with_port_substitutes_listener_port() {
        let cfg = ServerConfig::default();
        let node = cfg.node_with_port(12345);
        assert_eq!(node.nid.port, 12345);
        assert_eq!(node.zone, 0);
    }
}
