//! The shared node context.
//!
//! Everything the request paths need lives behind one explicitly-passed
//! `System` value: cluster status, the epoch counter, the published vnode
//! view, the vdi table, the sock-pool, the backend store, and the epoch
//! log. The main dispatcher task owns all mutation of membership-derived
//! state; worker tasks read through lock-free or read-locked views.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use herd_core::proto::ClusterStatus;
use herd_core::{Node, VnodeView};
use parking_lot::RwLock;
use tracing::info;

use crate::cluster::ClusterDriver;
use crate::config::{ClusterConfigFile, ServerConfig, SD_DEFAULT_COPIES};
use crate::epoch::EpochStore;
use crate::objlist::ObjlistCache;
use crate::sockpool::SockPool;
use crate::store::{create_store, StoreDriver};
use crate::vdi::VdiTable;

/// Recovery bookkeeping.
#[derive(Debug, Default)]
pub struct RecoveryState {
    pub in_progress: AtomicBool,
    pub disabled: AtomicBool,
    /// Nodes that finished recovering the epoch in `.0`.
    pub recovered: parking_lot::Mutex<(u32, Vec<Node>)>,
}

/// The node-wide context.
pub struct System {
    pub config: ServerConfig,
    this_node: RwLock<Node>,
    status: RwLock<ClusterStatus>,
    epoch: AtomicU32,
    nr_copies: AtomicU32,
    cluster_flags: AtomicU32,
    ctime: AtomicU64,
    join_finished: AtomicBool,

    view: ArcSwap<VnodeView>,
    nodes: RwLock<Vec<Node>>,

    pub vdi: VdiTable,
    pub sockpool: Arc<SockPool>,
    store: RwLock<Option<Arc<dyn StoreDriver>>>,
    pub objlist: ObjlistCache,
    pub epoch_store: EpochStore,
    pub recovery: RecoveryState,

    cluster: OnceLock<Arc<dyn ClusterDriver>>,
    main: OnceLock<crate::dispatch::MainHandle>,
}

impl System {
    /// Build the context from configuration, loading any persisted
    /// cluster config to decide the initial status.
    pub fn new(config: ServerConfig, this_node: Node) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.base_dir)?;
        let epoch_store = EpochStore::new(&config.epoch_dir());
        epoch_store
            .init()
            .map_err(|e| anyhow::anyhow!("epoch store init: {e}"))?;

        let sys = Self {
            this_node: RwLock::new(this_node),
            status: RwLock::new(ClusterStatus::WaitForFormat),
            epoch: AtomicU32::new(0),
            nr_copies: AtomicU32::new(SD_DEFAULT_COPIES),
            cluster_flags: AtomicU32::new(0),
            ctime: AtomicU64::new(0),
            join_finished: AtomicBool::new(false),
            view: ArcSwap::new(Arc::new(VnodeView::empty())),
            nodes: RwLock::new(Vec::new()),
            vdi: VdiTable::new(),
            sockpool: SockPool::new(),
            store: RwLock::new(None),
            objlist: ObjlistCache::new(),
            epoch_store,
            recovery: RecoveryState::default(),
            cluster: OnceLock::new(),
            main: OnceLock::new(),
            config,
        };

        if let Some(saved) = ClusterConfigFile::load(&sys.config.config_path())? {
            let store = create_store(&saved.store, &sys.config.obj_dir())
                .map_err(|e| anyhow::anyhow!("unknown store '{}': {e}", saved.store))?;
            store
                .init()
                .map_err(|e| anyhow::anyhow!("store init: {e}"))?;
            if let Ok(oids) = store.list() {
                sys.objlist.seed(oids);
            }
            *sys.store.write() = Some(store);
            sys.nr_copies.store(saved.nr_copies, Ordering::Release);
            sys.cluster_flags
                .store(u32::from(saved.flags), Ordering::Release);
            sys.ctime.store(saved.ctime, Ordering::Release);

            let latest = sys.epoch_store.latest();
            sys.epoch.store(latest, Ordering::Release);
            *sys.status.write() = ClusterStatus::WaitForJoin;
            info!(
                epoch = latest,
                store = %saved.store,
                "previous cluster state found, waiting for join"
            );
        }

        Ok(Arc::new(sys))
    }

    // -- identity ----------------------------------------------------------

    #[must_use]
    pub fn this_node(&self) -> Node {
        *self.this_node.read()
    }

    pub fn set_this_node(&self, node: Node) {
        *self.this_node.write() = node;
    }

    #[must_use]
    pub fn is_self(&self, node: &Node) -> bool {
        node.nid == self.this_node().nid
    }

    // -- status ------------------------------------------------------------

    #[must_use]
    pub fn status(&self) -> ClusterStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ClusterStatus) {
        let mut cur = self.status.write();
        if *cur != status {
            info!(from = ?*cur, to = ?status, "cluster status change");
            *cur = status;
        }
    }

    // -- epoch & cluster parameters ------------------------------------------

    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::Release);
    }

    #[must_use]
    pub fn nr_copies(&self) -> u32 {
        self.nr_copies.load(Ordering::Acquire)
    }

    pub fn set_nr_copies(&self, copies: u32) {
        self.nr_copies.store(copies, Ordering::Release);
    }

    #[must_use]
    pub fn cluster_flags(&self) -> u16 {
        self.cluster_flags.load(Ordering::Acquire) as u16
    }

    pub fn set_cluster_flags(&self, flags: u16) {
        self.cluster_flags.store(u32::from(flags), Ordering::Release);
    }

    #[must_use]
    pub fn ctime(&self) -> u64 {
        self.ctime.load(Ordering::Acquire)
    }

    pub fn set_ctime(&self, ctime: u64) {
        self.ctime.store(ctime, Ordering::Release);
    }

    #[must_use]
    pub fn join_finished(&self) -> bool {
        self.join_finished.load(Ordering::Acquire)
    }

    pub fn set_join_finished(&self) {
        self.join_finished.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn wall_clock_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    // -- membership view -----------------------------------------------------

    /// The published vnode view; lock-free for readers.
    #[must_use]
    pub fn view(&self) -> Arc<VnodeView> {
        self.view.load_full()
    }

    /// Publish a fresh view; the old one stays alive for readers that
    /// already loaded it.
    pub fn publish_view(&self, view: VnodeView) {
        self.view.store(Arc::new(view));
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().clone()
    }

    pub fn set_nodes(&self, mut nodes: Vec<Node>) {
        nodes.sort();
        *self.nodes.write() = nodes;
    }

    /// Enough failure domains for the configured copy count?
    #[must_use]
    pub fn have_enough_zones(&self) -> bool {
        self.view().nr_zones() >= self.nr_copies() as usize
    }

    // -- store ---------------------------------------------------------------

    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn StoreDriver>> {
        self.store.read().clone()
    }

    pub fn set_store(&self, store: Arc<dyn StoreDriver>) {
        *self.store.write() = Some(store);
    }

    // -- cluster driver ------------------------------------------------------

    pub fn set_cluster_driver(&self, driver: Arc<dyn ClusterDriver>) {
        let _ = self.cluster.set(driver);
    }

    #[must_use]
    pub fn cluster_driver(&self) -> Option<Arc<dyn ClusterDriver>> {
        self.cluster.get().cloned()
    }

    pub fn set_main_handle(&self, handle: crate::dispatch::MainHandle) {
        let _ = self.main.set(handle);
    }

    #[must_use]
    pub fn main_handle(&self) -> Option<crate::dispatch::MainHandle> {
        self.main.get().cloned()
    }

    /// Persist the cluster config file reflecting the current state.
    pub fn save_cluster_config(&self, store_name: &str) -> anyhow::Result<()> {
        ClusterConfigFile {
            store: store_name.to_string(),
            nr_copies: self.nr_copies(),
            flags: self.cluster_flags(),
            ctime: self.ctime(),
            space: self.this_node().space,
        }
        .save(&self.config.config_path())
    }
}

#[cfg(test)]
mod tests {
    use herd_core::NodeId;
    use std::net::IpAddr;

    use super::*;

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

    #[test]
    fn fresh_system_waits_for_format() {
        let (_d, sys) = test_system();
        assert_eq!(sys.status(), ClusterStatus::WaitForFormat);
        assert_eq!(sys.epoch(), 0);
        assert!(sys.store().is_none());
    }

    #[test]
    fn formatted_system_waits_for_join_on_restart() {
        let (_d, sys) = test_system();
        let node = Node::new(NodeId::new(IpAddr::from([127, 0, 0, 1]), 7000), 0, 0);

        // Simulate a formatted cluster: store + config + epoch log.
        let store = create_store("plain", &sys.config.obj_dir()).unwrap();
        store.init().unwrap();
        sys.set_nr_copies(2);
        sys.set_ctime(42);
        sys.save_cluster_config("plain").unwrap();
        sys.epoch_store.write(3, &[node], 1).unwrap();

        let config = sys.config.clone();
        drop(sys);
        let reopened = System::new(config, node).unwrap();
        assert_eq!(reopened.status(), ClusterStatus::WaitForJoin);
        assert_eq!(reopened.epoch(), 3);
        assert_eq!(reopened.nr_copies(), 2);
        assert_eq!(reopened.ctime(), 42);
        assert!(reopened.store().is_some());
    }

    #[test]
    fn view_publication_is_atomic_for_readers() {
        let (_d, sys) = test_system();
        let old = sys.view();
        assert_eq!(old.nr_nodes(), 0);

        let node = Node::new(NodeId::new(IpAddr::from([127, 0, 0, 1]), 7000), 0, 0);
        sys.publish_view(VnodeView::new(&[node]));

        // The handle obtained before publication still reads the old view.
        assert_eq!(old.nr_nodes(), 0);
        assert_eq!(sys.view().nr_nodes(), 1);
    }
}
