//! Node assembly: wire the context, dispatcher, listener, and
//! membership driver together and join the cluster.

use std::sync::Arc;

use herd_core::proto::ClusterStatus;
use tokio::net::TcpListener;
use tracing::info;

use crate::cluster;
use crate::config::ServerConfig;
use crate::dispatch::{self, MainHandle};
use crate::membership;
use crate::net::server;
use crate::system::System;

/// A running node.
pub struct NodeHandle {
    pub sys: Arc<System>,
    pub main: MainHandle,
    pub local_addr: std::net::SocketAddr,
}

impl NodeHandle {
    /// Gracefully leave the cluster.
    pub async fn leave(&self) -> anyhow::Result<()> {
        if let Some(driver) = self.sys.cluster_driver() {
            driver.leave().await?;
        }
        self.sys.set_status(ClusterStatus::Shutdown);
        Ok(())
    }

    /// Wait until one membership change has settled. Purely a
    /// convenience for callers that just started the node.
    pub async fn wait_for_join(&self) {
        for _ in 0..200 {
            if self.sys.join_finished() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }
}

/// Start a node: bind the listener, start the main loop, connect the
/// membership driver, and announce the join.
pub async fn start(config: ServerConfig) -> anyhow::Result<NodeHandle> {
    let listener = TcpListener::bind((config.addr, config.port)).await?;
    let local_addr = listener.local_addr()?;
    let this_node = config.node_with_port(local_addr.port());

    let sys = System::new(config.clone(), this_node)?;
    let (main, upcalls, _loop_task) = dispatch::start_main_loop(Arc::clone(&sys));

    let driver = cluster::create_driver(
        &config.cluster_driver,
        config.cluster_option.as_deref(),
        upcalls,
    )
    .await?;
    sys.set_cluster_driver(Arc::clone(&driver));

    {
        let sys = Arc::clone(&sys);
        let main = main.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(sys, main, listener).await {
                tracing::error!(%e, "request listener failed");
            }
        });
    }

    let join_msg = membership::join_message(&sys);
    driver.join(this_node, join_msg).await?;
    info!(node = %this_node, addr = %local_addr, "node started");

    Ok(NodeHandle {
        sys,
        main,
        local_addr,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use herd_core::inode::Inode;
    use herd_core::oid::{vid_to_data_oid, vid_to_vdi_oid, SD_DATA_OBJ_SIZE};
    use herd_core::proto::ResultCode;

    use super::*;
    use crate::farm::{ClusterIo, Farm};
    use crate::net::ClusterClient;

    fn unique_bus() -> String {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "test-bus-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::SeqCst)
        )
    }

    async fn start_cluster(
        dir: &tempfile::TempDir,
        n: usize,
        copies: u32,
    ) -> (Vec<NodeHandle>, ClusterClient) {
        let bus = unique_bus();
        let mut handles = Vec::new();
        for i in 0..n {
            let config = ServerConfig {
                base_dir: dir.path().join(format!("node{i}")),
                addr: [127, 0, 0, 1].into(),
                port: 0,
                zone: i as u32 + 1,
                space: 1 << 30,
                cluster_driver: "local".to_string(),
                cluster_option: Some(bus.clone()),
                ..ServerConfig::default()
            };
            let handle = start(config).await.unwrap();
            handle.wait_for_join().await;
            assert!(handle.sys.join_finished(), "node {i} failed to join");
            handles.push(handle);
        }

        let client = ClusterClient::new(handles[0].local_addr);
        client.make_fs("plain", copies).await.unwrap();
        wait_all_ok(&handles).await;
        (handles, client)
    }

    async fn wait_all_ok(handles: &[NodeHandle]) {
        for _ in 0..200 {
            if handles
                .iter()
                .all(|h| h.sys.status() == ClusterStatus::Ok)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "cluster never reached OK: {:?}",
            handles.iter().map(|h| h.sys.status()).collect::<Vec<_>>()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_node_replicated_write_reads_back_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let (handles, client) = start_cluster(&dir, 3, 3).await;

        let oid = 0x0080_0000_0000_0001;
        let payload = vec![0xab; 4096];
        client
            .write_object(oid, &payload, 0, 3, true)
            .await
            .unwrap();

        // Every peer stores the bytes locally.
        for handle in &handles {
            let store = handle.sys.store().unwrap();
            assert!(store.exist(oid), "replica missing on {}", handle.local_addr);
        }

        // Any node serves the same bytes back through its gateway.
        for handle in &handles {
            let gateway = ClusterClient::new(handle.local_addr);
            let read = gateway.read_object(oid, 4096, 0).await.unwrap();
            assert_eq!(read, payload, "divergent read via {}", handle.local_addr);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn zero_runs_are_trimmed_and_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let (_handles, client) = start_cluster(&dir, 3, 3).await;

        // 64 KiB window: zero first half, 0x5a second half.
        let oid = vid_to_data_oid(9, 0);
        let mut payload = vec![0u8; 64 << 10];
        payload[32 << 10..].fill(0x5a);
        client
            .write_object(oid, &payload, 0, 3, true)
            .await
            .unwrap();

        let read = client.read_object(oid, (64 << 10) as u32, 0).await.unwrap();
        assert_eq!(read, payload);

        // Reading past the written window yields zeros (sparse object).
        let tail = client
            .read_object(oid, 4096, SD_DATA_OBJ_SIZE - 4096)
            .await
            .unwrap();
        assert_eq!(tail, vec![0u8; 4096]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_name_creates_resolve_to_one_vdi() {
        let dir = tempfile::tempdir().unwrap();
        let (handles, _client) = start_cluster(&dir, 3, 3).await;

        let c1 = ClusterClient::new(handles[0].local_addr);
        let c2 = ClusterClient::new(handles[1].local_addr);
        let (r1, r2) = tokio::join!(
            c1.create_vdi("dup", 4 * SD_DATA_OBJ_SIZE, 0, 3),
            c2.create_vdi("dup", 4 * SD_DATA_OBJ_SIZE, 0, 3),
        );

        // The cluster-wide serialization lets exactly one win.
        let outcomes = [r1, r2];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(ResultCode::VdiExist))));

        // The in-use bit is set exactly once on every node.
        for handle in &handles {
            let bits: u32 = handle
                .sys
                .vdi
                .bitmap()
                .iter()
                .map(|w| w.count_ones())
                .sum();
            assert_eq!(bits, 1, "bitmap droop on {}", handle.local_addr);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshot_round_trip_through_a_live_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let (handles, client) = start_cluster(&dir, 3, 3).await;

        let vid = client
            .create_vdi("disk0", 2 * SD_DATA_OBJ_SIZE, 0, 3)
            .await
            .unwrap();

        // Two data objects with distinct content, wired into the inode.
        let a = vid_to_data_oid(vid, 0);
        let b = vid_to_data_oid(vid, 1);
        client.write_object(a, &vec![0x11; 4096], 0, 3, true).await.unwrap();
        client.write_object(b, &vec![0x22; 8192], 0, 3, true).await.unwrap();

        let inode_oid = vid_to_vdi_oid(vid);
        let bytes = client
            .read_object(inode_oid, SD_DATA_OBJ_SIZE as u32, 0)
            .await
            .unwrap();
        let mut inode = Inode::from_bytes(&bytes).unwrap();
        inode.data_vdi_id[0] = vid;
        inode.data_vdi_id[1] = vid;
        client
            .write_object(inode_oid, &inode.to_bytes().unwrap(), 0, 3, true)
            .await
            .unwrap();

        let farm = Farm::init(&dir.path().join("farm")).unwrap();
        let io: Arc<dyn ClusterIo> = Arc::new(ClusterClient::new(handles[0].local_addr));
        farm.save_snapshot("v1", Arc::clone(&io)).await.unwrap();

        client.delete_vdi("disk0").await.unwrap();
        assert_eq!(
            client.vdi_info("disk0").await.unwrap_err(),
            ResultCode::NoVdi
        );

        farm.load_snapshot(None, Some("v1"), io).await.unwrap();

        // The vdi is registered again and the object bytes are back.
        let (restored_vid, copies) = client.vdi_info("disk0").await.unwrap();
        assert_ne!(restored_vid, 0);
        assert_eq!(copies, 3);
        assert_eq!(
            client.read_object(a, 4096, 0).await.unwrap(),
            vec![0x11; 4096]
        );
        assert_eq!(
            client.read_object(b, 8192, 0).await.unwrap(),
            vec![0x22; 8192]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn recovery_pulls_objects_to_a_new_node() {
        let dir = tempfile::tempdir().unwrap();
        let (handles, client) = start_cluster(&dir, 2, 2).await;

        // Pin the owning vdi to three copies so the new placement is
        // guaranteed to include a third node once one exists.
        client.notify_vdi_add(5, 3).await.unwrap();

        // With two zones the write lands on both existing members.
        let oid = vid_to_data_oid(5, 0);
        client
            .write_object(oid, &vec![0x77; 4096], 0, 3, true)
            .await
            .unwrap();

        // A third node joins afterwards; the new placement makes it a
        // replica, and recovery must pull the object over.
        let bus = handles[0]
            .sys
            .config
            .cluster_option
            .clone()
            .expect("local bus name");
        let config = ServerConfig {
            base_dir: dir.path().join("node-late"),
            addr: [127, 0, 0, 1].into(),
            port: 0,
            zone: 9,
            space: 1 << 30,
            cluster_driver: "local".to_string(),
            cluster_option: Some(bus),
            ..ServerConfig::default()
        };
        let late = start(config).await.unwrap();
        late.wait_for_join().await;

        let mut recovered = false;
        for _ in 0..200 {
            if late
                .sys
                .store()
                .map_or(false, |s| s.exist(oid))
            {
                recovered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(recovered, "late joiner never received the object");

        // The pulled replica serves reads directly.
        let gateway = ClusterClient::new(late.local_addr);
        let read = gateway.read_object(oid, 4096, 0).await.unwrap();
        assert_eq!(read, vec![0x77; 4096]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leave_bumps_epoch_on_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let (handles, _client) = start_cluster(&dir, 3, 3).await;
        let epoch_before = handles[0].sys.epoch();

        handles[2].leave().await.unwrap();

        for _ in 0..200 {
            if handles[0].sys.epoch() > epoch_before && handles[1].sys.epoch() > epoch_before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(handles[0].sys.epoch(), epoch_before + 1);
        assert_eq!(handles[1].sys.epoch(), epoch_before + 1);
        assert_eq!(handles[0].sys.nodes().len(), 2);

        // The committed epoch log matches on the survivors.
        let log0 = handles[0].sys.epoch_store.read(epoch_before + 1).unwrap();
        let log1 = handles[1].sys.epoch_store.read(epoch_before + 1).unwrap();
        assert_eq!(log0.nodes, log1.nodes);
    }
}
