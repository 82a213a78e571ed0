//! Snapshot save/load pipelines.
//!
//! Saving walks the cluster's object list on an ordered pool: each
//! worker asks the owning replica for the object's content hash, skips
//! archival when the blob already exists, otherwise reads the object
//! through the gateway and stores it; the ordered completion callback
//! appends trunk entries in submission order. Loading walks the trunk on
//! a dynamic pool, writing objects back through the gateway and
//! re-registering restored vdis once all workers finish.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use herd_core::inode::Inode;
use herd_core::oid::{data_obj_size, is_vdi_obj, oid_to_vid, SD_DATA_OBJ_SIZE};
use herd_core::proto::{ResultCode, Sha1Digest};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::sha1_file::Sha1Store;
use super::snap::{self, SnapLog, SnapLogEntry};
use super::trunk::{self, TrunkEntry};
use crate::pool::{self, ErrorFlag};

// ---------------------------------------------------------------------------
// ClusterIo
// ---------------------------------------------------------------------------

/// The cluster operations the farm consumes.
///
/// Implemented by the TCP cluster client for live clusters and by
/// in-memory fakes in tests.
#[async_trait]
pub trait ClusterIo: Send + Sync {
    /// Fully-expanded object read.
    async fn read_object(&self, oid: u64, length: u32, offset: u64)
        -> Result<Vec<u8>, ResultCode>;

    /// Replicated object write.
    async fn write_object(
        &self,
        oid: u64,
        data: &[u8],
        offset: u64,
        copies: u32,
        create: bool,
    ) -> Result<(), ResultCode>;

    /// Content hash of an object, asked of its replicas.
    async fn object_sha1(
        &self,
        oid: u64,
        tgt_epoch: u32,
        nr_copies: u32,
    ) -> Result<Sha1Digest, ResultCode>;

    /// Mark a restored vid in the cluster-wide bitmap and install its
    /// replication state.
    async fn notify_vdi_add(&self, vid: u32, nr_copies: u32) -> Result<(), ResultCode>;

    /// Register a working vdi on top of a restored snapshot vid.
    async fn create_vdi(
        &self,
        name: &str,
        size: u64,
        base_vid: u32,
        nr_copies: u32,
    ) -> Result<u32, ResultCode>;

    /// Every live object in the cluster with its replica count.
    async fn object_list(&self) -> Result<Vec<(u64, u32)>, ResultCode>;

    /// The current cluster epoch.
    fn epoch(&self) -> u32;
}

// ---------------------------------------------------------------------------
// Farm
// ---------------------------------------------------------------------------

/// A snapshot archive rooted at one directory.
#[derive(Debug, Clone)]
pub struct Farm {
    store: Sha1Store,
    log: SnapLog,
}

/// The freshest version of each restored vdi, tracked during load.
#[derive(Debug, Clone)]
struct LastVdi {
    name: String,
    size: u64,
    vid: u32,
    snap_id: u32,
    nr_copies: u32,
}

impl Farm {
    /// Open (and lay out) a farm directory.
    pub fn init(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let store = Sha1Store::new(&dir.join("objects"));
        store.init()?;
        Ok(Self {
            store,
            log: SnapLog::new(&dir.join("snap")),
        })
    }

    #[must_use]
    pub fn blob_store(&self) -> &Sha1Store {
        &self.store
    }

    /// Does a snapshot with this index or tag exist?
    pub fn contains_snapshot(&self, idx: Option<u32>, tag: Option<&str>) -> bool {
        matches!(self.log.resolve(idx, tag), Ok(Some(_)))
    }

    /// All snap-log records.
    pub fn snapshots(&self) -> anyhow::Result<Vec<SnapLogEntry>> {
        self.log.read_all()
    }

    // -- save ---------------------------------------------------------------

    /// Capture the whole cluster state under `tag`; returns the new
    /// snapshot index.
    pub async fn save_snapshot(&self, tag: &str, io: Arc<dyn ClusterIo>) -> anyhow::Result<u32> {
        if self.contains_snapshot(None, Some(tag)) {
            bail!("snapshot tag '{tag}' already exists");
        }
        let idx = self.log.read_all()?.len() as u32 + 1;
        let epoch = io.epoch();

        let objects = io
            .object_list()
            .await
            .map_err(|e| anyhow::anyhow!("cannot list cluster objects: {e}"))?;
        info!(tag, idx, nr_objects = objects.len(), "saving snapshot");

        let flag = ErrorFlag::new();
        let mut trunk_entries: Vec<TrunkEntry> = Vec::with_capacity(objects.len());
        let ok = pool::run_ordered(
            objects,
            pool::default_pool_width(),
            &flag,
            |(oid, nr_copies)| {
                let io = Arc::clone(&io);
                let store = self.store.clone();
                let flag = flag.clone();
                async move {
                    if flag.is_set() {
                        return None;
                    }
                    save_one(&io, &store, &flag, oid, nr_copies, epoch).await
                }
            },
            |entry| trunk_entries.push(entry),
        )
        .await;
        if !ok {
            bail!("snapshot save aborted after a worker failure");
        }

        let trunk_sha1 = trunk::write(&self.store, &trunk_entries)?;
        let snap_sha1 = snap::file_write(&self.store, idx, trunk_sha1)?;
        self.log.append(&SnapLogEntry {
            idx,
            tag: tag.to_string(),
            time_ms: now_ms(),
            sha1: snap_sha1,
        })?;
        info!(tag, idx, nr_objects = trunk_entries.len(), "snapshot saved");
        Ok(idx)
    }

    // -- load ---------------------------------------------------------------

    /// Restore a snapshot selected by index or tag.
    pub async fn load_snapshot(
        &self,
        idx: Option<u32>,
        tag: Option<&str>,
        io: Arc<dyn ClusterIo>,
    ) -> anyhow::Result<()> {
        let entry = self
            .log
            .resolve(idx, tag)?
            .with_context(|| format!("no snapshot matches idx={idx:?} tag={tag:?}"))?;
        let snap = snap::file_read(&self.store, &entry.sha1)?;
        let entries = trunk::read(&self.store, &snap.trunk_sha1)?;
        info!(idx = entry.idx, tag = %entry.tag, nr_objects = entries.len(), "loading snapshot");

        let flag = ErrorFlag::new();
        let last_vdis: Arc<Mutex<HashMap<String, LastVdi>>> = Arc::new(Mutex::new(HashMap::new()));

        let ok = pool::run_dynamic(entries, pool::default_pool_width(), &flag, |entry| {
            let io = Arc::clone(&io);
            let store = self.store.clone();
            let flag = flag.clone();
            let last_vdis = Arc::clone(&last_vdis);
            async move {
                if flag.is_set() {
                    return;
                }
                if let Err(e) = load_one(&io, &store, &last_vdis, entry).await {
                    warn!(oid = format_args!("{:x}", entry.oid), %e, "object restore failed");
                    flag.set();
                }
            }
        })
        .await;
        if !ok {
            bail!("snapshot load aborted after a worker failure");
        }

        // Re-register a working vdi on top of each restored chain head.
        let mut restored: Vec<LastVdi> = last_vdis.lock().values().cloned().collect();
        restored.sort_by(|a, b| a.name.cmp(&b.name));
        for vdi in restored {
            io.create_vdi(&vdi.name, vdi.size, vdi.vid, vdi.nr_copies)
                .await
                .map_err(|e| anyhow::anyhow!("cannot re-register vdi '{}': {e}", vdi.name))?;
        }
        info!(idx = entry.idx, "snapshot loaded");
        Ok(())
    }
}

async fn save_one(
    io: &Arc<dyn ClusterIo>,
    store: &Sha1Store,
    flag: &ErrorFlag,
    oid: u64,
    nr_copies: u32,
    epoch: u32,
) -> Option<TrunkEntry> {
    // Skip archival when the owning replica's hash is already on disk.
    if let Ok(sha1) = io.object_sha1(oid, epoch, nr_copies).await {
        if store.exists(&sha1) {
            return Some(TrunkEntry {
                oid,
                nr_copies,
                sha1,
            });
        }
    }

    let length = data_obj_size(oid).unwrap_or(SD_DATA_OBJ_SIZE) as u32;
    let buf = match io.read_object(oid, length, 0).await {
        Ok(buf) => buf,
        Err(e) => {
            warn!(oid = format_args!("{oid:x}"), %e, "cannot read object for snapshot");
            flag.set();
            return None;
        }
    };

    let store = store.clone();
    let written = tokio::task::spawn_blocking(move || store.write(&buf)).await;
    match written {
        Ok(Ok(sha1)) => Some(TrunkEntry {
            oid,
            nr_copies,
            sha1,
        }),
        Ok(Err(e)) => {
            warn!(oid = format_args!("{oid:x}"), %e, "cannot archive object");
            flag.set();
            None
        }
        Err(_) => {
            flag.set();
            None
        }
    }
}

async fn load_one(
    io: &Arc<dyn ClusterIo>,
    store: &Sha1Store,
    last_vdis: &Arc<Mutex<HashMap<String, LastVdi>>>,
    entry: TrunkEntry,
) -> anyhow::Result<()> {
    let blob = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.read(&entry.sha1)).await??
    };

    io.write_object(entry.oid, &blob, 0, entry.nr_copies, true)
        .await
        .map_err(|e| anyhow::anyhow!("write-back failed: {e}"))?;

    if is_vdi_obj(entry.oid) {
        let vid = oid_to_vid(entry.oid);
        io.notify_vdi_add(vid, entry.nr_copies)
            .await
            .map_err(|e| anyhow::anyhow!("vdi-add notify failed: {e}"))?;

        let inode = Inode::from_bytes(&blob)
            .map_err(|e| anyhow::anyhow!("restored inode undecodable: {e}"))?;
        if !inode.is_deleted() {
            let mut map = last_vdis.lock();
            let keep = map
                .get(&inode.name)
                .map_or(true, |cur| cur.snap_id < inode.snap_id);
            if keep {
                map.insert(
                    inode.name.clone(),
                    LastVdi {
                        name: inode.name.clone(),
                        size: inode.vdi_size,
                        vid,
                        snap_id: inode.snap_id,
                        nr_copies: entry.nr_copies,
                    },
                );
            }
        }
    }
    Ok(())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use herd_core::oid::{vid_to_data_oid, vid_to_vdi_oid};
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    /// In-memory cluster fake.
    #[derive(Default)]
    struct FakeCluster {
        objects: AsyncMutex<BTreeMap<u64, (Vec<u8>, u32)>>,
        vdi_bits: AsyncMutex<BTreeMap<u32, u32>>,
        created: AsyncMutex<Vec<(String, u32)>>,
        next_vid: AtomicU32,
        fail_reads: std::sync::atomic::AtomicBool,
    }

    impl FakeCluster {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_vid: AtomicU32::new(0x100),
                ..Self::default()
            })
        }

        async fn insert(&self, oid: u64, data: Vec<u8>, copies: u32) {
            self.objects.lock().await.insert(oid, (data, copies));
        }
    }

    #[async_trait]
    impl ClusterIo for FakeCluster {
        async fn read_object(
            &self,
            oid: u64,
            length: u32,
            offset: u64,
        ) -> Result<Vec<u8>, ResultCode> {
            if self.fail_reads.load(Ordering::Acquire) {
                return Err(ResultCode::Eio);
            }
            let objects = self.objects.lock().await;
            let (data, _) = objects.get(&oid).ok_or(ResultCode::NoObj)?;
            let start = offset as usize;
            let end = (start + length as usize).min(data.len());
            Ok(data.get(start..end).unwrap_or_default().to_vec())
        }

        async fn write_object(
            &self,
            oid: u64,
            data: &[u8],
            offset: u64,
            copies: u32,
            _create: bool,
        ) -> Result<(), ResultCode> {
            assert_eq!(offset, 0, "farm restores whole objects");
            self.insert(oid, data.to_vec(), copies).await;
            Ok(())
        }

        async fn object_sha1(
            &self,
            oid: u64,
            _tgt_epoch: u32,
            _nr_copies: u32,
        ) -> Result<Sha1Digest, ResultCode> {
            let objects = self.objects.lock().await;
            let (data, _) = objects.get(&oid).ok_or(ResultCode::NoObj)?;
            Ok(super::super::sha1_file::content_sha1(data))
        }

        async fn notify_vdi_add(&self, vid: u32, nr_copies: u32) -> Result<(), ResultCode> {
            self.vdi_bits.lock().await.insert(vid, nr_copies);
            Ok(())
        }

        async fn create_vdi(
            &self,
            name: &str,
            _size: u64,
            base_vid: u32,
            _nr_copies: u32,
        ) -> Result<u32, ResultCode> {
            self.created.lock().await.push((name.to_string(), base_vid));
            Ok(self.next_vid.fetch_add(1, Ordering::SeqCst))
        }

        async fn object_list(&self) -> Result<Vec<(u64, u32)>, ResultCode> {
            Ok(self
                .objects
                .lock()
                .await
                .iter()
                .map(|(&oid, &(_, copies))| (oid, copies))
                .collect())
        }

        fn epoch(&self) -> u32 {
            1
        }
    }

    fn farm() -> (tempfile::TempDir, Farm) {
        let dir = tempfile::tempdir().unwrap();
        let farm = Farm::init(&dir.path().join("farm")).unwrap();
        (dir, farm)
    }

    async fn populate(cluster: &Arc<FakeCluster>) -> (u32, u64, u64) {
        let vid = 7;
        let inode = Inode::new("disk0", 2 * SD_DATA_OBJ_SIZE, vid, 3, 1).unwrap();
        cluster
            .insert(vid_to_vdi_oid(vid), inode.to_bytes().unwrap(), 3)
            .await;
        let a = vid_to_data_oid(vid, 0);
        let b = vid_to_data_oid(vid, 1);
        cluster.insert(a, vec![0xaa; 4096], 3).await;
        cluster.insert(b, vec![0xbb; 8192], 3).await;
        (vid, a, b)
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_bytes() {
        let (_d, farm) = farm();
        let cluster = FakeCluster::new();
        let (vid, a, b) = populate(&cluster).await;

        let idx = farm.save_snapshot("v1", cluster.clone()).await.unwrap();
        assert_eq!(idx, 1);
        assert!(farm.contains_snapshot(None, Some("v1")));

        // Wipe the cluster, then restore.
        cluster.objects.lock().await.clear();
        farm.load_snapshot(None, Some("v1"), cluster.clone())
            .await
            .unwrap();

        let objects = cluster.objects.lock().await;
        assert_eq!(objects.get(&a).unwrap().0, vec![0xaa; 4096]);
        assert_eq!(objects.get(&b).unwrap().0, vec![0xbb; 8192]);
        let inode = Inode::from_bytes(&objects.get(&vid_to_vdi_oid(vid)).unwrap().0).unwrap();
        assert_eq!(inode.name, "disk0");
        drop(objects);

        // The restored vdi was re-registered and its bit set.
        assert_eq!(cluster.vdi_bits.lock().await.get(&vid), Some(&3));
        assert_eq!(
            cluster.created.lock().await.as_slice(),
            &[("disk0".to_string(), vid)]
        );
    }

    #[tokio::test]
    async fn duplicate_tags_are_refused() {
        let (_d, farm) = farm();
        let cluster = FakeCluster::new();
        populate(&cluster).await;

        farm.save_snapshot("v1", cluster.clone()).await.unwrap();
        assert!(farm.save_snapshot("v1", cluster.clone()).await.is_err());
    }

    #[tokio::test]
    async fn second_identical_snapshot_reuses_blobs() {
        let (_d, farm) = farm();
        let cluster = FakeCluster::new();
        let (_, a, _) = populate(&cluster).await;

        farm.save_snapshot("v1", cluster.clone()).await.unwrap();
        let idx = farm.save_snapshot("v2", cluster.clone()).await.unwrap();
        assert_eq!(idx, 2);

        // The data blob for object `a` exists once with refcount 1: the
        // second save skipped archival via the replica hash probe.
        let data = cluster.objects.lock().await.get(&a).unwrap().0.clone();
        let sha1 = content_blob(&data);
        assert_eq!(farm.blob_store().refcount(&sha1), Some(1));
    }

    fn content_blob(data: &[u8]) -> Sha1Digest {
        super::super::sha1_file::content_sha1(data)
    }

    #[tokio::test]
    async fn failed_read_aborts_save_without_log_entry() {
        let (_d, farm) = farm();
        let cluster = FakeCluster::new();
        populate(&cluster).await;
        cluster.fail_reads.store(true, Ordering::Release);

        assert!(farm.save_snapshot("broken", cluster.clone()).await.is_err());
        assert!(!farm.contains_snapshot(None, Some("broken")));
        assert!(farm.snapshots().unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_of_missing_snapshot_fails() {
        let (_d, farm) = farm();
        let cluster = FakeCluster::new();
        assert!(farm
            .load_snapshot(Some(9), None, cluster.clone())
            .await
            .is_err());
    }
}
