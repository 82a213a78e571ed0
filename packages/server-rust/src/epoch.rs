//! The on-disk epoch log.
//!
//! Every committed epoch persists its full node list plus a timestamp at
//! `<base>/epoch/<NNNNNNNN>`. Files are written via temp + rename, so at
//! most one committed list exists per epoch and epoch N+1 only becomes
//! durable after N was. A node that joined after an epoch was committed
//! fetches the missing file from a live peer (`GetEpoch`).

use std::fs;
use std::path::{Path, PathBuf};

use herd_core::proto::{EpochLog, ResultCode};
use herd_core::Node;
use tracing::{debug, warn};

/// Store for `<base>/epoch/<NNNNNNNN>` files.
#[derive(Debug, Clone)]
pub struct EpochStore {
    dir: PathBuf,
}

impl EpochStore {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Create the epoch directory; idempotent.
    pub fn init(&self) -> Result<(), ResultCode> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            warn!(%e, "cannot create epoch directory");
            ResultCode::Eio
        })
    }

    fn path_for(&self, epoch: u32) -> PathBuf {
        self.dir.join(format!("{epoch:08}"))
    }

    /// Persist the node list committed at `epoch`.
    pub fn write(&self, epoch: u32, nodes: &[Node], timestamp_ms: u64) -> Result<(), ResultCode> {
        let log = EpochLog {
            nodes: nodes.to_vec(),
            timestamp_ms,
        };
        let bytes = herd_core::proto::encode(&log)?;
        let path = self.path_for(epoch);
        let tmp = self.dir.join(format!(".tmp-{epoch:08}"));
        let result = (|| -> std::io::Result<()> {
            fs::write(&tmp, &bytes)?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            warn!(epoch, %e, "cannot log epoch");
            return Err(ResultCode::Eio);
        }
        debug!(epoch, nr_nodes = nodes.len(), "epoch logged");
        Ok(())
    }

    /// Read the committed list for `epoch`; `NoTag` when absent locally.
    pub fn read(&self, epoch: u32) -> Result<EpochLog, ResultCode> {
        let bytes = match fs::read(self.path_for(epoch)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ResultCode::NoTag),
            Err(e) => {
                warn!(epoch, %e, "cannot read epoch log");
                return Err(ResultCode::Eio);
            }
        };
        herd_core::proto::decode(&bytes).map_err(|_| ResultCode::Eio)
    }

    /// Highest epoch with a committed log, or 0.
    #[must_use]
    pub fn latest(&self) -> u32 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<u32>().ok()))
            .max()
            .unwrap_or(0)
    }

    /// Remove one epoch file (cluster reformat).
    pub fn remove(&self, epoch: u32) -> Result<(), ResultCode> {
        match fs::remove_file(self.path_for(epoch)) {
            Ok(()) | Err(_) => Ok(()),
        }
    }
}
