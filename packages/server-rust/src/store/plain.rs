//! Plain file-per-object store.
//!
//! One sparse file per oid under the object directory, named by the hex
//! oid. Creation goes through a temp file plus rename so a half-written
//! object is never visible under its final name.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use herd_core::oid::data_obj_size;
use herd_core::proto::{ResultCode, Sha1Digest};
use tracing::{debug, warn};

use super::StoreDriver;
use crate::farm::sha1_file::content_sha1;

/// The default backend store.
#[derive(Debug)]
pub struct PlainStore {
    dir: PathBuf,
}

impl PlainStore {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, oid: u64) -> PathBuf {
        self.dir.join(format!("{oid:016x}"))
    }

    fn tmp_path_for(&self, oid: u64) -> PathBuf {
        self.dir.join(format!(".tmp-{oid:016x}-{}", std::process::id()))
    }

    fn io_err(oid: u64, err: &std::io::Error) -> ResultCode {
        warn!(oid = format_args!("{oid:x}"), %err, "store I/O error");
        ResultCode::Eio
    }
}

impl StoreDriver for PlainStore {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn init(&self) -> Result<(), ResultCode> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(0, &e))
    }

    fn format(&self) -> Result<(), ResultCode> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|e| Self::io_err(0, &e))?;
        }
        self.init()
    }

    fn exist(&self, oid: u64) -> bool {
        self.path_for(oid).exists()
    }

    fn create_and_write(&self, oid: u64, data: &[u8], offset: u64) -> Result<(), ResultCode> {
        let path = self.path_for(oid);
        if path.exists() {
            debug!(oid = format_args!("{oid:x}"), "create replaces existing object");
        }

        let tmp = self.tmp_path_for(oid);
        let result = (|| -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(data)?;
            f.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(Self::io_err(oid, &e));
        }
        Ok(())
    }

    fn write(&self, oid: u64, data: &[u8], offset: u64) -> Result<(), ResultCode> {
        let path = self.path_for(oid);
        let mut f = match OpenOptions::new().write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ResultCode::NoObj),
            Err(e) => return Err(Self::io_err(oid, &e)),
        };
        (|| -> std::io::Result<()> {
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(data)?;
            f.sync_all()
        })()
        .map_err(|e| Self::io_err(oid, &e))
    }

    fn read(&self, oid: u64, length: u32, offset: u64) -> Result<Vec<u8>, ResultCode> {
        let path = self.path_for(oid);
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ResultCode::NoObj),
            Err(e) => return Err(Self::io_err(oid, &e)),
        };

        let file_len = f
            .metadata()
            .map_err(|e| Self::io_err(oid, &e))?
            .len();

        // Data objects have a fixed logical size; bytes past EOF are
        // zeros. Variable-length objects return only what is present.
        let logical_len = data_obj_size(oid).unwrap_or(file_len);
        let end = logical_len.min(offset.saturating_add(u64::from(length)));
        if offset >= end {
            return Ok(Vec::new());
        }
        let want = (end - offset) as usize;
        let mut buf = vec![0u8; want];

        let avail = file_len.saturating_sub(offset).min(want as u64) as usize;
        if avail > 0 {
            f.seek(SeekFrom::Start(offset))
                .map_err(|e| Self::io_err(oid, &e))?;
            f.read_exact(&mut buf[..avail])
                .map_err(|e| Self::io_err(oid, &e))?;
        }
        Ok(buf)
    }

    fn remove(&self, oid: u64) -> Result<(), ResultCode> {
        match fs::remove_file(self.path_for(oid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ResultCode::NoObj),
            Err(e) => Err(Self::io_err(oid, &e)),
        }
    }

    fn get_hash(&self, oid: u64, _tgt_epoch: u32) -> Result<Sha1Digest, ResultCode> {
        // The plain layout keeps a single version per object, so the
        // target epoch cannot select anything else.
        let length = data_obj_size(oid).unwrap_or(u64::from(u32::MAX)) as u32;
        let buf = self.read(oid, length, 0)?;
        Ok(content_sha1(&buf))
    }

    fn list(&self) -> Result<Vec<u64>, ResultCode> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(0, &e)),
        };
        let mut oids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if let Ok(oid) = u64::from_str_radix(name, 16) {
                    oids.push(oid);
                }
            }
        }
        oids.sort_unstable();
        Ok(oids)
    }

    fn stat(&self) -> Result<(u64, u64), ResultCode> {
        let mut used = 0u64;
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    used += meta.len();
                }
            }
        }
        Ok((0, used))
    }
}
