//! The KV substrate adapter.
//!
//! Combines an in-process `BTreeMap` index (the "hot" state, mirroring
//! `spatio::storage::MemoryBackend`) with an append-only log for durability
//! (`aof`, mirroring `spatio::persistence::AOFFile`) and a compaction path
//! that writes a point-in-time snapshot and truncates the log (`snapshot`,
//! mirroring `spatio/crates/core/storage/persistence/snapshot.rs`). This is
//! a log-structured persistent key/value substrate: an AOF for durability, a
//! BTreeMap for query, periodic compaction to bound the AOF's size.

mod aof;
mod snapshot;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use aof::{AofCommand, AofLog};
use snapshot::SnapshotFile;

/// One substrate value: the payload, its tag byte, and its absolute
/// expiration (`0` = never).
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Bytes,
    pub tag: u8,
    pub expires_unix: i64,
}

impl Entry {
    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        self.expires_unix != 0 && self.expires_unix <= now_unix
    }
}

/// A read-only, point-in-time view of the substrate. Taken once per call so
/// iteration never observes a half-applied write.
pub struct ReadTxn {
    snapshot: BTreeMap<Bytes, Entry>,
}

impl ReadTxn {
    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.snapshot.get(key)
    }

    pub fn iter_all(&self, tag_filter: Option<u8>) -> impl Iterator<Item = (&Bytes, &Entry)> {
        self.snapshot
            .iter()
            .filter(move |(_, e)| tag_filter.is_none_or(|t| e.tag == t))
    }

    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
        tag_filter: Option<u8>,
    ) -> impl Iterator<Item = (&'a Bytes, &'a Entry)> {
        self.snapshot
            .range(Bytes::copy_from_slice(prefix)..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .filter(move |(_, e)| tag_filter.is_none_or(|t| e.tag == t))
    }
}

enum PendingOp {
    Set {
        key: Bytes,
        value: Bytes,
        tag: u8,
        expires_unix: i64,
    },
    Delete {
        key: Bytes,
    },
}

/// A write-scoped batch of mutations. Nothing is visible to readers until
/// `commit()`; dropping without committing (`discard`) is a no-op.
pub struct WriteTxn<'s> {
    substrate: &'s Substrate,
    ops: Vec<PendingOp>,
}

impl WriteTxn<'_> {
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>, tag: u8, expires_unix: i64) {
        self.ops.push(PendingOp::Set {
            key: key.into(),
            value: value.into(),
            tag,
            expires_unix,
        });
    }

    pub fn delete(&mut self, key: impl Into<Bytes>) {
        self.ops.push(PendingOp::Delete { key: key.into() });
    }

    pub fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let mut aof = self.substrate.aof.lock();
        for op in &self.ops {
            match op {
                PendingOp::Set {
                    key,
                    value,
                    tag,
                    expires_unix,
                } => aof.write_set(key, value, *tag, *expires_unix)?,
                PendingOp::Delete { key } => aof.write_delete(key)?,
            }
        }
        aof.sync()?;
        drop(aof);

        let mut map = self.substrate.map.write();
        for op in self.ops {
            match op {
                PendingOp::Set {
                    key,
                    value,
                    tag,
                    expires_unix,
                } => {
                    map.insert(key, Entry { value, tag, expires_unix });
                }
                PendingOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    pub fn discard(self) {}
}

/// The substrate handle. Opened once at process start, closed at shutdown.
pub struct Substrate {
    map: RwLock<BTreeMap<Bytes, Entry>>,
    aof: Mutex<AofLog>,
    snapshot: SnapshotFile,
    #[allow(dead_code)]
    dir: PathBuf,
}

impl Substrate {
    /// Opens (or creates) the substrate directory, replaying any snapshot
    /// followed by any AOF entries written since that snapshot.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let snapshot = SnapshotFile::new(dir.join("snapshot.bin"));
        let mut map = snapshot.load()?;

        let mut aof = AofLog::open(dir.join("log.aof"))?;
        aof.replay(|cmd| {
            match cmd {
                AofCommand::Set {
                    key,
                    value,
                    tag,
                    expires_unix,
                } => {
                    map.insert(key, Entry { value, tag, expires_unix });
                }
                AofCommand::Delete { key } => {
                    map.remove(&key);
                }
            }
            Ok(())
        })?;

        Ok(Self {
            map: RwLock::new(map),
            aof: Mutex::new(aof),
            snapshot,
            dir,
        })
    }

    /// An in-memory substrate with no on-disk backing, for tests.
    #[cfg(test)]
    pub fn open_temp() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let substrate = Self::open(dir.path()).unwrap();
        (substrate, dir)
    }

    pub fn begin_read(&self) -> ReadTxn {
        ReadTxn {
            snapshot: self.map.read().clone(),
        }
    }

    pub fn begin_write(&self) -> WriteTxn<'_> {
        WriteTxn {
            substrate: self,
            ops: Vec::new(),
        }
    }

    /// Compacts the AOF by writing a fresh snapshot of live state and
    /// truncating the log, the way `spatio`'s snapshot writer atomically
    /// replaces state via temp-file-then-rename. `reclaim_ratio` is honored
    /// as a threshold: compaction only runs when the AOF has grown past
    /// `reclaim_ratio` of its size since the last compaction relative to the
    /// live data size, so a quiet substrate doesn't rewrite on every tick.
    pub fn run_gc(&self, reclaim_ratio: f64) -> Result<()> {
        let map_snapshot = self.map.read().clone();
        let live_bytes: usize = map_snapshot
            .iter()
            .map(|(k, e)| k.len() + e.value.len())
            .sum();

        let mut aof = self.aof.lock();
        let aof_size = aof.size() as usize;
        if live_bytes == 0 {
            if aof_size > 0 {
                self.snapshot.save(&map_snapshot)?;
                aof.truncate()?;
            }
            return Ok(());
        }

        let growth = aof_size as f64 / live_bytes.max(1) as f64;
        if growth < (1.0 + reclaim_ratio) {
            return Ok(());
        }

        self.snapshot.save(&map_snapshot)?;
        aof.truncate()?;
        log::info!(
            "geodb: compacted substrate ({} live entries, aof {} -> 0 bytes)",
            map_snapshot.len(),
            aof_size
        );
        Ok(())
    }

    /// Removes every entry whose `expires_unix` has passed. Called from the
    /// same periodic task as `run_gc`.
    pub fn evict_expired(&self, now_unix: i64) -> Result<usize> {
        let expired: Vec<Bytes> = self
            .map
            .read()
            .iter()
            .filter(|(_, e)| e.is_expired_at(now_unix))
            .map(|(k, _)| k.clone())
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let mut txn = self.begin_write();
        for key in &expired {
            txn.delete(key.clone());
        }
        txn.commit()?;
        Ok(expired.len())
    }
}
