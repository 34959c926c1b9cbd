//! Point-in-time snapshot persistence, grounded on
//! `spatio/crates/core/storage/persistence/snapshot.rs`'s `SnapshotFile`:
//! magic bytes, a version byte, length-delimited framing, and an atomic
//! temp-file-then-rename write with a parent-directory fsync.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::kv::Entry;

const SNAPSHOT_MAGIC: &[u8] = b"GEODB_SNAPSHOT";
const SNAPSHOT_VERSION: u8 = 1;

pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<BTreeMap<Bytes, Entry>> {
        if !self.exists() {
            return Ok(BTreeMap::new());
        }
        let file = File::open(&self.path)?;
        if file.metadata()?.len() == 0 {
            return Ok(BTreeMap::new());
        }
        let mut reader = BufReader::new(file);

        let mut magic = vec![0u8; SNAPSHOT_MAGIC.len()];
        reader.read_exact(&mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::internal("invalid snapshot magic"));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(Error::internal("unsupported snapshot version"));
        }

        let count = read_u64(&mut reader)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key_len = read_u64(&mut reader)? as usize;
            let mut key_buf = vec![0u8; key_len];
            reader.read_exact(&mut key_buf)?;

            let tag = read_u8(&mut reader)?;
            let expires_unix = read_i64(&mut reader)?;

            let value_len = read_u64(&mut reader)? as usize;
            let mut value_buf = vec![0u8; value_len];
            reader.read_exact(&mut value_buf)?;

            map.insert(
                Bytes::from(key_buf),
                Entry {
                    value: Bytes::from(value_buf),
                    tag,
                    expires_unix,
                },
            );
        }
        Ok(map)
    }

    pub fn save(&self, entries: &BTreeMap<Bytes, Entry>) -> Result<()> {
        let temp_path = self.temp_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&[SNAPSHOT_VERSION])?;
        write_u64(&mut writer, entries.len() as u64)?;

        for (key, entry) in entries {
            write_u64(&mut writer, key.len() as u64)?;
            writer.write_all(key)?;
            write_u8(&mut writer, entry.tag)?;
            write_i64(&mut writer, entry.expires_unix)?;
            write_u64(&mut writer, entry.value.len() as u64)?;
            writer.write_all(&entry.value)?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;
        self.sync_parent_dir()?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        let mut name = temp
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".tmp");
        temp.set_file_name(name);
        temp
    }

    fn sync_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if parent.as_os_str().is_empty() {
                return Ok(());
            }
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
        Ok(())
    }
}

fn write_u8<W: Write>(w: &mut W, v: u8) -> Result<()> {
    w.write_all(&[v])?;
    Ok(())
}
fn write_u64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}
fn write_i64<W: Write>(w: &mut W, v: i64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}
fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}
fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}
