//! Append-only log, grounded on `spatio::persistence::AOFFile`'s command
//! framing. `spatio-server` coordinates multiple `AOFFile` handles for the
//! same path via a process-wide `PATH_REGISTRY`; this core owns exactly one
//! substrate handle per process, so that coordination has nothing to
//! coordinate with here — a single handle behind the substrate's own lock is
//! enough (see `DESIGN.md` Open Questions).

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum AofCommand {
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

pub struct AofLog {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    size: u64,
}

impl AofLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            path,
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_set(&mut self, key: &Bytes, value: &Bytes, tag: u8, expires_unix: i64) -> Result<()> {
        self.write_command(&AofCommand::Set {
            key: key.clone(),
            value: value.clone(),
            tag,
            expires_unix,
        })
    }

    pub fn write_delete(&mut self, key: &Bytes) -> Result<()> {
        self.write_command(&AofCommand::Delete { key: key.clone() })
    }

    fn write_command(&mut self, command: &AofCommand) -> Result<()> {
        let serialized = serialize_command(command);
        self.writer.write_all(&serialized)?;
        self.size += serialized.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replays every command currently on disk, in write order.
    pub fn replay<F: FnMut(AofCommand) -> Result<()>>(&mut self, mut callback: F) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&self.file);
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        self.file.seek(SeekFrom::End(0))?;

        if buffer.is_empty() {
            return Ok(());
        }

        let mut buf = Bytes::from(buffer);
        while buf.remaining() > 0 {
            let command = deserialize_command(&mut buf)?;
            callback(command)?;
        }
        Ok(())
    }

    /// Truncates the log to empty; used by `run_gc` after a compacting
    /// snapshot has taken over as the durable record.
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.size = 0;
        Ok(())
    }
}

fn serialize_command(command: &AofCommand) -> Vec<u8> {
    let mut buf = BytesMut::new();
    match command {
        AofCommand::Set {
            key,
            value,
            tag,
            expires_unix,
        } => {
            buf.put_u8(1);
            buf.put_u32(key.len() as u32);
            buf.put(key.as_ref());
            buf.put_u8(*tag);
            buf.put_u32(value.len() as u32);
            buf.put(value.as_ref());
            buf.put_i64(*expires_unix);
        }
        AofCommand::Delete { key } => {
            buf.put_u8(2);
            buf.put_u32(key.len() as u32);
            buf.put(key.as_ref());
        }
    }
    buf.to_vec()
}

fn deserialize_command(buf: &mut Bytes) -> Result<AofCommand> {
    if buf.remaining() < 1 {
        return Err(Error::internal("truncated aof record"));
    }
    match buf.get_u8() {
        1 => {
            let key_len = buf.get_u32() as usize;
            let key = buf.copy_to_bytes(key_len);
            let tag = buf.get_u8();
            let value_len = buf.get_u32() as usize;
            let value = buf.copy_to_bytes(value_len);
            let expires_unix = buf.get_i64();
            Ok(AofCommand::Set {
                key,
                value,
                tag,
                expires_unix,
            })
        }
        2 => {
            let key_len = buf.get_u32() as usize;
            let key = buf.copy_to_bytes(key_len);
            Ok(AofCommand::Delete { key })
        }
        other => Err(Error::internal(format!("unknown aof command tag {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn replay_returns_commands_in_write_order() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = AofLog::open(temp.path()).unwrap();

        log.write_set(&Bytes::from("a"), &Bytes::from("1"), 1, 0)
            .unwrap();
        log.write_set(&Bytes::from("b"), &Bytes::from("2"), 1, 0)
            .unwrap();
        log.write_delete(&Bytes::from("a")).unwrap();
        log.flush().unwrap();

        let mut seen = Vec::new();
        log.replay(|cmd| {
            seen.push(cmd);
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], AofCommand::Set { key, .. } if key == &Bytes::from("a")));
        assert!(matches!(&seen[2], AofCommand::Delete { key } if key == &Bytes::from("a")));
    }

    #[test]
    fn truncate_empties_the_log() {
        let temp = NamedTempFile::new().unwrap();
        let mut log = AofLog::open(temp.path()).unwrap();
        log.write_set(&Bytes::from("a"), &Bytes::from("1"), 1, 0)
            .unwrap();
        log.flush().unwrap();
        assert!(log.size() > 0);

        log.truncate().unwrap();
        assert_eq!(log.size(), 0);

        let mut seen = Vec::new();
        log.replay(|cmd| {
            seen.push(cmd);
            Ok(())
        })
        .unwrap();
        assert!(seen.is_empty());
    }
}
