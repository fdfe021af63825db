//! Block write-ahead log
//!
//! Every row appended to an open block part is logged here before the append
//! is acknowledged. Reopening a block replays the log into the part buffer;
//! sealing the part removes the log.
//!
//! Each record is framed as `[payload len: u32][crc32(payload): u32][payload]`,
//! little endian, with the payload being a bincode-encoded [`Row`]. A record
//! is built in memory and handed to the file in a single write.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Row;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const WAL_FILE_NAME: &str = "wal.log";

const FRAME_HEADER_LEN: usize = 8;

/// Records larger than this are treated as garbage during replay
const MAX_RECORD_LEN: usize = 64 << 20;

/// Unsynced bytes tolerated by [`WalSyncMode::Batched`]
const BATCH_SYNC_BYTES: usize = 64 << 10;

/// Sync strategy for WAL writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// Fsync after every write
    EveryWrite,
    /// Fsync once enough bytes accumulate
    #[default]
    Batched,
    /// Flush to the OS only
    None,
}

pub struct WriteAheadLog {
    out: BufWriter<File>,
    location: PathBuf,
    mode: WalSyncMode,
    appended: u64,
    unsynced: usize,
    frame: Vec<u8>,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("location", &self.location)
            .field("appended", &self.appended)
            .field("mode", &self.mode)
            .finish()
    }
}

impl WriteAheadLog {
    /// Open the log at `path` for appending, creating it and its parent
    /// directory when missing.
    pub fn open(path: impl AsRef<Path>, mode: WalSyncMode) -> StorageResult<Self> {
        let location = path.as_ref().to_path_buf();
        if let Some(dir) = location.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&location)?;

        Ok(Self {
            out: BufWriter::new(file),
            location,
            mode,
            appended: 0,
            unsynced: 0,
            frame: Vec::new(),
        })
    }

    pub fn append(&mut self, row: &Row) -> StorageResult<()> {
        let payload = bincode::serialize(row)?;

        self.frame.clear();
        self.frame.reserve(FRAME_HEADER_LEN + payload.len());
        self.frame
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.frame
            .extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        self.frame.extend_from_slice(&payload);

        self.out.write_all(&self.frame)?;
        self.appended += 1;
        self.unsynced += self.frame.len();

        let durable = match self.mode {
            WalSyncMode::EveryWrite => true,
            WalSyncMode::Batched => self.unsynced >= BATCH_SYNC_BYTES,
            WalSyncMode::None => false,
        };
        if durable {
            self.sync()
        } else {
            self.out.flush().map_err(Into::into)
        }
    }

    /// Flush buffered records and fsync the file
    pub fn sync(&mut self) -> StorageResult<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Replay the log at `path`.
    ///
    /// A missing file yields nothing. Replay stops at the first torn or
    /// corrupt record and returns the rows before it.
    pub fn recover(path: &Path) -> StorageResult<Vec<Row>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        let mut rest = bytes.as_slice();
        while !rest.is_empty() {
            match next_record(rest) {
                Ok((row, consumed)) => {
                    rows.push(row);
                    rest = &rest[consumed..];
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        recovered = rows.len(),
                        dropped_bytes = rest.len(),
                        "WAL replay stopped: {}",
                        e
                    );
                    break;
                }
            }
        }

        Ok(rows)
    }

    /// Records appended through this handle
    pub fn entry_count(&self) -> u64 {
        self.appended
    }

    pub fn path(&self) -> &Path {
        &self.location
    }

    /// Close and delete the log once its rows are sealed into a part
    pub fn remove(self) -> StorageResult<()> {
        let Self { mut out, location, .. } = self;
        out.flush()?;
        drop(out);
        match std::fs::remove_file(&location) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Decode the record at the head of `buf`, returning it with its framed size.
fn next_record(buf: &[u8]) -> StorageResult<(Row, usize)> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(StorageError::CorruptData(format!(
            "truncated WAL header ({} bytes)",
            buf.len()
        )));
    }
    let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let len = word(0) as usize;
    let checksum = word(4);

    if len > MAX_RECORD_LEN {
        return Err(StorageError::CorruptData(format!(
            "WAL record length {} exceeds limit",
            len
        )));
    }
    let end = FRAME_HEADER_LEN + len;
    let payload = buf.get(FRAME_HEADER_LEN..end).ok_or_else(|| {
        StorageError::CorruptData(format!(
            "truncated WAL record: want {} bytes, have {}",
            len,
            buf.len() - FRAME_HEADER_LEN
        ))
    })?;

    let actual = crc32fast::hash(payload);
    if actual != checksum {
        return Err(StorageError::CorruptData(format!(
            "WAL checksum mismatch: expected {:08x}, got {:08x}",
            checksum, actual
        )));
    }

    Ok((bincode::deserialize(payload)?, end))
}
