//! Blocks: the finest time window of a segment
//!
//! A block owns a window `[start, end)` inside its segment. While open it
//! buffers rows in memory behind a write-ahead log; sealing encodes the buffer
//! into a new immutable part file. A write arriving after the block was sealed
//! opens a fresh part in the same window, so sealed bytes are never touched
//! again.
//!
//! All mutable state sits behind one mutex: appenders to the same block
//! serialize, and sealing moves rows from the buffer into a part without a
//! reader ever observing the rows in neither place.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::part::{is_temp_file, parse_part_file_name, Part};
use crate::storage::series::SeriesOptions;
use crate::storage::types::{Row, TimeRange};
use crate::storage::wal::{WriteAheadLog, WAL_FILE_NAME};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct OpenPart {
    rows: Vec<Row>,
    wal: WriteAheadLog,
    size: usize,
}

#[derive(Debug, Default)]
struct BlockInner {
    parts: Vec<Arc<Part>>,
    /// Part files found on disk that could not be opened
    unreadable: Vec<(PathBuf, String)>,
    open: Option<OpenPart>,
    next_seq: u32,
}

/// Point-in-time view of a block's data
#[derive(Debug, Clone, Default)]
pub struct BlockSnapshot {
    pub parts: Vec<Arc<Part>>,
    pub buffered: Vec<Row>,
    pub unreadable: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub parts: usize,
    pub sealed_rows: usize,
    pub buffered_rows: usize,
    pub open: bool,
}

#[derive(Debug)]
pub struct Block {
    window: TimeRange,
    dir: PathBuf,
    opts: Arc<SeriesOptions>,
    inner: Mutex<BlockInner>,
}

impl Block {
    /// A new, empty block. Nothing touches disk until the first append.
    pub fn new(dir: PathBuf, window: TimeRange, opts: Arc<SeriesOptions>) -> Self {
        Self {
            window,
            dir,
            opts,
            inner: Mutex::new(BlockInner {
                next_seq: 1,
                ..Default::default()
            }),
        }
    }

    /// Load an existing block directory.
    ///
    /// Leftover temporary files are removed and a write-ahead log left by a
    /// crash is replayed into a new sealed part.
    pub fn load(dir: PathBuf, window: TimeRange, opts: Arc<SeriesOptions>) -> StorageResult<Self> {
        let mut inner = BlockInner {
            next_seq: 1,
            ..Default::default()
        };

        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        for path in entries {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            if is_temp_file(&name) {
                debug!(path = %path.display(), "Removing unfinished part");
                std::fs::remove_file(&path)?;
                continue;
            }

            let Some(seq) = parse_part_file_name(&name) else {
                continue;
            };
            inner.next_seq = inner.next_seq.max(seq + 1);

            match Part::open(&path) {
                Ok(part) => inner.parts.push(Arc::new(part)),
                Err(e) => {
                    warn!(path = %path.display(), "Unreadable part: {}", e);
                    inner.unreadable.push((path, e.to_string()));
                }
            }
        }

        let block = Self {
            window,
            dir,
            opts,
            inner: Mutex::new(inner),
        };
        block.replay_wal()?;
        Ok(block)
    }

    fn replay_wal(&self) -> StorageResult<()> {
        let wal_path = self.dir.join(WAL_FILE_NAME);
        if !wal_path.exists() {
            return Ok(());
        }

        let rows = WriteAheadLog::recover(&wal_path)?;
        let mut inner = self.inner.lock()?;
        if rows.is_empty() {
            std::fs::remove_file(&wal_path)?;
            return Ok(());
        }

        info!(
            block = %self.dir.display(),
            rows = rows.len(),
            "Replaying block write-ahead log"
        );
        let seq = inner.next_seq;
        let part = Part::write(&self.dir, seq, &rows, &self.opts.encoding)?;
        inner.parts.push(Arc::new(part));
        inner.next_seq += 1;
        std::fs::remove_file(&wal_path)?;
        Ok(())
    }

    pub fn window(&self) -> TimeRange {
        self.window
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one row: log it, then buffer it.
    ///
    /// The open part is sealed as soon as its buffered size reaches the
    /// configured part size. The row is acknowledged once it is logged; a
    /// failed size-triggered seal leaves the part open and is retried by the
    /// next append or by close.
    pub fn append(&self, row: Row) -> StorageResult<()> {
        if !self.window.contains(row.timestamp) {
            return Err(StorageError::InvalidTimeRange);
        }

        let mut inner = self.inner.lock()?;

        if inner.open.is_none() {
            let wal = WriteAheadLog::open(self.dir.join(WAL_FILE_NAME), self.opts.wal_sync)?;
            inner.open = Some(OpenPart {
                rows: Vec::new(),
                wal,
                size: 0,
            });
        }

        let full = match inner.open.as_mut() {
            Some(open) => {
                open.wal.append(&row)?;
                open.size += row.estimated_size();
                open.rows.push(row);
                self.opts.part_size > 0 && open.size >= self.opts.part_size
            }
            None => false,
        };

        if full {
            if let Err(e) = self.seal_locked(&mut inner) {
                warn!(block = %self.dir.display(), "Deferring part seal: {}", e);
            }
        }
        Ok(())
    }

    /// Seal the open part, if any
    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock()?;
        self.seal_locked(&mut inner)
    }

    fn seal_locked(&self, inner: &mut BlockInner) -> StorageResult<()> {
        let Some(open) = inner.open.as_ref() else {
            return Ok(());
        };

        if !open.rows.is_empty() {
            let seq = inner.next_seq;
            let part = Part::write(&self.dir, seq, &open.rows, &self.opts.encoding)?;
            debug!(
                part = %part.path.display(),
                rows = part.row_count(),
                bytes = part.file_size,
                "Sealed block part"
            );
            inner.parts.push(Arc::new(part));
            inner.next_seq += 1;
        }

        match inner.open.take() {
            Some(open) => open.wal.remove(),
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> StorageResult<bool> {
        Ok(self.inner.lock()?.open.is_some())
    }

    pub fn snapshot(&self) -> StorageResult<BlockSnapshot> {
        let inner = self.inner.lock()?;
        Ok(BlockSnapshot {
            parts: inner.parts.clone(),
            buffered: inner
                .open
                .as_ref()
                .map(|o| o.rows.clone())
                .unwrap_or_default(),
            unreadable: inner.unreadable.clone(),
        })
    }

    pub fn stats(&self) -> StorageResult<BlockStats> {
        let inner = self.inner.lock()?;
        Ok(BlockStats {
            parts: inner.parts.len(),
            sealed_rows: inner.parts.iter().map(|p| p.row_count()).sum(),
            buffered_rows: inner.open.as_ref().map(|o| o.rows.len()).unwrap_or(0),
            open: inner.open.is_some(),
        })
    }

    /// Decode the rows of this block that fall in `range`, ordered by time.
    ///
    /// Any unreadable part fails the whole block with `CorruptData`.
    pub fn read(&self, range: &TimeRange) -> StorageResult<Vec<Row>> {
        let snapshot = self.snapshot()?;

        if let Some((path, reason)) = snapshot.unreadable.first() {
            return Err(StorageError::CorruptData(format!(
                "{}: {}",
                path.display(),
                reason
            )));
        }

        let mut rows = Vec::new();
        for part in &snapshot.parts {
            if !part.time_range().overlaps(range) {
                continue;
            }
            rows.extend(
                part.read_rows(&self.opts.encoding)?
                    .into_iter()
                    .filter(|r| range.contains(r.timestamp)),
            );
        }
        rows.extend(
            snapshot
                .buffered
                .into_iter()
                .filter(|r| range.contains(r.timestamp)),
        );
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{Element, Entity, TagValue};
    use tempfile::tempdir;

    fn opts(part_size: usize) -> Arc<SeriesOptions> {
        Arc::new(SeriesOptions {
            part_size,
            ..Default::default()
        })
    }

    fn row(ts: i64) -> Row {
        Row::from_element(
            Element::new(format!("e{}", ts), ts).family(vec!["svcA".into(), TagValue::Int(ts)]),
            Entity::new(vec![b"svcA".to_vec()]),
        )
    }

    fn window() -> TimeRange {
        TimeRange::new(0, 10_000).unwrap()
    }

    #[test]
    fn test_block_is_lazy() {
        let dir = tempdir().unwrap();
        let block_dir = dir.path().join("block-0000");
        let block = Block::new(block_dir.clone(), window(), opts(0));

        assert!(!block_dir.exists());
        block.append(row(5)).unwrap();
        assert!(block_dir.join(WAL_FILE_NAME).exists());
    }

    #[test]
    fn test_close_seals_part_and_removes_wal() {
        let dir = tempdir().unwrap();
        let block_dir = dir.path().join("block-0000");
        let block = Block::new(block_dir.clone(), window(), opts(0));

        block.append(row(2)).unwrap();
        block.append(row(1)).unwrap();
        block.close().unwrap();

        assert!(block_dir.join("part-000001.dat").exists());
        assert!(!block_dir.join(WAL_FILE_NAME).exists());

        let stats = block.stats().unwrap();
        assert_eq!(stats.parts, 1);
        assert_eq!(stats.sealed_rows, 2);
        assert!(!stats.open);

        let rows = block.read(&TimeRange::all()).unwrap();
        assert_eq!(rows, vec![row(1), row(2)]);
    }

    #[test]
    fn test_write_after_close_starts_new_part() {
        let dir = tempdir().unwrap();
        let block = Block::new(dir.path().join("b"), window(), opts(0));

        block.append(row(1)).unwrap();
        block.close().unwrap();
        let first = std::fs::read(dir.path().join("b/part-000001.dat")).unwrap();

        block.append(row(3)).unwrap();
        block.close().unwrap();

        // The first part is untouched
        assert_eq!(std::fs::read(dir.path().join("b/part-000001.dat")).unwrap(), first);
        assert!(dir.path().join("b/part-000002.dat").exists());
        assert_eq!(block.read(&TimeRange::all()).unwrap().len(), 2);
    }

    #[test]
    fn test_part_size_threshold_seals() {
        let dir = tempdir().unwrap();
        let block = Block::new(dir.path().join("b"), window(), opts(1));

        block.append(row(1)).unwrap();
        block.append(row(2)).unwrap();

        let stats = block.stats().unwrap();
        assert_eq!(stats.parts, 2);
        assert_eq!(stats.buffered_rows, 0);
    }

    #[test]
    fn test_failed_seal_keeps_row_acknowledged() {
        let dir = tempdir().unwrap();
        let block_dir = dir.path().join("b");
        let blocker = block_dir.join("part-000001.dat.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        let block = Block::new(block_dir.clone(), window(), opts(1));
        block.append(row(1)).unwrap();

        let stats = block.stats().unwrap();
        assert_eq!(stats.parts, 0);
        assert_eq!(stats.buffered_rows, 1);
        assert!(block.close().is_err());

        std::fs::remove_dir(&blocker).unwrap();
        block.append(row(2)).unwrap();

        let stats = block.stats().unwrap();
        assert_eq!(stats.parts, 1);
        assert_eq!(stats.sealed_rows, 2);
        assert!(!block_dir.join(WAL_FILE_NAME).exists());
        assert_eq!(block.read(&window()).unwrap(), vec![row(1), row(2)]);
    }

    #[test]
    fn test_failed_seal_replays_each_row_once() {
        let dir = tempdir().unwrap();
        let block_dir = dir.path().join("b");
        let blocker = block_dir.join("part-000001.dat.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        {
            let block = Block::new(block_dir.clone(), window(), opts(1));
            block.append(row(1)).unwrap();
            block.append(row(2)).unwrap();
        }
        std::fs::remove_dir(&blocker).unwrap();

        let block = Block::load(block_dir, window(), opts(1)).unwrap();
        assert_eq!(block.read(&window()).unwrap(), vec![row(1), row(2)]);
    }

    #[test]
    fn test_reader_sees_buffered_rows() {
        let dir = tempdir().unwrap();
        let block = Block::new(dir.path().join("b"), window(), opts(0));

        block.append(row(1)).unwrap();
        block.close().unwrap();
        block.append(row(9)).unwrap();

        let rows = block.read(&TimeRange::new(0, 5).unwrap()).unwrap();
        assert_eq!(rows, vec![row(1)]);
        assert_eq!(block.read(&window()).unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_row_outside_window() {
        let dir = tempdir().unwrap();
        let block = Block::new(dir.path().join("b"), window(), opts(0));
        assert!(matches!(
            block.append(row(10_000)),
            Err(StorageError::InvalidTimeRange)
        ));
    }

    #[test]
    fn test_load_replays_wal() {
        let dir = tempdir().unwrap();
        let block_dir = dir.path().join("b");

        {
            let block = Block::new(block_dir.clone(), window(), opts(0));
            block.append(row(1)).unwrap();
            block.close().unwrap();
            block.append(row(2)).unwrap();
            // Dropped without close: row 2 only lives in the WAL
        }

        let block = Block::load(block_dir.clone(), window(), opts(0)).unwrap();
        assert!(!block_dir.join(WAL_FILE_NAME).exists());
        assert_eq!(block.stats().unwrap().parts, 2);
        assert_eq!(block.read(&window()).unwrap(), vec![row(1), row(2)]);

        // New parts continue the sequence
        block.append(row(3)).unwrap();
        block.close().unwrap();
        assert!(block_dir.join("part-000003.dat").exists());
    }

    #[test]
    fn test_load_cleans_temp_files() {
        let dir = tempdir().unwrap();
        let block_dir = dir.path().join("b");
        std::fs::create_dir_all(&block_dir).unwrap();
        std::fs::write(block_dir.join("part-000001.dat.tmp"), b"partial").unwrap();

        let block = Block::load(block_dir.clone(), window(), opts(0)).unwrap();
        assert!(!block_dir.join("part-000001.dat.tmp").exists());
        assert_eq!(block.stats().unwrap().parts, 0);
    }

    #[test]
    fn test_unreadable_part_fails_block_read() {
        let dir = tempdir().unwrap();
        let block_dir = dir.path().join("b");
        std::fs::create_dir_all(&block_dir).unwrap();
        std::fs::write(block_dir.join("part-000004.dat"), b"garbage").unwrap();

        let block = Block::load(block_dir, window(), opts(0)).unwrap();
        assert!(matches!(
            block.read(&window()),
            Err(StorageError::CorruptData(_))
        ));

        // The broken sequence number is never reused
        block.append(row(1)).unwrap();
        block.close().unwrap();
        assert!(dir.path().join("b/part-000005.dat").exists());
    }
}
