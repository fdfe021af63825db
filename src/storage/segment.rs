//! Segments: coarse time windows holding an ordered map of blocks
//!
//! A segment owns the block rotation policy for its window. The block whose
//! window was most recently advanced into is the active one; advancing closes
//! every open block whose window ends at or before the new block's start.
//! Late writes may still reopen an older block, which then stays open until
//! the next rotation, a size-triggered seal, or store close.

use crate::storage::block::{Block, BlockStats};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::series::SeriesOptions;
use crate::storage::types::{Row, TimeRange, Timestamp};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub blocks: usize,
    pub open_blocks: usize,
    pub parts: usize,
    pub sealed_rows: usize,
    pub buffered_rows: usize,
}

#[derive(Debug)]
pub struct Segment {
    name: String,
    window: TimeRange,
    dir: PathBuf,
    opts: Arc<SeriesOptions>,
    blocks: RwLock<BTreeMap<Timestamp, Arc<Block>>>,
    active: Mutex<Option<Timestamp>>,
    /// Set by retention; the directory goes away with the last reference
    expired: AtomicBool,
}

impl Segment {
    pub fn new(parent: &Path, start: Timestamp, opts: Arc<SeriesOptions>) -> StorageResult<Self> {
        let name = opts.buckets.segment_name(start)?;
        Ok(Self {
            dir: parent.join(&name),
            name,
            window: opts.buckets.segment_window(start),
            opts,
            blocks: RwLock::new(BTreeMap::new()),
            active: Mutex::new(None),
            expired: AtomicBool::new(false),
        })
    }

    /// Load an existing segment directory and its blocks
    pub fn load(parent: &Path, start: Timestamp, opts: Arc<SeriesOptions>) -> StorageResult<Self> {
        let segment = Self::new(parent, start, opts)?;

        let mut blocks = BTreeMap::new();
        for entry in std::fs::read_dir(&segment.dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let Some(block_start) = segment.opts.buckets.parse_block_name(start, name) else {
                warn!(path = %path.display(), "Ignoring unrecognized entry in segment");
                continue;
            };

            let window = segment.opts.buckets.block_window(block_start);
            let block = Block::load(path, window, segment.opts.clone())?;
            blocks.insert(block_start, Arc::new(block));
        }

        debug!(segment = %segment.name, blocks = blocks.len(), "Loaded segment");
        *segment.blocks.write()? = blocks;
        Ok(segment)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> TimeRange {
        self.window
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Route a row to the block whose window contains its timestamp,
    /// creating the block if needed, then rotate if the write advanced
    /// the active window.
    pub fn append(&self, row: Row) -> StorageResult<()> {
        if !self.window.contains(row.timestamp) {
            return Err(StorageError::InvalidTimeRange);
        }

        let block_start = self
            .opts
            .buckets
            .block_start(self.window.start, row.timestamp)?;
        let block = self.get_or_create_block(block_start)?;
        block.append(row)?;
        self.advance(block_start)
    }

    fn get_or_create_block(&self, block_start: Timestamp) -> StorageResult<Arc<Block>> {
        if let Some(block) = self.blocks.read()?.get(&block_start) {
            return Ok(block.clone());
        }

        let mut blocks = self.blocks.write()?;
        if let Some(block) = blocks.get(&block_start) {
            return Ok(block.clone());
        }

        let name = self.opts.buckets.block_name(block_start)?;
        let block = Arc::new(Block::new(
            self.dir.join(name),
            self.opts.buckets.block_window(block_start),
            self.opts.clone(),
        ));
        blocks.insert(block_start, block.clone());
        Ok(block)
    }

    /// Make `block_start` the active window if it is newer, closing every
    /// open block that ends at or before it
    fn advance(&self, block_start: Timestamp) -> StorageResult<()> {
        let mut active = self.active.lock()?;
        if active.map_or(false, |current| current >= block_start) {
            return Ok(());
        }
        *active = Some(block_start);

        let stale: Vec<Arc<Block>> = self
            .blocks
            .read()?
            .range(..block_start)
            .filter(|(_, b)| b.window().end <= block_start)
            .map(|(_, b)| b.clone())
            .collect();

        let mut errors = Vec::new();
        for block in stale {
            if !block.is_open()? {
                continue;
            }
            info!(block = %block.dir().display(), "Rotating block");
            if let Err(e) = block.close() {
                errors.push(e);
            }
        }
        StorageError::aggregate(errors)
    }

    /// Active block start, if this segment has received a write
    pub fn active_block(&self) -> StorageResult<Option<Timestamp>> {
        Ok(*self.active.lock()?)
    }

    /// Blocks whose windows intersect `range`, ordered by start
    pub fn blocks_overlapping(&self, range: &TimeRange) -> StorageResult<Vec<Arc<Block>>> {
        Ok(self
            .blocks
            .read()?
            .range(..range.end)
            .filter(|(_, b)| b.window().overlaps(range))
            .map(|(_, b)| b.clone())
            .collect())
    }

    /// Seal every open block
    pub fn close(&self) -> StorageResult<()> {
        let blocks: Vec<Arc<Block>> = self.blocks.read()?.values().cloned().collect();
        let errors = blocks.iter().filter_map(|b| b.close().err()).collect();
        StorageError::aggregate(errors)
    }

    pub fn stats(&self) -> StorageResult<SegmentStats> {
        let mut stats = SegmentStats::default();
        for block in self.blocks.read()?.values() {
            let BlockStats {
                parts,
                sealed_rows,
                buffered_rows,
                open,
            } = block.stats()?;
            stats.blocks += 1;
            stats.open_blocks += open as usize;
            stats.parts += parts;
            stats.sealed_rows += sealed_rows;
            stats.buffered_rows += buffered_rows;
        }
        Ok(stats)
    }

    /// Mark for deletion once the last holder lets go
    pub fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.is_expired() || !self.dir.exists() {
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => info!(segment = %self.dir.display(), "Removed expired segment"),
            Err(e) => warn!(segment = %self.dir.display(), "Failed to remove expired segment: {}", e),
        }
    }
}
