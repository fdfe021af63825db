//! Per-shard temporal storage: the ordered map of segments under
//! `<shard>/series`
//!
//! Segments are created lazily on the first write whose timestamp falls
//! outside every existing window, and are never split or merged. When a
//! newer segment becomes active, every open block of older segments is
//! sealed.

use crate::encoding::EncodingMethod;
use crate::storage::block::Block;
use crate::storage::context::Context;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::interval::{TimeBuckets, SEGMENT_PREFIX};
use crate::storage::segment::{Segment, SegmentStats};
use crate::storage::types::{Row, TimeRange, Timestamp};
use crate::storage::wal::WalSyncMode;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub const SERIES_DIR: &str = "series";

/// Default size at which an open block part is sealed: 4 MiB
pub const DEFAULT_PART_SIZE: usize = 4 << 20;

/// Settings shared by every segment and block of a store
#[derive(Debug, Clone)]
pub struct SeriesOptions {
    pub buckets: TimeBuckets,
    pub encoding: EncodingMethod,
    pub wal_sync: WalSyncMode,
    /// Buffered bytes that seal an open part; 0 disables the threshold
    pub part_size: usize,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            buckets: TimeBuckets::default(),
            encoding: EncodingMethod::default(),
            wal_sync: WalSyncMode::default(),
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

/// Read handle on one block.
///
/// Holding a reader keeps its segment alive, so retention cannot delete
/// the files underneath it.
#[derive(Debug, Clone)]
pub struct BlockReader {
    segment: Arc<Segment>,
    block: Arc<Block>,
}

impl BlockReader {
    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    pub fn window(&self) -> TimeRange {
        self.block.window()
    }

    pub fn path(&self) -> &Path {
        self.block.dir()
    }

    /// Decode the block's rows that fall in `range`
    pub fn rows(&self, range: &TimeRange) -> StorageResult<Vec<Row>> {
        self.block.read(range)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeriesStats {
    pub segments: usize,
    pub blocks: usize,
    pub open_blocks: usize,
    pub parts: usize,
    pub sealed_rows: usize,
    pub buffered_rows: usize,
}

impl SeriesStats {
    fn add(&mut self, s: SegmentStats) {
        self.segments += 1;
        self.blocks += s.blocks;
        self.open_blocks += s.open_blocks;
        self.parts += s.parts;
        self.sealed_rows += s.sealed_rows;
        self.buffered_rows += s.buffered_rows;
    }
}

#[derive(Debug)]
pub struct SeriesStore {
    root: PathBuf,
    opts: Arc<SeriesOptions>,
    segments: RwLock<BTreeMap<Timestamp, Arc<Segment>>>,
    active: Mutex<Option<Timestamp>>,
    /// Retention cutoff; appends hold it shared, `retain` exclusively
    horizon: RwLock<Timestamp>,
}

impl SeriesStore {
    /// Open the store rooted at `<shard>/series`, loading existing segments.
    ///
    /// Nothing is created on disk here; the context is checked between
    /// segments.
    pub fn open(ctx: &Context, shard_dir: &Path, opts: Arc<SeriesOptions>) -> StorageResult<Self> {
        let root = shard_dir.join(SERIES_DIR);
        let mut segments = BTreeMap::new();

        if root.exists() {
            let mut dirs: Vec<PathBuf> = std::fs::read_dir(&root)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();

            for path in dirs {
                ctx.check()?;

                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                let Some(start) = opts.buckets.parse_segment_name(name) else {
                    if name.starts_with(SEGMENT_PREFIX) {
                        warn!(path = %path.display(), "Segment name does not match interval rules");
                    }
                    continue;
                };

                let segment = Segment::load(&root, start, opts.clone())?;
                segments.insert(start, Arc::new(segment));
            }
        }

        debug!(root = %root.display(), segments = segments.len(), "Opened series store");
        Ok(Self {
            root,
            opts,
            segments: RwLock::new(segments),
            active: Mutex::new(None),
            horizon: RwLock::new(Timestamp::MIN),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &SeriesOptions {
        &self.opts
    }

    /// Append a row to the segment and block for its timestamp.
    ///
    /// Rows whose segment window was already dropped by [`retain`] are
    /// rejected with `Expired`.
    ///
    /// [`retain`]: SeriesStore::retain
    pub fn append(&self, row: Row) -> StorageResult<()> {
        let start = self.opts.buckets.segment_start(row.timestamp)?;

        let horizon = self.horizon.read()?;
        if self.opts.buckets.segment_window(start).end <= *horizon {
            return Err(StorageError::Expired(row.timestamp));
        }

        let segment = self.get_or_create_segment(start)?;
        segment.append(row)?;
        self.advance(start)
    }

    fn get_or_create_segment(&self, start: Timestamp) -> StorageResult<Arc<Segment>> {
        if let Some(segment) = self.segments.read()?.get(&start) {
            return Ok(segment.clone());
        }

        let mut segments = self.segments.write()?;
        if let Some(segment) = segments.get(&start) {
            return Ok(segment.clone());
        }

        let segment = Arc::new(Segment::new(&self.root, start, self.opts.clone())?);
        info!(segment = %segment.dir().display(), "Created segment");
        segments.insert(start, segment.clone());
        Ok(segment)
    }

    /// Seal open blocks of every segment older than a newly active one
    fn advance(&self, start: Timestamp) -> StorageResult<()> {
        let mut active = self.active.lock()?;
        if active.map_or(false, |current| current >= start) {
            return Ok(());
        }
        *active = Some(start);

        let older: Vec<Arc<Segment>> = self
            .segments
            .read()?
            .range(..start)
            .map(|(_, s)| s.clone())
            .collect();

        let errors = older.iter().filter_map(|s| s.close().err()).collect();
        StorageError::aggregate(errors)
    }

    /// Readers for every block intersecting `range`, in time order
    pub fn blocks_in(&self, range: &TimeRange) -> StorageResult<Vec<BlockReader>> {
        let segments: Vec<Arc<Segment>> = self
            .segments
            .read()?
            .range(..range.end)
            .filter(|(_, s)| s.window().overlaps(range))
            .map(|(_, s)| s.clone())
            .collect();

        let mut readers = Vec::new();
        for segment in segments {
            for block in segment.blocks_overlapping(range)? {
                readers.push(BlockReader {
                    segment: segment.clone(),
                    block,
                });
            }
        }
        Ok(readers)
    }

    /// Names of the segments currently held, oldest first
    pub fn segment_names(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .segments
            .read()?
            .values()
            .map(|s| s.name().to_string())
            .collect())
    }

    /// Drop every segment whose window ended at or before `cutoff`.
    ///
    /// Waits for in-flight appends, then raises the retention horizon so no
    /// later append can recreate a dropped window. Files are deleted when the
    /// last reader of a dropped segment releases it. Returns the number of
    /// segments dropped.
    pub fn retain(&self, cutoff: Timestamp) -> StorageResult<usize> {
        let mut horizon = self.horizon.write()?;
        *horizon = (*horizon).max(cutoff);

        let mut segments = self.segments.write()?;
        let expired: Vec<Timestamp> = segments
            .iter()
            .filter(|(_, s)| s.window().end <= cutoff)
            .map(|(start, _)| *start)
            .collect();

        for start in &expired {
            if let Some(segment) = segments.remove(start) {
                info!(segment = %segment.name(), "Segment expired by retention");
                segment.expire();
            }
        }
        Ok(expired.len())
    }

    /// Seal every open block
    pub fn close(&self) -> StorageResult<()> {
        let segments: Vec<Arc<Segment>> = self.segments.read()?.values().cloned().collect();
        let errors = segments.iter().filter_map(|s| s.close().err()).collect();
        StorageError::aggregate(errors)
    }

    pub fn stats(&self) -> StorageResult<SeriesStats> {
        let mut stats = SeriesStats::default();
        for segment in self.segments.read()?.values() {
            stats.add(segment.stats()?);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{Element, Entity};
    use tempfile::tempdir;

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;
    // 2024-03-15T00:00:00Z
    const DAY_START: i64 = 1_710_460_800_000;

    fn row(ts: i64) -> Row {
        Row::from_element(
            Element::new(format!("e{}", ts), ts).family(vec!["svcA".into()]),
            Entity::new(vec![b"svcA".to_vec()]),
        )
    }

    fn open(dir: &Path) -> SeriesStore {
        SeriesStore::open(&Context::background(), dir, Arc::new(SeriesOptions::default())).unwrap()
    }

    #[test]
    fn test_open_creates_nothing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        assert!(!store.root().exists());
        assert_eq!(store.stats().unwrap(), SeriesStats::default());
    }

    #[test]
    fn test_segment_boundary_routes_to_later_segment() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.append(row(DAY_START + DAY)).unwrap();
        store.append(row(DAY_START + DAY - 1)).unwrap();

        assert_eq!(
            store.segment_names().unwrap(),
            vec!["seg-20240315".to_string(), "seg-20240316".to_string()]
        );
        assert!(store.root().join("seg-20240316/block-0000").exists());
        assert!(store.root().join("seg-20240315/block-2200").exists());
    }

    #[test]
    fn test_new_segment_seals_older_segments() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.append(row(DAY_START + 1)).unwrap();
        store.append(row(DAY_START + DAY + 1)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.segments, 2);
        assert_eq!(stats.open_blocks, 1);
        assert_eq!(stats.parts, 1);
    }

    #[test]
    fn test_blocks_in_range() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for ts in [DAY_START, DAY_START + 5 * HOUR, DAY_START + DAY + HOUR] {
            store.append(row(ts)).unwrap();
        }

        let range = TimeRange::new(DAY_START + 4 * HOUR, DAY_START + DAY + 2 * HOUR).unwrap();
        let readers = store.blocks_in(&range).unwrap();
        let names: Vec<_> = readers.iter().map(|r| r.segment_name().to_string()).collect();
        assert_eq!(names, vec!["seg-20240315", "seg-20240316"]);

        let rows: Vec<Row> = readers
            .iter()
            .flat_map(|r| r.rows(&range).unwrap())
            .collect();
        assert_eq!(rows, vec![row(DAY_START + 5 * HOUR), row(DAY_START + DAY + HOUR)]);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.append(row(DAY_START)).unwrap();
            store.append(row(DAY_START + DAY)).unwrap();
            store.close().unwrap();
        }

        let first = open(dir.path()).stats().unwrap();
        let second = open(dir.path()).stats().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.segments, 2);
        assert_eq!(first.sealed_rows, 2);
    }

    #[test]
    fn test_open_checks_cancellation() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.append(row(DAY_START)).unwrap();
            store.close().unwrap();
        }

        let ctx = Context::background();
        ctx.cancel();
        let err = SeriesStore::open(&ctx, dir.path(), Arc::new(SeriesOptions::default())).unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
    }

    #[test]
    fn test_retain_defers_deletion_to_last_reader() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.append(row(DAY_START)).unwrap();
        store.append(row(DAY_START + DAY)).unwrap();

        let readers = store.blocks_in(&TimeRange::new(DAY_START, DAY_START + 1).unwrap()).unwrap();
        assert_eq!(readers.len(), 1);

        let dropped = store.retain(DAY_START + DAY).unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(store.segment_names().unwrap(), vec!["seg-20240316".to_string()]);

        let expired_dir = store.root().join("seg-20240315");
        assert!(expired_dir.exists());
        assert_eq!(readers[0].rows(&TimeRange::all()).unwrap().len(), 1);

        drop(readers);
        assert!(!expired_dir.exists());
    }

    #[test]
    fn test_retained_window_rejects_late_writes() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.append(row(DAY_START)).unwrap();
            store.append(row(DAY_START + DAY)).unwrap();

            let readers = store.blocks_in(&TimeRange::all()).unwrap();
            store.retain(DAY_START + DAY).unwrap();

            assert!(matches!(
                store.append(row(DAY_START + 5)),
                Err(StorageError::Expired(ts)) if ts == DAY_START + 5
            ));
            store.append(row(DAY_START + DAY + 5)).unwrap();
            store.close().unwrap();
            drop(readers);

            assert!(!store.root().join("seg-20240315").exists());
            // A lower cutoff never lowers the horizon
            store.retain(DAY_START).unwrap();
            assert!(store.append(row(DAY_START + 6)).is_err());
        }

        let store = open(dir.path());
        let rows: Vec<Row> = store
            .blocks_in(&TimeRange::all())
            .unwrap()
            .iter()
            .flat_map(|r| r.rows(&TimeRange::all()).unwrap())
            .collect();
        assert_eq!(rows, vec![row(DAY_START + DAY), row(DAY_START + DAY + 5)]);
    }

    #[test]
    fn test_unrepresentable_timestamp_is_an_error() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        for ts in [i64::MIN, i64::MAX] {
            assert!(matches!(
                store.append(row(ts)),
                Err(StorageError::InvalidTimeRange)
            ));
        }
        assert!(!store.root().exists());
        assert_eq!(store.stats().unwrap(), SeriesStats::default());
    }

    #[test]
    fn test_concurrent_appends_across_rotation() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;

        let dir = tempdir().unwrap();
        let opts = SeriesOptions {
            part_size: 2048,
            wal_sync: WalSyncMode::None,
            ..SeriesOptions::default()
        };
        let store =
            SeriesStore::open(&Context::background(), dir.path(), Arc::new(opts.clone())).unwrap();

        // Interleaved timestamps from an hour before midnight to three after,
        // so writers race through block rotation and a segment boundary
        let span = |t: usize, i: usize| {
            let ts = DAY_START + DAY - HOUR + ((i * THREADS + t) as i64) * 9_000;
            Row::from_element(
                Element::new(format!("t{}-{}", t, i), ts).family(vec!["svcA".into()]),
                Entity::new(vec![b"svcA".to_vec()]),
            )
        };

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..PER_THREAD {
                        store.append(span(t, i)).unwrap();
                    }
                });
            }
        });

        let mut expected: Vec<String> = (0..THREADS)
            .flat_map(|t| (0..PER_THREAD).map(move |i| format!("t{}-{}", t, i)))
            .collect();
        expected.sort();

        let ids = |store: &SeriesStore| {
            let mut ids: Vec<String> = store
                .blocks_in(&TimeRange::all())
                .unwrap()
                .iter()
                .flat_map(|r| r.rows(&TimeRange::all()).unwrap())
                .map(|r| r.element_id)
                .collect();
            ids.sort();
            ids
        };

        assert_eq!(ids(&store), expected);
        assert_eq!(
            store.segment_names().unwrap(),
            vec!["seg-20240315".to_string(), "seg-20240316".to_string()]
        );
        store.close().unwrap();

        let reopened =
            SeriesStore::open(&Context::background(), dir.path(), Arc::new(opts)).unwrap();
        assert_eq!(ids(&reopened), expected);
        assert_eq!(reopened.stats().unwrap().buffered_rows, 0);
    }
}
