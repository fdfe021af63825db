//! Database lifecycle: root directory, shard set, lock and metadata
//!
//! ```text
//! <root>/
//!   metadata.json      shard count and interval rules, verified on reopen
//!   LOCK               held while a handle is open
//!   shard-0/ .. shard-<n-1>/
//! ```

use crate::encoding::EncodingMethod;
use crate::index::IndexWriterFactory;
use crate::schema::{IndexRule, TagFamilySpec};
use crate::storage::clock::{Clock, SystemClock};
use crate::storage::context::Context;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::interval::{IntervalRule, TimeBuckets};
use crate::storage::series::{BlockReader, SeriesOptions, DEFAULT_PART_SIZE};
use crate::storage::shard::{ScanResult, Shard, ShardIndexConfig, ShardStats};
use crate::storage::types::{Row, ShardId, TimeRange};
use crate::storage::wal::WalSyncMode;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

pub const METADATA_FILE: &str = "metadata.json";
pub const LOCK_FILE: &str = "LOCK";

const METADATA_VERSION: u32 = 1;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Root directory
    pub location: PathBuf,
    /// Number of shards; fixed once the database exists
    pub shard_num: u32,
    pub encoding: EncodingMethod,
    pub families: Vec<TagFamilySpec>,
    pub index_rules: Vec<IndexRule>,
    pub segment_interval: IntervalRule,
    pub block_interval: IntervalRule,
    pub wal_sync: WalSyncMode,
    /// Buffered bytes that seal an open block part; 0 disables the threshold
    pub part_size: usize,
    /// Time source for retention
    pub clock: Arc<dyn Clock>,
    pub index_writer_factory: Option<Arc<dyn IndexWriterFactory>>,
}

impl DatabaseOptions {
    pub fn new(location: impl AsRef<Path>, shard_num: u32) -> Self {
        let buckets = TimeBuckets::default();
        Self {
            location: location.as_ref().to_path_buf(),
            shard_num,
            encoding: EncodingMethod::default(),
            families: Vec::new(),
            index_rules: Vec::new(),
            segment_interval: buckets.segment_interval(),
            block_interval: buckets.block_interval(),
            wal_sync: WalSyncMode::default(),
            part_size: DEFAULT_PART_SIZE,
            clock: Arc::new(SystemClock),
            index_writer_factory: None,
        }
    }
}

/// Contents of `metadata.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DatabaseMetadata {
    version: u32,
    shard_num: u32,
    segment_interval: IntervalRule,
    block_interval: IntervalRule,
}

impl DatabaseMetadata {
    fn load(path: &Path) -> StorageResult<Option<Self>> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, path: &Path) -> StorageResult<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn verify(&self, expected: &DatabaseMetadata) -> StorageResult<()> {
        if self.shard_num != expected.shard_num {
            return Err(StorageError::Config(format!(
                "shard count {} does not match the persisted {}",
                expected.shard_num, self.shard_num
            )));
        }
        if self.segment_interval != expected.segment_interval
            || self.block_interval != expected.block_interval
        {
            return Err(StorageError::Config(format!(
                "intervals {}/{} do not match the persisted {}/{}",
                expected.segment_interval,
                expected.block_interval,
                self.segment_interval,
                self.block_interval
            )));
        }
        Ok(())
    }
}

/// Exclusive hold on a database root; released on drop
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(root: &Path) -> StorageResult<Self> {
        let path = root.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => StorageError::Lock(format!(
                    "{} exists: the database is open elsewhere, or a crashed process left it behind",
                    path.display()
                )),
                _ => StorageError::Io(e),
            })?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self { path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to release lock: {}", e);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub shard_num: u32,
    pub shards: Vec<ShardStats>,
}

impl DatabaseStats {
    pub fn segments(&self) -> usize {
        self.shards.iter().map(|s| s.series.segments).sum()
    }

    pub fn blocks(&self) -> usize {
        self.shards.iter().map(|s| s.series.blocks).sum()
    }

    pub fn parts(&self) -> usize {
        self.shards.iter().map(|s| s.series.parts).sum()
    }

    pub fn rows(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.series.sealed_rows + s.series.buffered_rows)
            .sum()
    }

    pub fn buffered_rows(&self) -> usize {
        self.shards.iter().map(|s| s.series.buffered_rows).sum()
    }

    pub fn index_failures(&self) -> u64 {
        self.shards.iter().map(|s| s.index_failures).sum()
    }
}

impl std::fmt::Display for DatabaseStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Shards: {}, Segments: {}, Blocks: {}, Parts: {}, Rows: {}, Buffered: {}, Index failures: {}",
            self.shard_num,
            self.segments(),
            self.blocks(),
            self.parts(),
            self.rows(),
            self.buffered_rows(),
            self.index_failures()
        )
    }
}

/// An open database: a fixed set of shards under one root
#[derive(Debug)]
pub struct Database {
    root: PathBuf,
    shard_num: u32,
    shards: Vec<Arc<Shard>>,
    clock: Arc<dyn Clock>,
    lock: Mutex<Option<LockFile>>,
    closed: AtomicBool,
}

impl Database {
    /// Open or create the database at `opts.location`.
    ///
    /// Existing segments and blocks are loaded, block write-ahead logs are
    /// replayed, and no segment or block is created. Any failure other than
    /// cancellation is reported as `OpenFailed`.
    pub async fn open(ctx: &Context, opts: DatabaseOptions) -> StorageResult<Self> {
        let root = opts.location.clone();
        Self::open_inner(ctx, opts).await.map_err(|e| match e {
            StorageError::OpenFailed { .. }
            | StorageError::Cancelled
            | StorageError::DeadlineExceeded => e,
            other => StorageError::open_failed(&root, other),
        })
    }

    async fn open_inner(ctx: &Context, opts: DatabaseOptions) -> StorageResult<Self> {
        ctx.check()?;
        if opts.shard_num == 0 {
            return Err(StorageError::Config("shard count must be positive".into()));
        }
        let buckets = TimeBuckets::new(opts.segment_interval, opts.block_interval)?;

        let root = opts.location.clone();
        std::fs::create_dir_all(&root)?;
        let lock = LockFile::acquire(&root)?;

        let expected = DatabaseMetadata {
            version: METADATA_VERSION,
            shard_num: opts.shard_num,
            segment_interval: opts.segment_interval,
            block_interval: opts.block_interval,
        };
        let metadata_path = root.join(METADATA_FILE);
        match DatabaseMetadata::load(&metadata_path)? {
            Some(persisted) => persisted.verify(&expected)?,
            None => expected.store(&metadata_path)?,
        }

        let series_opts = Arc::new(SeriesOptions {
            buckets,
            encoding: opts.encoding.clone(),
            wal_sync: opts.wal_sync,
            part_size: opts.part_size,
        });
        let index = opts.index_writer_factory.clone().map(|factory| ShardIndexConfig {
            factory,
            families: opts.families.clone(),
            index_rules: opts.index_rules.clone(),
        });

        let mut shards = Vec::with_capacity(opts.shard_num as usize);
        for id in 0..opts.shard_num {
            let shard = Shard::open(
                ctx,
                &root,
                id,
                opts.shard_num,
                series_opts.clone(),
                index.as_ref(),
            )
            .await;
            match shard {
                Ok(shard) => shards.push(Arc::new(shard)),
                Err(e) => {
                    for opened in &shards {
                        if let Err(close_err) = opened.close().await {
                            warn!(shard_id = opened.id(), "Failed to close shard: {}", close_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let db = Self {
            root,
            shard_num: opts.shard_num,
            shards,
            clock: opts.clock,
            lock: Mutex::new(Some(lock)),
            closed: AtomicBool::new(false),
        };
        info!(
            root = %db.root.display(),
            shard_num = db.shard_num,
            segment_interval = %opts.segment_interval,
            block_interval = %opts.block_interval,
            "Opened database"
        );
        Ok(db)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_num(&self) -> u32 {
        self.shard_num
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The shard with `id`
    pub fn shard(&self, id: ShardId) -> StorageResult<Arc<Shard>> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        self.shards
            .get(id as usize)
            .cloned()
            .ok_or(StorageError::ShardUnavailable {
                shard_id: id,
                shard_num: self.shard_num,
            })
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// Append a located row to its shard
    pub async fn append(&self, ctx: &Context, shard_id: ShardId, row: Row) -> StorageResult<()> {
        self.shard(shard_id)?.append(ctx, row).await
    }

    /// Readers for the blocks of one shard intersecting `range`
    pub fn query(
        &self,
        ctx: &Context,
        shard_id: ShardId,
        range: &TimeRange,
    ) -> StorageResult<Vec<BlockReader>> {
        self.shard(shard_id)?.query(ctx, range)
    }

    /// Decode one shard's rows in `range`
    pub fn scan(&self, ctx: &Context, shard_id: ShardId, range: &TimeRange) -> StorageResult<ScanResult> {
        self.shard(shard_id)?.scan(ctx, range)
    }

    /// Decode the rows of every shard in `range`, ordered by timestamp
    pub fn scan_all(&self, ctx: &Context, range: &TimeRange) -> StorageResult<ScanResult> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let mut result = ScanResult::default();
        for shard in &self.shards {
            let scanned = shard.scan(ctx, range)?;
            result.rows.extend(scanned.rows);
            result.errors.extend(scanned.errors);
        }
        result.rows.sort_by_key(|r| r.timestamp);
        Ok(result)
    }

    /// Drop every segment whose window ended before `now - ttl`.
    ///
    /// Returns the number of segments removed. Files of a segment still held
    /// by a reader are deleted when the reader lets go.
    pub fn retain(&self, ctx: &Context, ttl: Duration) -> StorageResult<usize> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_millis().saturating_sub(ttl_millis);

        let mut removed = 0;
        for shard in &self.shards {
            ctx.check()?;
            removed += shard.retain(cutoff)?;
        }
        if removed > 0 {
            info!(removed, cutoff, "Applied retention");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> StorageResult<DatabaseStats> {
        let shards = self
            .shards
            .iter()
            .map(|s| s.stats())
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(DatabaseStats {
            shard_num: self.shard_num,
            shards,
        })
    }

    /// Close every shard and release the lock.
    ///
    /// Every shard is closed even if some fail; the failures are returned
    /// together. A second call is a no-op.
    pub async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errors = Vec::new();
        for shard in &self.shards {
            if let Err(e) = shard.close().await {
                warn!(shard_id = shard.id(), "Failed to close shard: {}", e);
                errors.push(e);
            }
        }

        self.lock.lock()?.take();
        info!(root = %self.root.display(), "Closed database");
        StorageError::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{TagIndex, TagIndexWriterFactory};
    use crate::partition::EntityLocator;
    use crate::schema::fixtures::{duration_rule, sw_stream};
    use crate::storage::clock::ManualClock;
    use crate::storage::types::{Element, TagValue};
    use tempfile::tempdir;

    // 2024-03-15T00:00:00Z
    const DAY_START: i64 = 1_710_460_800_000;
    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;

    fn options(root: &Path, shard_num: u32) -> DatabaseOptions {
        DatabaseOptions::new(root, shard_num)
    }

    async fn create_test_database(root: &Path, shard_num: u32) -> Database {
        Database::open(&Context::background(), options(root, shard_num))
            .await
            .unwrap()
    }

    fn element(id: &str, ts: i64, service: &str, instance: &str) -> Element {
        Element::new(id, ts).family(vec![
            service.into(),
            "/api".into(),
            instance.into(),
            TagValue::Int(ts % 1000),
        ])
    }

    /// Locate and append, the way a stream write does
    async fn write(db: &Database, locator: &EntityLocator, element: Element) -> ShardId {
        let (entity, shard_id) = locator
            .locate(&element.tag_families, db.shard_num())
            .unwrap();
        db.append(&Context::background(), shard_id, Row::from_element(element, entity))
            .await
            .unwrap();
        shard_id
    }

    fn locator() -> EntityLocator {
        let schema = sw_stream(4);
        EntityLocator::new(&schema.tag_families, &schema.entity).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_layout_without_segments() {
        let dir = tempdir().unwrap();
        let db = create_test_database(dir.path(), 4).await;

        assert!(dir.path().join(METADATA_FILE).exists());
        assert!(dir.path().join(LOCK_FILE).exists());
        for id in 0..4 {
            let shard_dir = dir.path().join(format!("shard-{}", id));
            assert!(shard_dir.is_dir());
            assert!(!shard_dir.join("series").exists());
        }
        assert_eq!(db.stats().unwrap().segments(), 0);

        db.close().await.unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_zero_shards_fails_open() {
        let dir = tempdir().unwrap();
        let result = Database::open(&Context::background(), options(dir.path(), 0)).await;
        assert!(matches!(result, Err(StorageError::OpenFailed { .. })));
    }

    #[tokio::test]
    async fn test_invalid_intervals_fail_open() {
        let dir = tempdir().unwrap();
        let mut opts = options(dir.path(), 1);
        opts.block_interval = IntervalRule::hours(5);
        let result = Database::open(&Context::background(), opts).await;
        assert!(matches!(result, Err(StorageError::OpenFailed { .. })));
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let db = create_test_database(dir.path(), 2).await;

        let second = Database::open(&Context::background(), options(dir.path(), 2)).await;
        assert!(matches!(second, Err(StorageError::OpenFailed { .. })));

        db.close().await.unwrap();
        let reopened = create_test_database(dir.path(), 2).await;
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_with_other_shard_count_fails() {
        let dir = tempdir().unwrap();
        create_test_database(dir.path(), 4).await.close().await.unwrap();

        let result = Database::open(&Context::background(), options(dir.path(), 8)).await;
        match result {
            Err(StorageError::OpenFailed { reason, .. }) => {
                assert!(reason.contains("shard count"), "{}", reason)
            }
            other => panic!("expected OpenFailed, got {:?}", other.map(|_| ())),
        }
        // A failed open leaves no lock behind
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        for _ in 0..3 {
            let db = create_test_database(dir.path(), 3).await;
            assert_eq!(db.shard_num(), 3);
            db.close().await.unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 4);
    }

    #[tokio::test]
    async fn test_shard_out_of_range() {
        let dir = tempdir().unwrap();
        let db = create_test_database(dir.path(), 2).await;
        assert!(db.shard(1).is_ok());
        assert!(matches!(
            db.shard(2),
            Err(StorageError::ShardUnavailable {
                shard_id: 2,
                shard_num: 2
            })
        ));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_write_creates_segment_and_block_dirs() {
        let dir = tempdir().unwrap();
        let db = create_test_database(dir.path(), 4).await;
        let locator = locator();

        let shard_id = write(&db, &locator, element("e1", DAY_START + 30 * 60_000, "svcA", "i-1")).await;

        let block_dir = dir
            .path()
            .join(format!("shard-{}", shard_id))
            .join("series/seg-20240315/block-0000");
        assert!(block_dir.is_dir());
        assert!(block_dir.join("wal.log").exists());

        let stats = db.stats().unwrap();
        assert_eq!((stats.segments(), stats.blocks(), stats.rows()), (1, 1, 1));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_boundary_timestamp_routes_to_next_block() {
        let dir = tempdir().unwrap();
        let db = create_test_database(dir.path(), 1).await;
        let locator = locator();

        write(&db, &locator, element("a", DAY_START + 2 * HOUR - 1, "svcA", "i-1")).await;
        write(&db, &locator, element("b", DAY_START + 2 * HOUR, "svcA", "i-1")).await;
        write(&db, &locator, element("c", DAY_START + DAY, "svcA", "i-1")).await;

        let series = dir.path().join("shard-0/series");
        assert!(series.join("seg-20240315/block-0000").is_dir());
        assert!(series.join("seg-20240315/block-0200").is_dir());
        assert!(series.join("seg-20240316/block-0000").is_dir());

        let ctx = Context::background();
        let first = db
            .query(&ctx, 0, &TimeRange::new(DAY_START, DAY_START + 2 * HOUR).unwrap())
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].window().end, DAY_START + 2 * HOUR);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_then_reopen_decodes_every_record() {
        let dir = tempdir().unwrap();
        let locator = locator();
        let ctx = Context::background();

        let db = create_test_database(dir.path(), 4).await;
        let mut expected = Vec::new();
        for i in 0..40 {
            let ts = DAY_START + i * 17 * 60_000;
            let instance = format!("i-{}", i % 5);
            let el = element(&format!("e{}", i), ts, "svcA", &instance);
            let (entity, _) = locator.locate(&el.tag_families, 4).unwrap();
            expected.push(Row::from_element(el.clone(), entity));
            write(&db, &locator, el).await;
        }
        db.close().await.unwrap();

        let db = create_test_database(dir.path(), 4).await;
        let scan = db.scan_all(&ctx, &TimeRange::all()).unwrap();
        assert!(scan.errors.is_empty());
        assert_eq!(scan.rows, expected);
        assert_eq!(db.stats().unwrap().buffered_rows(), 0);
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_across_shards() {
        const WRITERS: i64 = 8;
        const PER_WRITER: i64 = 100;

        let dir = tempdir().unwrap();
        let db = Arc::new(create_test_database(dir.path(), 4).await);
        let locator = Arc::new(locator());

        let mut tasks = tokio::task::JoinSet::new();
        for w in 0..WRITERS {
            let db = db.clone();
            let locator = locator.clone();
            tasks.spawn(async move {
                let mut shards = Vec::new();
                for i in 0..PER_WRITER {
                    // Straddles midnight so writers also race through rotation
                    let ts = DAY_START + DAY - HOUR + (i * WRITERS + w) * 10_000;
                    let service = format!("svc-{}", i % 5);
                    let el = element(&format!("w{}-{}", w, i), ts, &service, &format!("i-{}", w));
                    shards.push(write(&db, &locator, el).await);
                }
                shards
            });
        }

        let mut used = std::collections::HashSet::new();
        while let Some(shards) = tasks.join_next().await {
            used.extend(shards.unwrap());
        }
        assert!(used.len() > 1, "writes should spread over several shards");

        let mut expected: Vec<String> = (0..WRITERS)
            .flat_map(|w| (0..PER_WRITER).map(move |i| format!("w{}-{}", w, i)))
            .collect();
        expected.sort();
        let ids = |scan: ScanResult| {
            assert!(scan.errors.is_empty());
            let mut ids: Vec<String> = scan.rows.into_iter().map(|r| r.element_id).collect();
            ids.sort();
            ids
        };

        let ctx = Context::background();
        assert_eq!(ids(db.scan_all(&ctx, &TimeRange::all()).unwrap()), expected);
        db.close().await.unwrap();
        drop(db);

        let db = create_test_database(dir.path(), 4).await;
        assert_eq!(ids(db.scan_all(&ctx, &TimeRange::all()).unwrap()), expected);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unclosed_database_replays_wal_on_reopen() {
        let dir = tempdir().unwrap();
        let locator = locator();

        {
            let db = create_test_database(dir.path(), 2).await;
            write(&db, &locator, element("e1", DAY_START + 5, "svcA", "i-1")).await;
            write(&db, &locator, element("e2", DAY_START + 6, "svcB", "i-2")).await;
            assert_eq!(db.stats().unwrap().parts(), 0);
            // Dropped without close: only the write-ahead logs hold the rows
        }

        let db = create_test_database(dir.path(), 2).await;
        let scan = db.scan_all(&Context::background(), &TimeRange::all()).unwrap();
        let ids: Vec<_> = scan.rows.iter().map(|r| r.element_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        let stats = db.stats().unwrap();
        assert_eq!(stats.buffered_rows(), 0);
        assert!(stats.parts() >= 1);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_uses_clock() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(DAY_START + 3 * DAY + HOUR));
        let mut opts = options(dir.path(), 1);
        opts.clock = clock.clone();
        let db = Database::open(&Context::background(), opts).await.unwrap();
        let locator = locator();

        for day in 0..3 {
            write(&db, &locator, element("e", DAY_START + day * DAY + HOUR, "svcA", "i-1")).await;
        }

        let ctx = Context::background();
        // now - 2d = 2024-03-16T01:00, only the 15th has ended
        assert_eq!(db.retain(&ctx, Duration::from_secs(2 * 86_400)).unwrap(), 1);
        assert!(!dir.path().join("shard-0/series/seg-20240315").exists());

        clock.advance(DAY);
        assert_eq!(db.retain(&ctx, Duration::from_secs(2 * 86_400)).unwrap(), 1);
        assert_eq!(db.stats().unwrap().segments(), 1);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice_and_use_after_close() {
        let dir = tempdir().unwrap();
        let db = create_test_database(dir.path(), 1).await;
        db.close().await.unwrap();
        db.close().await.unwrap();

        assert!(db.is_closed());
        assert!(matches!(db.shard(0), Err(StorageError::Closed)));
    }

    #[tokio::test]
    async fn test_cancelled_open() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        ctx.cancel();
        let result = Database::open(&ctx, options(dir.path(), 1)).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_index_writer_attached_per_shard() {
        let dir = tempdir().unwrap();
        let schema = sw_stream(2);
        let mut opts = options(dir.path(), 2);
        opts.families = schema.tag_families.clone();
        opts.index_rules = vec![duration_rule()];
        opts.index_writer_factory = Some(Arc::new(TagIndexWriterFactory));
        let db = Database::open(&Context::background(), opts).await.unwrap();

        let shard_id = write(&db, &locator(), element("e1", DAY_START + 7, "svcA", "i-1")).await;
        db.close().await.unwrap();

        let index = TagIndex::new(&dir.path().join(format!("shard-{}", shard_id))).unwrap();
        assert_eq!(index.find("duration", "7").len(), 1);
    }

    #[tokio::test]
    async fn test_stats_display() {
        let dir = tempdir().unwrap();
        let db = create_test_database(dir.path(), 2).await;
        write(&db, &locator(), element("e1", DAY_START, "svcA", "i-1")).await;

        let line = db.stats().unwrap().to_string();
        assert!(line.starts_with("Shards: 2, Segments: 1, Blocks: 1, Parts: 0, Rows: 1"));
        db.close().await.unwrap();
    }
}
