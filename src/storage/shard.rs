//! Shards: independent physical partitions of a database
//!
//! A shard owns one series store under `<root>/shard-<id>` and, optionally,
//! one index writer. Index notification is fire-and-forget: appends enqueue
//! the record on an unbounded channel drained by a background task, so write
//! latency never depends on index latency. Failed index writes are logged,
//! counted and the last one kept for inspection; they never undo the append.

use crate::index::{IndexRequest, IndexWriter, IndexWriterFactory, IndexWriterOptions};
use crate::schema::{IndexRule, TagFamilySpec};
use crate::storage::context::Context;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::series::{BlockReader, SeriesOptions, SeriesStats, SeriesStore};
use crate::storage::types::{Row, ShardId, TimeRange, Timestamp};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest a shard close waits for queued index notifications
pub const INDEX_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn shard_dir_name(id: ShardId) -> String {
    format!("shard-{}", id)
}

/// What a shard needs to build its index writer
#[derive(Debug, Clone)]
pub struct ShardIndexConfig {
    pub factory: Arc<dyn IndexWriterFactory>,
    pub families: Vec<TagFamilySpec>,
    pub index_rules: Vec<IndexRule>,
}

#[derive(Debug, Default)]
struct IndexHealth {
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl IndexHealth {
    fn record(&self, shard_id: ShardId, err: &StorageError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        error!(shard_id, "Index write failed: {}", err);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
    }
}

#[derive(Debug)]
struct IndexNotifier {
    tx: Mutex<Option<mpsc::UnboundedSender<IndexRequest>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    writer: Arc<dyn IndexWriter>,
    health: Arc<IndexHealth>,
}

impl IndexNotifier {
    fn spawn(shard_id: ShardId, writer: Arc<dyn IndexWriter>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<IndexRequest>();
        let health = Arc::new(IndexHealth::default());

        let task_writer = writer.clone();
        let task_health = health.clone();
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(e) = task_writer.write(request).await {
                    task_health.record(shard_id, &e);
                }
            }
            debug!(shard_id, "Index notifier drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            task: tokio::sync::Mutex::new(Some(task)),
            writer,
            health,
        }
    }

    fn notify(&self, shard_id: ShardId, request: IndexRequest) {
        let sent = match self.tx.lock() {
            Ok(tx) => tx.as_ref().map(|tx| tx.send(request).is_ok()).unwrap_or(false),
            Err(_) => false,
        };
        if !sent {
            self.health
                .record(shard_id, &StorageError::Index("index notifier is closed".into()));
        }
    }

    /// Stop accepting requests, wait for the queue to drain, close the writer
    async fn close(&self, shard_id: ShardId) -> StorageResult<()> {
        self.tx.lock()?.take();

        if let Some(task) = self.task.lock().await.take() {
            match tokio::time::timeout(INDEX_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(shard_id, "Index notifier task failed: {}", e),
                Err(_) => warn!(
                    shard_id,
                    "Index notifier did not drain within {:?}", INDEX_DRAIN_TIMEOUT
                ),
            }
        }

        self.writer.close().await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub id: ShardId,
    pub series: SeriesStats,
    pub index_failures: u64,
    pub last_index_error: Option<String>,
}

/// A block that failed to decode during a scan
#[derive(Debug)]
pub struct BlockError {
    pub block: PathBuf,
    pub error: StorageError,
}

/// Rows of every readable block in a range, plus the blocks that were not
#[derive(Debug, Default)]
pub struct ScanResult {
    pub rows: Vec<Row>,
    pub errors: Vec<BlockError>,
}

#[derive(Debug)]
pub struct Shard {
    id: ShardId,
    path: PathBuf,
    series: SeriesStore,
    index: Option<IndexNotifier>,
    closed: AtomicBool,
}

impl Shard {
    /// Open the shard directory under `root`, loading its series store and
    /// building its index writer
    pub async fn open(
        ctx: &Context,
        root: &Path,
        id: ShardId,
        shard_num: u32,
        series_opts: Arc<SeriesOptions>,
        index: Option<&ShardIndexConfig>,
    ) -> StorageResult<Self> {
        let path = root.join(shard_dir_name(id));
        std::fs::create_dir_all(&path)?;

        let series = SeriesStore::open(ctx, &path, series_opts)?;

        let index = match index {
            Some(cfg) => {
                let writer = cfg.factory.build(IndexWriterOptions {
                    shard_id: id,
                    shard_num,
                    shard_path: path.clone(),
                    families: cfg.families.clone(),
                    index_rules: cfg.index_rules.clone(),
                })?;
                Some(IndexNotifier::spawn(id, Arc::from(writer)))
            }
            None => None,
        };

        debug!(shard_id = id, path = %path.display(), "Opened shard");
        Ok(Self {
            id,
            path,
            series,
            index,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn series(&self) -> &SeriesStore {
        &self.series
    }

    /// Durably append a row, then hand it to the index writer
    pub async fn append(&self, ctx: &Context, row: Row) -> StorageResult<()> {
        ctx.check()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }

        let request = self.index.as_ref().map(|_| IndexRequest {
            entity: row.entity.clone(),
            shard_id: self.id,
            timestamp: row.timestamp,
            element_id: row.element_id.clone(),
            tag_families: row.tag_families.clone(),
        });

        self.series.append(row)?;

        if let (Some(index), Some(request)) = (&self.index, request) {
            index.notify(self.id, request);
        }
        Ok(())
    }

    /// Readers for every block intersecting `range`
    pub fn query(&self, ctx: &Context, range: &TimeRange) -> StorageResult<Vec<BlockReader>> {
        ctx.check()?;
        self.series.blocks_in(range)
    }

    /// Decode every block intersecting `range`.
    ///
    /// A block that fails to decode is reported in the result and does not
    /// stop the scan of its siblings.
    pub fn scan(&self, ctx: &Context, range: &TimeRange) -> StorageResult<ScanResult> {
        let mut result = ScanResult::default();
        for reader in self.query(ctx, range)? {
            ctx.check()?;
            match reader.rows(range) {
                Ok(rows) => result.rows.extend(rows),
                Err(error) => {
                    warn!(block = %reader.path().display(), "Block decode failed: {}", error);
                    result.errors.push(BlockError {
                        block: reader.path().to_path_buf(),
                        error,
                    });
                }
            }
        }
        result.rows.sort_by_key(|r| r.timestamp);
        Ok(result)
    }

    /// Drop segments whose window ended at or before `cutoff`
    pub fn retain(&self, cutoff: Timestamp) -> StorageResult<usize> {
        self.series.retain(cutoff)
    }

    pub fn stats(&self) -> StorageResult<ShardStats> {
        let (index_failures, last_index_error) = match &self.index {
            Some(index) => (
                index.health.failures.load(Ordering::Relaxed),
                index.health.last_error.lock()?.clone(),
            ),
            None => (0, None),
        };
        Ok(ShardStats {
            id: self.id,
            series: self.series.stats()?,
            index_failures,
            last_index_error,
        })
    }

    /// Seal open blocks, drain and close the index writer.
    ///
    /// Both steps run even if one fails; a second call is a no-op.
    pub async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errors = Vec::new();
        if let Err(e) = self.series.close() {
            errors.push(e);
        }
        if let Some(index) = &self.index {
            if let Err(e) = index.close(self.id).await {
                errors.push(e);
            }
        }

        info!(shard_id = self.id, "Closed shard");
        StorageError::aggregate(errors)
    }
}
