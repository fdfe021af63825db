//! Stream: a schema bound to its own database
//!
//! A stream parses its schema into an entity locator once, opens a database
//! sized by the schema's shard count and attaches the tag index writer to
//! every shard. Writes are located first and appended second, so a payload
//! that cannot be routed never reaches disk.

use crate::encoding::{EncodingMethod, DEFAULT_CHUNK_SIZE};
use crate::index::TagIndexWriterFactory;
use crate::partition::EntityLocator;
use crate::schema::{IndexRule, StreamSchema};
use crate::storage::clock::{Clock, SystemClock};
use crate::storage::context::Context;
use crate::storage::database::{Database, DatabaseOptions, DatabaseStats};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::interval::{IntervalRule, TimeBuckets};
use crate::storage::series::{BlockReader, DEFAULT_PART_SIZE};
use crate::storage::shard::ScanResult;
use crate::storage::types::{Element, Entity, Row, ShardId, TimeRange};
use crate::storage::wal::WalSyncMode;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Stream identifier used in logs and registries
pub fn format_stream_id(name: &str, group: &str) -> String {
    format!("{}:{}", name, group)
}

/// Schema and index rules of a stream
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub schema: StreamSchema,
    pub index_rules: Vec<IndexRule>,
}

/// Storage settings of a stream; everything else comes from the schema
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub encoding: EncodingMethod,
    pub segment_interval: IntervalRule,
    pub block_interval: IntervalRule,
    pub wal_sync: WalSyncMode,
    pub part_size: usize,
    pub clock: Arc<dyn Clock>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        let buckets = TimeBuckets::default();
        Self {
            encoding: EncodingMethod::plain(DEFAULT_CHUNK_SIZE),
            segment_interval: buckets.segment_interval(),
            block_interval: buckets.block_interval(),
            wal_sync: WalSyncMode::default(),
            part_size: DEFAULT_PART_SIZE,
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug)]
pub struct Stream {
    name: String,
    group: String,
    schema: StreamSchema,
    index_rules: Vec<IndexRule>,
    locator: EntityLocator,
    db: Database,
}

impl Stream {
    pub async fn open(
        ctx: &Context,
        root: impl AsRef<Path>,
        spec: StreamSpec,
        options: StreamOptions,
    ) -> StorageResult<Self> {
        let StreamSpec {
            schema,
            index_rules,
        } = spec;
        let locator = EntityLocator::new(&schema.tag_families, &schema.entity)?;

        let db = Database::open(
            ctx,
            DatabaseOptions {
                location: root.as_ref().to_path_buf(),
                shard_num: schema.opts.shard_num,
                encoding: options.encoding,
                families: schema.tag_families.clone(),
                index_rules: index_rules.clone(),
                segment_interval: options.segment_interval,
                block_interval: options.block_interval,
                wal_sync: options.wal_sync,
                part_size: options.part_size,
                clock: options.clock,
                index_writer_factory: Some(Arc::new(TagIndexWriterFactory)),
            },
        )
        .await?;

        let stream = Self {
            name: schema.metadata.name.clone(),
            group: schema.metadata.group.clone(),
            schema,
            index_rules,
            locator,
            db,
        };
        info!(stream = %stream.id(), shards = stream.db.shard_num(), "Opened stream");
        Ok(stream)
    }

    pub fn id(&self) -> String {
        format_stream_id(&self.name, &self.group)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn schema(&self) -> &StreamSchema {
        &self.schema
    }

    pub fn index_rules(&self) -> &[IndexRule] {
        &self.index_rules
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Entity and shard of a payload
    pub fn locate(&self, element: &Element) -> StorageResult<(Entity, ShardId)> {
        if element.tag_families.len() > self.schema.tag_families.len() {
            return Err(StorageError::MalformedElement(format!(
                "element has {} tag families, stream {} declares {}",
                element.tag_families.len(),
                self.id(),
                self.schema.tag_families.len()
            )));
        }
        self.locator
            .locate(&element.tag_families, self.db.shard_num())
    }

    /// Locate an element and append it to its shard
    pub async fn write(&self, ctx: &Context, element: Element) -> StorageResult<ShardId> {
        let (entity, shard_id) = self.locate(&element)?;
        self.db
            .append(ctx, shard_id, Row::from_element(element, entity))
            .await?;
        Ok(shard_id)
    }

    /// Rows of every shard in `range`, ordered by timestamp
    pub fn query(&self, ctx: &Context, range: &TimeRange) -> StorageResult<ScanResult> {
        self.db.scan_all(ctx, range)
    }

    /// Block readers of one shard in `range`
    pub fn blocks(
        &self,
        ctx: &Context,
        shard_id: ShardId,
        range: &TimeRange,
    ) -> StorageResult<Vec<BlockReader>> {
        self.db.query(ctx, shard_id, range)
    }

    pub fn stats(&self) -> StorageResult<DatabaseStats> {
        self.db.stats()
    }

    pub async fn close(&self) -> StorageResult<()> {
        self.db.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TagIndex;
    use crate::schema::fixtures::{duration_rule, endpoint_rule, sw_stream};
    use crate::storage::types::{TagFamilyForWrite, TagValue};
    use tempfile::tempdir;

    // 2024-03-15T00:00:00Z
    const DAY_START: i64 = 1_710_460_800_000;

    fn spec(shard_num: u32) -> StreamSpec {
        StreamSpec {
            schema: sw_stream(shard_num),
            index_rules: vec![duration_rule(), endpoint_rule()],
        }
    }

    fn span(id: &str, ts: i64, service: &str, instance: &str) -> Element {
        Element::new(id, ts)
            .family(vec![
                service.into(),
                "/home".into(),
                instance.into(),
                TagValue::Int(500),
            ])
            .family(vec![TagValue::BinaryData(vec![0xCA, 0xFE])])
    }

    async fn create_test_stream(root: &Path, shard_num: u32) -> Stream {
        Stream::open(
            &Context::background(),
            root,
            spec(shard_num),
            StreamOptions::default(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_format_stream_id() {
        assert_eq!(format_stream_id("sw", "default"), "sw:default");
    }

    #[tokio::test]
    async fn test_open_uses_schema_shard_count() {
        let dir = tempdir().unwrap();
        let stream = create_test_stream(dir.path(), 2).await;
        assert_eq!(stream.id(), "sw:default");
        assert_eq!(stream.database().shard_num(), 2);
        assert_eq!(stream.index_rules().len(), 2);
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_query_round_trip() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();

        let stream = create_test_stream(dir.path(), 2).await;
        stream.write(&ctx, span("s1", DAY_START + 2, "svcA", "i-1")).await.unwrap();
        stream.write(&ctx, span("s2", DAY_START + 1, "svcB", "i-9")).await.unwrap();
        stream.close().await.unwrap();

        let stream = create_test_stream(dir.path(), 2).await;
        let result = stream.query(&ctx, &TimeRange::all()).unwrap();
        let ids: Vec<_> = result.rows.iter().map(|r| r.element_id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);
        assert_eq!(
            result.rows[1].tag_families[1].tags[0],
            TagValue::BinaryData(vec![0xCA, 0xFE])
        );
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_entity_same_shard() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let stream = create_test_stream(dir.path(), 4).await;

        let first = stream.write(&ctx, span("a", DAY_START, "svcA", "i-1")).await.unwrap();
        let second = stream.write(&ctx, span("b", DAY_START + 1, "svcA", "i-1")).await.unwrap();
        assert_eq!(first, second);

        let blocks = stream.blocks(&ctx, first, &TimeRange::all()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].rows(&TimeRange::all()).unwrap().len(), 2);
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_write_touches_nothing() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let stream = create_test_stream(dir.path(), 2).await;

        let mut short = Element::new("bad", DAY_START);
        short.tag_families = vec![TagFamilyForWrite::new(vec!["svcA".into()])];
        assert!(matches!(
            stream.write(&ctx, short).await,
            Err(StorageError::MalformedElement(_))
        ));

        let mut extra = span("bad", DAY_START, "svcA", "i-1");
        extra.tag_families.push(TagFamilyForWrite::default());
        assert!(matches!(
            stream.write(&ctx, extra).await,
            Err(StorageError::MalformedElement(_))
        ));

        assert_eq!(stream.stats().unwrap().segments(), 0);
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_entity_tag_fails_open() {
        let dir = tempdir().unwrap();
        let mut spec = spec(2);
        spec.schema.entity.tag_names.push("region".into());

        let result = Stream::open(
            &Context::background(),
            dir.path(),
            spec,
            StreamOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(StorageError::InvalidSchema(_))));
        assert!(!dir.path().join("metadata.json").exists());
    }

    #[tokio::test]
    async fn test_writes_are_indexed() {
        let dir = tempdir().unwrap();
        let ctx = Context::background();
        let stream = create_test_stream(dir.path(), 1).await;

        stream.write(&ctx, span("s1", DAY_START, "svcA", "i-1")).await.unwrap();
        stream.close().await.unwrap();

        let index = TagIndex::new(&dir.path().join("shard-0")).unwrap();
        assert_eq!(index.find("endpoint", "/home").len(), 1);
        assert_eq!(index.find("duration", "500").len(), 1);
    }
}
