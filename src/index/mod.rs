//! Secondary index seam
//!
//! Each shard builds at most one [`IndexWriter`] at open time through an
//! [`IndexWriterFactory`], forwards every appended record to it, and closes
//! it on shard close. Index failures never roll back a durable append.
//!
//! [`TagIndexWriter`] is the bundled writer: an inverted index from tag
//! values to postings, kept in memory and persisted as JSON under the shard
//! directory.

mod tag_index;

pub use tag_index::{Posting, TagIndex, TagIndexWriter, TagIndexWriterFactory};

use crate::schema::{IndexRule, TagFamilySpec};
use crate::storage::error::StorageResult;
use crate::storage::types::{Entity, ShardId, TagFamilyForWrite, Timestamp};
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::PathBuf;

/// Everything a writer needs to know about the shard it serves
#[derive(Debug, Clone)]
pub struct IndexWriterOptions {
    pub shard_id: ShardId,
    pub shard_num: u32,
    pub shard_path: PathBuf,
    pub families: Vec<TagFamilySpec>,
    pub index_rules: Vec<IndexRule>,
}

/// One appended record, as seen by the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub entity: Entity,
    pub shard_id: ShardId,
    pub timestamp: Timestamp,
    pub element_id: String,
    pub tag_families: Vec<TagFamilyForWrite>,
}

#[async_trait]
pub trait IndexWriter: Send + Sync + Debug {
    async fn write(&self, request: IndexRequest) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

pub trait IndexWriterFactory: Send + Sync + Debug {
    fn build(&self, opts: IndexWriterOptions) -> StorageResult<Box<dyn IndexWriter>>;
}
