//! # Canopy
//!
//! Time-partitioned storage core for an observability database.
//!
//! ## Features
//!
//! - **Deterministic routing**: entities hash to a fixed shard
//! - **Time partitioning**: shards hold segments, segments hold blocks
//! - **Durability**: every open block is backed by a write-ahead log
//! - **Pluggable encodings**: plain and LZ4 column codecs behind one pool API
//! - **Index seam**: appends notify a per-shard index writer
//!
//! ## Modules
//!
//! - [`storage`]: database, shards, series store, segments, blocks
//! - [`partition`]: entity location and shard routing
//! - [`encoding`]: column encoder and decoder pools
//! - [`index`]: index writer seam and the tag index
//! - [`schema`]: stream schema and index rule documents
//! - [`stream`]: a schema bound to its database
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use canopy::schema::StreamSchema;
//! use canopy::storage::{Context, Element, TimeRange};
//! use canopy::stream::{Stream, StreamOptions, StreamSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Context::background();
//!     let schema = StreamSchema::load("sw.json".as_ref())?;
//!     let spec = StreamSpec { schema, index_rules: Vec::new() };
//!     let stream = Stream::open(&ctx, "./data", spec, StreamOptions::default()).await?;
//!
//!     let element = Element::new("span-1", 1_710_460_800_000)
//!         .family(vec!["svcA".into(), "/home".into(), "i-1".into(), 120.into()]);
//!     stream.write(&ctx, element).await?;
//!
//!     let rows = stream.query(&ctx, &TimeRange::last_hours(1))?.rows;
//!     println!("Found {} rows", rows.len());
//!
//!     stream.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod encoding;
pub mod index;
pub mod partition;
pub mod schema;
pub mod storage;
pub mod stream;

// Re-export top-level types for convenience
pub use storage::{
    Context, Database, DatabaseOptions, Element, Entity, Row, ShardId, StorageError,
    StorageResult, TagValue, TimeRange, Timestamp,
};

pub use encoding::{EncodingKind, EncodingMethod};

pub use partition::EntityLocator;

pub use stream::{format_stream_id, Stream, StreamOptions, StreamSpec};

pub use config::{Config, ConfigError, LoggingConfig, StorageConfig};
