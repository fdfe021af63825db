//! Time-partitioned storage
//!
//! - **database**: root directory, shard set, lock and metadata
//! - **shard**: one series store plus its index notifier
//! - **series**: ordered segments of a shard
//! - **segment**: ordered blocks of one segment window
//! - **block**: sealed parts plus the open, write-ahead-logged buffer
//! - **part**: immutable columnar part file
//! - **wal**: per-block write-ahead log
//! - **interval**: window alignment and canonical directory names
//! - **context**, **clock**: cancellation and time sources
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Row → Shard → Segment(ts) → Block(ts) → WAL → Buffer → Part
//!
//! Read Path:
//!   (shard, range) → Segments → Blocks → Parts + Buffer → Rows
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use canopy::storage::{Context, Database, DatabaseOptions, Row, TimeRange};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Context::background();
//!     let db = Database::open(&ctx, DatabaseOptions::new("./data", 4)).await?;
//!
//!     let readers = db.query(&ctx, 0, &TimeRange::last_hours(1))?;
//!     for reader in readers {
//!         let rows: Vec<Row> = reader.rows(&TimeRange::last_hours(1))?;
//!         println!("{}: {} rows", reader.path().display(), rows.len());
//!     }
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod clock;
pub mod context;
pub mod database;
pub mod error;
pub mod interval;
pub mod part;
pub mod segment;
pub mod series;
pub mod shard;
pub mod types;
pub mod wal;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::Context;
pub use database::{Database, DatabaseOptions, DatabaseStats};
pub use error::{StorageError, StorageResult};
pub use interval::{IntervalRule, IntervalUnit, TimeBuckets};
pub use series::{BlockReader, SeriesOptions, SeriesStats};
pub use shard::{BlockError, ScanResult, Shard, ShardStats};
pub use types::{
    Element, Entity, Row, ShardId, TagFamilyForWrite, TagValue, TimeRange, Timestamp,
};
pub use wal::WalSyncMode;
