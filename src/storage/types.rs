//! Core data types for the canopy storage core
//!
//! - `TagValue` / `TagFamilyForWrite`: the typed write payload
//! - `Element`: one write (id, timestamp, tag families)
//! - `Entity`: marshaled entity tag values in schema order
//! - `Row`: a stored record as it comes back out of a block
//! - `TimeRange`: a half-open query interval

use crate::storage::error::{StorageError, StorageResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch (UTC)
pub type Timestamp = i64;

/// Identifier of one physical partition, in `[0, shard_num)`
pub type ShardId = u32;

/// A single typed tag value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagValue {
    Null,
    Str(String),
    Int(i64),
    StrArray(Vec<String>),
    IntArray(Vec<i64>),
    BinaryData(Vec<u8>),
}

impl TagValue {
    /// Approximate in-memory size, used for part size accounting
    pub fn estimated_size(&self) -> usize {
        match self {
            TagValue::Null => 1,
            TagValue::Str(s) => s.len() + 8,
            TagValue::Int(_) => 8,
            TagValue::StrArray(v) => v.iter().map(|s| s.len() + 8).sum::<usize>() + 8,
            TagValue::IntArray(v) => v.len() * 8 + 8,
            TagValue::BinaryData(b) => b.len() + 8,
        }
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        TagValue::Str(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        TagValue::Str(s)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

/// The values of one tag family, positionally matching the family spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFamilyForWrite {
    pub tags: Vec<TagValue>,
}

impl TagFamilyForWrite {
    pub fn new(tags: Vec<TagValue>) -> Self {
        Self { tags }
    }
}

/// One write: an element of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub element_id: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub tag_families: Vec<TagFamilyForWrite>,
}

impl Element {
    pub fn new(element_id: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            element_id: element_id.into(),
            timestamp,
            tag_families: Vec::new(),
        }
    }

    /// Builder method: append a tag family
    pub fn family(mut self, tags: Vec<TagValue>) -> Self {
        self.tag_families.push(TagFamilyForWrite::new(tags));
        self
    }
}

/// Canonical entity: one marshaled value per entity tag, in schema order
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity(pub Vec<Vec<u8>>);

impl Entity {
    pub fn new(entries: Vec<Vec<u8>>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[Vec<u8>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Plain concatenation of the entries; this is the shard-routing key
    pub fn marshal(&self) -> Vec<u8> {
        self.0.concat()
    }

    /// Length-delimited form that keeps entry boundaries, used for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.0.iter().map(|e| e.len() + 4).sum::<usize>());
        buf.extend_from_slice(&(self.0.len() as u32).to_le_bytes());
        for entry in &self.0 {
            buf.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            buf.extend_from_slice(entry);
        }
        buf
    }

    /// Inverse of [`Entity::to_bytes`]
    pub fn from_bytes(data: &[u8]) -> StorageResult<Self> {
        let mut pos = 0usize;
        let count = read_u32(data, &mut pos)? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let len = read_u32(data, &mut pos)? as usize;
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| StorageError::CorruptData("entity entry truncated".into()))?;
            entries.push(data[pos..end].to_vec());
            pos = end;
        }
        if pos != data.len() {
            return Err(StorageError::CorruptData(format!(
                "entity has {} trailing bytes",
                data.len() - pos
            )));
        }
        Ok(Self(entries))
    }
}

fn read_u32(data: &[u8], pos: &mut usize) -> StorageResult<u32> {
    let end = *pos + 4;
    let bytes = data
        .get(*pos..end)
        .ok_or_else(|| StorageError::CorruptData("entity header truncated".into()))?;
    *pos = end;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// A stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: Timestamp,
    pub element_id: String,
    pub entity: Entity,
    pub tag_families: Vec<TagFamilyForWrite>,
}

impl Row {
    pub fn from_element(element: Element, entity: Entity) -> Self {
        Self {
            timestamp: element.timestamp,
            element_id: element.element_id,
            entity,
            tag_families: element.tag_families,
        }
    }

    /// Get estimated size in bytes (for buffer management)
    pub fn estimated_size(&self) -> usize {
        let tags: usize = self
            .tag_families
            .iter()
            .flat_map(|f| f.tags.iter())
            .map(|t| t.estimated_size())
            .sum();
        let entity: usize = self.entity.0.iter().map(|e| e.len() + 4).sum();
        8 + self.element_id.len() + entity + tags + 24
    }
}

/// Time range for queries (half-open interval: [start, end))
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: Timestamp,
    /// End timestamp (exclusive), in milliseconds
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a time range, rejecting empty or inverted intervals
    pub fn new(start: Timestamp, end: Timestamp) -> StorageResult<Self> {
        Self::try_new(start, end).ok_or(StorageError::InvalidTimeRange)
    }

    /// Create a time range, returning None if invalid
    pub fn try_new(start: Timestamp, end: Timestamp) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// The whole representable timeline
    pub fn all() -> Self {
        Self {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    /// Create a range for the last N hours from now
    pub fn last_hours(hours: i64) -> Self {
        let end = Utc::now().timestamp_millis();
        let start = end - (hours * 3600 * 1000);
        Self { start, end }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Get intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        Self::try_new(start, end)
    }
}
