//! Time bucketing for segments and blocks
//!
//! Segment windows are aligned to multiples of the segment interval since the
//! Unix epoch (UTC); block windows are aligned to multiples of the block
//! interval from their segment's start. Windows are start-inclusive and
//! end-exclusive, so a timestamp on a boundary belongs to the later window.
//!
//! Directory names are produced and parsed here as pure functions:
//!
//! | unit | segment name | block name |
//! |------|--------------|------------|
//! | segment ≤ 1 day | `seg-%Y%m%d` (day) / `seg-%Y%m%d%H` (hour) | `block-%H%M` |
//! | segment > 1 day | `seg-%Y%m%d` | `block-%Y%m%d%H%M` |

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{TimeRange, Timestamp};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const SEGMENT_PREFIX: &str = "seg-";
pub const BLOCK_PREFIX: &str = "block-";

const HOUR_MILLIS: i64 = 3_600_000;
const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Hour,
    Day,
}

/// A fixed interval: `num` hours or days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntervalRule {
    pub unit: IntervalUnit,
    pub num: u32,
}

impl IntervalRule {
    pub const fn hours(num: u32) -> Self {
        Self {
            unit: IntervalUnit::Hour,
            num,
        }
    }

    pub const fn days(num: u32) -> Self {
        Self {
            unit: IntervalUnit::Day,
            num,
        }
    }

    pub fn millis(&self) -> i64 {
        let unit = match self.unit {
            IntervalUnit::Hour => HOUR_MILLIS,
            IntervalUnit::Day => DAY_MILLIS,
        };
        unit * self.num as i64
    }
}

impl FromStr for IntervalRule {
    type Err = StorageError;

    /// Parse `"2h"`, `"1d"`, `"3 days"` and the like
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^\s*(\d+)\s*(h|hours?|d|days?)\s*$").expect("valid interval regex")
        });

        let caps = re
            .captures(s)
            .ok_or_else(|| StorageError::Config(format!("invalid interval: {:?}", s)))?;
        let num: u32 = caps[1]
            .parse()
            .map_err(|_| StorageError::Config(format!("interval out of range: {:?}", s)))?;
        let unit = if caps[2].starts_with('h') {
            IntervalUnit::Hour
        } else {
            IntervalUnit::Day
        };
        Ok(Self { unit, num })
    }
}

impl fmt::Display for IntervalRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            IntervalUnit::Hour => write!(f, "{}h", self.num),
            IntervalUnit::Day => write!(f, "{}d", self.num),
        }
    }
}

/// Validated segment/block interval pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBuckets {
    segment: IntervalRule,
    block: IntervalRule,
}

impl Default for TimeBuckets {
    fn default() -> Self {
        Self {
            segment: IntervalRule::days(1),
            block: IntervalRule::hours(2),
        }
    }
}

impl TimeBuckets {
    /// Check that the segment interval is whole hours dividing a day or whole
    /// days, and that the block interval divides it
    pub fn new(segment: IntervalRule, block: IntervalRule) -> StorageResult<Self> {
        if segment.num == 0 || block.num == 0 {
            return Err(StorageError::Config("interval must be non-zero".into()));
        }
        if segment.unit == IntervalUnit::Hour && 24 % segment.num != 0 {
            return Err(StorageError::Config(format!(
                "segment interval {} does not divide a day",
                segment
            )));
        }
        if segment.millis() % block.millis() != 0 {
            return Err(StorageError::Config(format!(
                "block interval {} does not divide segment interval {}",
                block, segment
            )));
        }
        Ok(Self { segment, block })
    }

    pub fn segment_interval(&self) -> IntervalRule {
        self.segment
    }

    pub fn block_interval(&self) -> IntervalRule {
        self.block
    }

    /// Start of the segment window containing `ts`.
    ///
    /// Fails with `InvalidTimeRange` when the aligned start does not fit an
    /// `i64`.
    pub fn segment_start(&self, ts: Timestamp) -> StorageResult<Timestamp> {
        let len = self.segment.millis();
        ts.div_euclid(len)
            .checked_mul(len)
            .ok_or(StorageError::InvalidTimeRange)
    }

    pub fn segment_window(&self, segment_start: Timestamp) -> TimeRange {
        TimeRange {
            start: segment_start,
            end: segment_start.saturating_add(self.segment.millis()),
        }
    }

    /// Start of the block window containing `ts` inside its segment
    pub fn block_start(&self, segment_start: Timestamp, ts: Timestamp) -> StorageResult<Timestamp> {
        let len = self.block.millis();
        ts.checked_sub(segment_start)
            .and_then(|offset| offset.div_euclid(len).checked_mul(len))
            .and_then(|offset| segment_start.checked_add(offset))
            .ok_or(StorageError::InvalidTimeRange)
    }

    pub fn block_window(&self, block_start: Timestamp) -> TimeRange {
        TimeRange {
            start: block_start,
            end: block_start.saturating_add(self.block.millis()),
        }
    }

    fn segment_format(&self) -> &'static str {
        match self.segment.unit {
            IntervalUnit::Day => "%Y%m%d",
            IntervalUnit::Hour => "%Y%m%d%H",
        }
    }

    fn block_format(&self) -> &'static str {
        if self.segment.millis() <= DAY_MILLIS {
            "%H%M"
        } else {
            "%Y%m%d%H%M"
        }
    }

    /// Directory name of the segment starting at `start`
    pub fn segment_name(&self, start: Timestamp) -> StorageResult<String> {
        let dt = to_datetime(start)?;
        Ok(format!("{}{}", SEGMENT_PREFIX, dt.format(self.segment_format())))
    }

    /// Directory name of the block starting at `start`
    pub fn block_name(&self, start: Timestamp) -> StorageResult<String> {
        let dt = to_datetime(start)?;
        Ok(format!("{}{}", BLOCK_PREFIX, dt.format(self.block_format())))
    }

    /// Segment start encoded in a directory name.
    ///
    /// Returns None for names this layout would never produce, including
    /// starts that are not aligned to the segment interval.
    pub fn parse_segment_name(&self, name: &str) -> Option<Timestamp> {
        let text = name.strip_prefix(SEGMENT_PREFIX)?;
        let start = match self.segment.unit {
            IntervalUnit::Day => NaiveDate::parse_from_str(text, "%Y%m%d")
                .ok()?
                .and_hms_opt(0, 0, 0)?,
            IntervalUnit::Hour => {
                if text.len() != 10 {
                    return None;
                }
                NaiveDateTime::parse_from_str(&format!("{}00", text), "%Y%m%d%H%M").ok()?
            }
        }
        .and_utc()
        .timestamp_millis();

        let canonical = self.segment_name(start).ok()?;
        (canonical == name && self.segment_start(start).ok() == Some(start)).then_some(start)
    }

    /// Block start encoded in a directory name under the given segment
    pub fn parse_block_name(&self, segment_start: Timestamp, name: &str) -> Option<Timestamp> {
        let text = name.strip_prefix(BLOCK_PREFIX)?;
        let start = if self.segment.millis() <= DAY_MILLIS {
            let time = NaiveTime::parse_from_str(text, "%H%M").ok()?;
            let day = to_datetime(segment_start).ok()?.date_naive();
            day.and_time(time).and_utc().timestamp_millis()
        } else {
            NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M")
                .ok()?
                .and_utc()
                .timestamp_millis()
        };

        let canonical = self.block_name(start).ok()?;
        let window = self.segment_window(segment_start);
        (canonical == name
            && window.contains(start)
            && self.block_start(segment_start, start).ok() == Some(start))
            .then_some(start)
    }
}

fn to_datetime(ts: Timestamp) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ts).ok_or(StorageError::InvalidTimeRange)
}
