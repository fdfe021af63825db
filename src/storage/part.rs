//! Sealed block part file format
//!
//! A part is the immutable on-disk unit of a block: the rows buffered while
//! the block was open, stored column by column and encoded with the
//! database's encoding method.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "CNPY"               │
//! │   version: u16                          │
//! │   encoding: u8                          │
//! │   reserved: u8                          │
//! │   row_count: u32                        │
//! │   min_timestamp: i64                    │
//! │   max_timestamp: i64                    │
//! │   column_count: u32                     │
//! │   reserved: [u8; 28]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ CHUNKS (variable)                       │
//! │   chunk_size: u32                       │
//! │   chunk_data: [u8; chunk_size]          │
//! │   chunk_checksum: u32                   │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   columns: bincode Vec<ColumnMeta>      │
//! │   footer_size: u32                      │
//! │   footer_checksum: u32                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Columns: `timestamp`, `element_id`, `entity`, `shape` (tag count per
//! family, per row) and one `f<family>.t<tag>` column per tag position seen
//! in the part. Rows that lack a position hold a null there; the shape column
//! restores the exact family lengths on read.

use crate::encoding::{decode_column, encode_column, Chunk, EncodingKind, EncodingMethod};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Entity, Row, TagFamilyForWrite, TagValue, TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const PART_MAGIC: [u8; 4] = *b"CNPY";
const PART_VERSION: u16 = 1;
const HEADER_SIZE: usize = 64;

const PART_PREFIX: &str = "part-";
const PART_SUFFIX: &str = ".dat";
const TMP_SUFFIX: &str = ".tmp";

const COL_TIMESTAMP: &str = "timestamp";
const COL_ELEMENT_ID: &str = "element_id";
const COL_ENTITY: &str = "entity";
const COL_SHAPE: &str = "shape";

pub fn part_file_name(seq: u32) -> String {
    format!("{}{:06}{}", PART_PREFIX, seq, PART_SUFFIX)
}

/// Sequence number of a part file name, None for anything else
pub fn parse_part_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(PART_PREFIX)?.strip_suffix(PART_SUFFIX)?;
    if digits.len() != 6 {
        return None;
    }
    digits.parse().ok()
}

pub fn is_temp_file(name: &str) -> bool {
    name.ends_with(TMP_SUFFIX)
}

fn tag_column_name(family: usize, tag: usize) -> String {
    format!("f{}.t{}", family, tag)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeader {
    pub version: u16,
    pub encoding: EncodingKind,
    pub row_count: u32,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub column_count: u32,
}

impl PartHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&PART_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.encoding as u8;
        buf[8..12].copy_from_slice(&self.row_count.to_le_bytes());
        buf[12..20].copy_from_slice(&self.min_timestamp.to_le_bytes());
        buf[20..28].copy_from_slice(&self.max_timestamp.to_le_bytes());
        buf[28..32].copy_from_slice(&self.column_count.to_le_bytes());

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    pub fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::CorruptData("part header truncated".into()));
        }

        let stored_checksum = u32::from_le_bytes([buf[60], buf[61], buf[62], buf[63]]);
        let computed_checksum = crc32fast::hash(&buf[0..60]);
        if stored_checksum != computed_checksum {
            return Err(StorageError::CorruptData(format!(
                "part header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        if buf[0..4] != PART_MAGIC {
            return Err(StorageError::CorruptData(format!(
                "invalid part magic: {:?}",
                &buf[0..4]
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > PART_VERSION {
            return Err(StorageError::CorruptData(format!(
                "unsupported part version: {}",
                version
            )));
        }

        Ok(Self {
            version,
            encoding: EncodingKind::try_from(buf[6])?,
            row_count: read_u32(&buf[8..12]),
            min_timestamp: read_i64(&buf[12..20]),
            max_timestamp: read_i64(&buf[20..28]),
            column_count: read_u32(&buf[28..32]),
        })
    }
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn read_i64(b: &[u8]) -> i64 {
    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Location of one encoded chunk inside the part file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub offset: u64,
    pub size: u32,
    pub value_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub chunks: Vec<ChunkMeta>,
}

/// A sealed part: header and column directory, data stays on disk
#[derive(Debug, Clone)]
pub struct Part {
    pub path: PathBuf,
    pub seq: u32,
    pub header: PartHeader,
    pub columns: Vec<ColumnMeta>,
    pub file_size: u64,
}

impl Part {
    /// Encode `rows` and write them as a new part file.
    ///
    /// The file is written under a temporary name, synced and renamed, so a
    /// crash never leaves a half-written part behind.
    pub fn write(dir: &Path, seq: u32, rows: &[Row], method: &EncodingMethod) -> StorageResult<Self> {
        if rows.is_empty() {
            return Err(StorageError::Serialization("cannot seal an empty part".into()));
        }

        let mut sorted: Vec<&Row> = rows.iter().collect();
        sorted.sort_by_key(|r| r.timestamp);

        let columns = build_columns(&sorted);
        let mut body = Vec::new();
        let mut metas = Vec::with_capacity(columns.len());

        for (name, values) in &columns {
            let mut chunk_metas = Vec::new();
            for chunk in encode_column(method.encoder_pool.as_ref(), values) {
                let offset = (HEADER_SIZE + body.len()) as u64;
                body.extend_from_slice(&(chunk.data.len() as u32).to_le_bytes());
                body.extend_from_slice(&chunk.data);
                body.extend_from_slice(&crc32fast::hash(&chunk.data).to_le_bytes());
                chunk_metas.push(ChunkMeta {
                    offset,
                    size: chunk.data.len() as u32,
                    value_count: chunk.value_count,
                });
            }
            metas.push(ColumnMeta {
                name: name.clone(),
                chunks: chunk_metas,
            });
        }

        let header = PartHeader {
            version: PART_VERSION,
            encoding: method.kind(),
            row_count: rows.len() as u32,
            min_timestamp: sorted[0].timestamp,
            max_timestamp: sorted[sorted.len() - 1].timestamp,
            column_count: metas.len() as u32,
        };

        let footer = bincode::serialize(&metas)?;
        let path = dir.join(part_file_name(seq));
        let tmp_path = dir.join(format!("{}{}", part_file_name(seq), TMP_SUFFIX));

        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&body)?;
            writer.write_all(&footer)?;
            writer.write_all(&(footer.len() as u32).to_le_bytes())?;
            writer.write_all(&crc32fast::hash(&footer).to_le_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        let file_size = (HEADER_SIZE + body.len() + footer.len() + 8) as u64;
        Ok(Self {
            path,
            seq,
            header,
            columns: metas,
            file_size,
        })
    }

    /// Read the header and column directory of an existing part
    pub fn open(path: &Path) -> StorageResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let seq = parse_part_file_name(name)
            .ok_or_else(|| StorageError::CorruptData(format!("not a part file: {}", name)))?;

        let data = std::fs::read(path)?;
        let header = PartHeader::from_bytes(&data)?;
        let columns = read_footer(&data)?;

        if columns.len() != header.column_count as usize {
            return Err(StorageError::CorruptData(format!(
                "part lists {} columns, header says {}",
                columns.len(),
                header.column_count
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            seq,
            header,
            columns,
            file_size: data.len() as u64,
        })
    }

    pub fn row_count(&self) -> usize {
        self.header.row_count as usize
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            start: self.header.min_timestamp,
            end: self.header.max_timestamp.saturating_add(1),
        }
    }

    /// Decode every row of the part, ordered by timestamp
    pub fn read_rows(&self, method: &EncodingMethod) -> StorageResult<Vec<Row>> {
        let mut data = Vec::with_capacity(self.file_size as usize);
        File::open(&self.path)?.read_to_end(&mut data)?;

        let decoder = method.decoder_for(self.header.encoding);
        let row_count = self.row_count();

        let mut decoded = std::collections::HashMap::with_capacity(self.columns.len());
        for column in &self.columns {
            let chunks = column
                .chunks
                .iter()
                .map(|meta| read_chunk(&data, meta))
                .collect::<StorageResult<Vec<_>>>()?;
            let values = decode_column(decoder.as_ref(), &chunks)?;
            if values.len() != row_count {
                return Err(StorageError::CorruptData(format!(
                    "column {} holds {} values, part has {} rows",
                    column.name,
                    values.len(),
                    row_count
                )));
            }
            decoded.insert(column.name.as_str(), values);
        }

        let column = |name: &str| {
            decoded
                .get(name)
                .ok_or_else(|| StorageError::CorruptData(format!("part missing column {}", name)))
        };
        let timestamps = column(COL_TIMESTAMP)?;
        let element_ids = column(COL_ELEMENT_ID)?;
        let entities = column(COL_ENTITY)?;
        let shapes = column(COL_SHAPE)?;

        let mut rows = Vec::with_capacity(row_count);
        for i in 0..row_count {
            let timestamp = match &timestamps[i] {
                TagValue::Int(ts) => *ts,
                other => return Err(unexpected(COL_TIMESTAMP, other)),
            };
            let element_id = match &element_ids[i] {
                TagValue::Str(id) => id.clone(),
                other => return Err(unexpected(COL_ELEMENT_ID, other)),
            };
            let entity = match &entities[i] {
                TagValue::BinaryData(bytes) => Entity::from_bytes(bytes)?,
                other => return Err(unexpected(COL_ENTITY, other)),
            };
            let shape = match &shapes[i] {
                TagValue::IntArray(shape) => shape,
                other => return Err(unexpected(COL_SHAPE, other)),
            };

            let mut tag_families = Vec::with_capacity(shape.len());
            for (fi, &count) in shape.iter().enumerate() {
                let mut tags = Vec::with_capacity(count.max(0) as usize);
                for ti in 0..count.max(0) as usize {
                    tags.push(column(&tag_column_name(fi, ti))?[i].clone());
                }
                tag_families.push(TagFamilyForWrite::new(tags));
            }

            rows.push(Row {
                timestamp,
                element_id,
                entity,
                tag_families,
            });
        }

        Ok(rows)
    }
}

fn unexpected(column: &str, value: &TagValue) -> StorageError {
    StorageError::CorruptData(format!("unexpected value in {} column: {:?}", column, value))
}

fn build_columns(rows: &[&Row]) -> Vec<(String, Vec<TagValue>)> {
    let mut columns = vec![
        (
            COL_TIMESTAMP.to_string(),
            rows.iter().map(|r| TagValue::Int(r.timestamp)).collect(),
        ),
        (
            COL_ELEMENT_ID.to_string(),
            rows.iter().map(|r| TagValue::Str(r.element_id.clone())).collect(),
        ),
        (
            COL_ENTITY.to_string(),
            rows.iter()
                .map(|r| TagValue::BinaryData(r.entity.to_bytes()))
                .collect(),
        ),
        (
            COL_SHAPE.to_string(),
            rows.iter()
                .map(|r| {
                    TagValue::IntArray(r.tag_families.iter().map(|f| f.tags.len() as i64).collect())
                })
                .collect(),
        ),
    ];

    // Widest tag count per family position across the part
    let mut widths: Vec<usize> = Vec::new();
    for row in rows {
        for (fi, family) in row.tag_families.iter().enumerate() {
            if widths.len() <= fi {
                widths.resize(fi + 1, 0);
            }
            widths[fi] = widths[fi].max(family.tags.len());
        }
    }

    for (fi, &width) in widths.iter().enumerate() {
        for ti in 0..width {
            let values = rows
                .iter()
                .map(|r| {
                    r.tag_families
                        .get(fi)
                        .and_then(|f| f.tags.get(ti))
                        .cloned()
                        .unwrap_or(TagValue::Null)
                })
                .collect();
            columns.push((tag_column_name(fi, ti), values));
        }
    }

    columns
}

fn read_footer(data: &[u8]) -> StorageResult<Vec<ColumnMeta>> {
    if data.len() < HEADER_SIZE + 8 {
        return Err(StorageError::CorruptData("part footer truncated".into()));
    }

    let tail = data.len() - 8;
    let footer_size = read_u32(&data[tail..tail + 4]) as usize;
    let stored_checksum = read_u32(&data[tail + 4..]);

    let footer_start = tail
        .checked_sub(footer_size)
        .filter(|start| *start >= HEADER_SIZE)
        .ok_or_else(|| StorageError::CorruptData(format!("bad footer size {}", footer_size)))?;
    let footer = &data[footer_start..tail];

    if crc32fast::hash(footer) != stored_checksum {
        return Err(StorageError::CorruptData("part footer checksum mismatch".into()));
    }

    Ok(bincode::deserialize(footer)?)
}

fn read_chunk(data: &[u8], meta: &ChunkMeta) -> StorageResult<Chunk> {
    let start = meta.offset as usize;
    let size = meta.size as usize;
    let end = start
        .checked_add(size + 8)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            StorageError::CorruptData(format!("chunk at {} runs past end of part", meta.offset))
        })?;

    let stored_size = read_u32(&data[start..start + 4]) as usize;
    if stored_size != size {
        return Err(StorageError::CorruptData(format!(
            "chunk at {} has size {}, directory says {}",
            meta.offset, stored_size, size
        )));
    }

    let payload = &data[start + 4..start + 4 + size];
    let stored_checksum = read_u32(&data[end - 4..end]);
    if crc32fast::hash(payload) != stored_checksum {
        return Err(StorageError::CorruptData(format!(
            "chunk checksum mismatch at offset {}",
            meta.offset
        )));
    }

    Ok(Chunk {
        value_count: meta.value_count,
        data: payload.to_vec(),
    })
}
