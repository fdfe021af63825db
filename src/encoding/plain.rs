//! Plain (passthrough) column codec
//!
//! Chunk layout:
//! ```text
//! ┌──────────────────────────────────────┐
//! │ value_count: u32                     │
//! │ values: for each value               │
//! │   type: u8                           │
//! │   payload (type dependent)           │
//! │ crc: u32 (CRC32 of everything above) │
//! └──────────────────────────────────────┘
//! ```
//!
//! Payloads: `Null` has none, `Int` is an i64, `Str`/`BinaryData` are a u32
//! length plus bytes, arrays are a u32 length plus their elements. All
//! integers are little-endian.

use crate::encoding::{
    ColumnDecoder, ColumnEncoder, DecoderPool, EncoderPool, EncodingError, EncodingKind,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::TagValue;

const TYPE_NULL: u8 = 0;
const TYPE_STR: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_STR_ARRAY: u8 = 3;
const TYPE_INT_ARRAY: u8 = 4;
const TYPE_BINARY: u8 = 5;

/// Count header plus CRC trailer
const FRAME_OVERHEAD: usize = 8;

#[derive(Debug, Clone)]
pub struct PlainEncoderPool {
    chunk_size: usize,
}

impl PlainEncoderPool {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

impl EncoderPool for PlainEncoderPool {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Plain
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn get(&self) -> Box<dyn ColumnEncoder> {
        Box::new(PlainEncoder {
            values: ValueBuffer::new(self.chunk_size),
        })
    }
}

/// Decoders are stateless, so the pool carries no settings
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainDecoderPool;

impl DecoderPool for PlainDecoderPool {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Plain
    }

    fn get(&self) -> Box<dyn ColumnDecoder> {
        Box::new(PlainDecoder)
    }
}

struct PlainEncoder {
    values: ValueBuffer,
}

impl ColumnEncoder for PlainEncoder {
    fn append(&mut self, value: &TagValue) -> Result<(), EncodingError> {
        self.values.append(value)
    }

    fn value_count(&self) -> usize {
        self.values.count()
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut chunk = self.values.take_body();
        let crc = crc32fast::hash(&chunk);
        chunk.extend_from_slice(&crc.to_le_bytes());
        chunk
    }
}

struct PlainDecoder;

impl ColumnDecoder for PlainDecoder {
    fn decode(&self, data: &[u8]) -> StorageResult<Vec<TagValue>> {
        let body = verify_crc(data)?;
        parse_body(body)
    }
}

/// Accumulates encoded values for one chunk, enforcing the size bound
pub(crate) struct ValueBuffer {
    chunk_size: usize,
    count: usize,
    buf: Vec<u8>,
    scratch: Vec<u8>,
}

impl ValueBuffer {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            count: 0,
            buf: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn append(&mut self, value: &TagValue) -> Result<(), EncodingError> {
        self.scratch.clear();
        write_value(&mut self.scratch, value);

        let current = FRAME_OVERHEAD + self.buf.len();
        if self.chunk_size > 0 && self.count > 0 && current + self.scratch.len() > self.chunk_size {
            return Err(EncodingError::ChunkFull {
                chunk_size: self.chunk_size,
                current,
                needed: self.scratch.len(),
            });
        }

        self.buf.extend_from_slice(&self.scratch);
        self.count += 1;
        Ok(())
    }

    /// Count header followed by the values; resets the buffer
    pub(crate) fn take_body(&mut self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.buf.len() + 4);
        body.extend_from_slice(&(self.count as u32).to_le_bytes());
        body.extend_from_slice(&self.buf);
        self.buf.clear();
        self.count = 0;
        body
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn write_value(buf: &mut Vec<u8>, value: &TagValue) {
    match value {
        TagValue::Null => buf.push(TYPE_NULL),
        TagValue::Str(s) => {
            buf.push(TYPE_STR);
            write_len(buf, s.len());
            buf.extend_from_slice(s.as_bytes());
        }
        TagValue::Int(v) => {
            buf.push(TYPE_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        TagValue::StrArray(items) => {
            buf.push(TYPE_STR_ARRAY);
            write_len(buf, items.len());
            for s in items {
                write_len(buf, s.len());
                buf.extend_from_slice(s.as_bytes());
            }
        }
        TagValue::IntArray(items) => {
            buf.push(TYPE_INT_ARRAY);
            write_len(buf, items.len());
            for v in items {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        TagValue::BinaryData(bytes) => {
            buf.push(TYPE_BINARY);
            write_len(buf, bytes.len());
            buf.extend_from_slice(bytes);
        }
    }
}

/// Split off and check the CRC32 trailer, returning the protected bytes
pub(crate) fn verify_crc(data: &[u8]) -> StorageResult<&[u8]> {
    if data.len() < 4 {
        return Err(StorageError::CorruptData(format!(
            "chunk too short: {} bytes",
            data.len()
        )));
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(StorageError::CorruptData(format!(
            "chunk checksum mismatch: stored={}, computed={}",
            stored, computed
        )));
    }
    Ok(body)
}

/// Parse a count-prefixed value body
pub(crate) fn parse_body(body: &[u8]) -> StorageResult<Vec<TagValue>> {
    let mut reader = Reader { data: body, pos: 0 };
    let count = reader.u32()? as usize;
    // Each value takes at least one byte
    if count > reader.remaining() {
        return Err(StorageError::CorruptData(format!(
            "chunk claims {} values in {} bytes",
            count,
            reader.remaining()
        )));
    }

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(reader.value()?);
    }
    if reader.remaining() != 0 {
        return Err(StorageError::CorruptData(format!(
            "{} trailing bytes after {} values",
            reader.remaining(),
            count
        )));
    }
    Ok(values)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> StorageResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(StorageError::CorruptData(format!(
                "truncated chunk: need {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> StorageResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> StorageResult<i64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_le_bytes(buf))
    }

    fn bytes(&mut self) -> StorageResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> StorageResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StorageError::CorruptData(format!("invalid utf-8 in string value: {}", e)))
    }

    fn array_len(&mut self, min_item_size: usize) -> StorageResult<usize> {
        let len = self.u32()? as usize;
        if len.saturating_mul(min_item_size) > self.remaining() {
            return Err(StorageError::CorruptData(format!(
                "array of {} items exceeds remaining {} bytes",
                len,
                self.remaining()
            )));
        }
        Ok(len)
    }

    fn value(&mut self) -> StorageResult<TagValue> {
        match self.u8()? {
            TYPE_NULL => Ok(TagValue::Null),
            TYPE_STR => Ok(TagValue::Str(self.string()?)),
            TYPE_INT => Ok(TagValue::Int(self.i64()?)),
            TYPE_STR_ARRAY => {
                let len = self.array_len(4)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.string()?);
                }
                Ok(TagValue::StrArray(items))
            }
            TYPE_INT_ARRAY => {
                let len = self.array_len(8)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.i64()?);
                }
                Ok(TagValue::IntArray(items))
            }
            TYPE_BINARY => Ok(TagValue::BinaryData(self.bytes()?.to_vec())),
            other => Err(StorageError::CorruptData(format!(
                "unknown value type {} at offset {}",
                other,
                self.pos - 1
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: &[TagValue]) -> Vec<u8> {
        let mut encoder = PlainEncoderPool::new(0).get();
        for v in values {
            encoder.append(v).unwrap();
        }
        encoder.finish()
    }

    #[test]
    fn test_plain_empty_chunk() {
        let chunk = encode(&[]);
        assert_eq!(chunk.len(), FRAME_OVERHEAD);
        let decoded = PlainDecoder.decode(&chunk).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_plain_preserves_order() {
        let values: Vec<TagValue> = (0..50)
            .map(|i| {
                if i % 2 == 0 {
                    TagValue::Int(i)
                } else {
                    TagValue::Str(format!("v{}", i))
                }
            })
            .collect();
        let decoded = PlainDecoder.decode(&encode(&values)).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_plain_encoder_resets_after_finish() {
        let mut encoder = PlainEncoderPool::new(0).get();
        encoder.append(&TagValue::Int(1)).unwrap();
        let first = encoder.finish();
        assert!(encoder.is_empty());

        encoder.append(&TagValue::Int(2)).unwrap();
        let second = encoder.finish();

        assert_eq!(PlainDecoder.decode(&first).unwrap(), vec![TagValue::Int(1)]);
        assert_eq!(PlainDecoder.decode(&second).unwrap(), vec![TagValue::Int(2)]);
    }

    #[test]
    fn test_plain_chunk_full() {
        let mut encoder = PlainEncoderPool::new(FRAME_OVERHEAD + 9).get();
        encoder.append(&TagValue::Int(1)).unwrap();
        let err = encoder.append(&TagValue::Int(2)).unwrap_err();
        assert!(matches!(err, EncodingError::ChunkFull { .. }));
        assert_eq!(encoder.value_count(), 1);
    }

    #[test]
    fn test_plain_truncated_input() {
        let chunk = encode(&[TagValue::Str("hello".into()), TagValue::Int(7)]);
        for cut in [0, 3, chunk.len() / 2, chunk.len() - 1] {
            let err = PlainDecoder.decode(&chunk[..cut]).unwrap_err();
            assert!(matches!(err, StorageError::CorruptData(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_plain_flipped_bit() {
        let mut chunk = encode(&[TagValue::Str("hello".into())]);
        chunk[6] ^= 0x01;
        let err = PlainDecoder.decode(&chunk).unwrap_err();
        assert!(matches!(err, StorageError::CorruptData(_)));
    }

    #[test]
    fn test_plain_body_with_valid_crc_but_bad_type() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.push(99);
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let err = PlainDecoder.decode(&body).unwrap_err();
        assert!(matches!(err, StorageError::CorruptData(_)));
    }

    #[test]
    fn test_plain_huge_count_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&u32::MAX.to_le_bytes());
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let err = PlainDecoder.decode(&body).unwrap_err();
        assert!(matches!(err, StorageError::CorruptData(_)));
    }
}
