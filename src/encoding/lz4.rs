//! LZ4 column codec
//!
//! Same value body as the plain codec, LZ4-compressed with the uncompressed
//! size prepended, followed by a CRC32 of the compressed bytes. The chunk
//! bound applies to the uncompressed body, so a chunk never expands past it
//! when decoded.

use crate::encoding::plain::{parse_body, verify_crc, ValueBuffer};
use crate::encoding::{
    ColumnDecoder, ColumnEncoder, DecoderPool, EncoderPool, EncodingError, EncodingKind,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::TagValue;

/// LZ4 cannot expand input by more than this factor
const MAX_RATIO: usize = 255;

#[derive(Debug, Clone)]
pub struct Lz4EncoderPool {
    chunk_size: usize,
}

impl Lz4EncoderPool {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

impl EncoderPool for Lz4EncoderPool {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Lz4
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn get(&self) -> Box<dyn ColumnEncoder> {
        Box::new(Lz4Encoder {
            values: ValueBuffer::new(self.chunk_size),
        })
    }
}

/// Decoders are stateless, so the pool carries no settings
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4DecoderPool;

impl DecoderPool for Lz4DecoderPool {
    fn kind(&self) -> EncodingKind {
        EncodingKind::Lz4
    }

    fn get(&self) -> Box<dyn ColumnDecoder> {
        Box::new(Lz4Decoder)
    }
}

struct Lz4Encoder {
    values: ValueBuffer,
}

impl ColumnEncoder for Lz4Encoder {
    fn append(&mut self, value: &TagValue) -> Result<(), EncodingError> {
        self.values.append(value)
    }

    fn value_count(&self) -> usize {
        self.values.count()
    }

    fn finish(&mut self) -> Vec<u8> {
        let body = self.values.take_body();
        let mut chunk = lz4_flex::compress_prepend_size(&body);
        let crc = crc32fast::hash(&chunk);
        chunk.extend_from_slice(&crc.to_le_bytes());
        chunk
    }
}

struct Lz4Decoder;

impl ColumnDecoder for Lz4Decoder {
    fn decode(&self, data: &[u8]) -> StorageResult<Vec<TagValue>> {
        let compressed = verify_crc(data)?;
        if compressed.len() < 4 {
            return Err(StorageError::CorruptData("lz4 chunk missing size header".into()));
        }

        let declared = u32::from_le_bytes([compressed[0], compressed[1], compressed[2], compressed[3]])
            as usize;
        if declared > compressed.len().saturating_mul(MAX_RATIO) + 16 {
            return Err(StorageError::CorruptData(format!(
                "lz4 chunk declares {} bytes from {} compressed",
                declared,
                compressed.len()
            )));
        }

        let body = lz4_flex::decompress_size_prepended(compressed)
            .map_err(|e| StorageError::CorruptData(format!("LZ4 decompression failed: {}", e)))?;
        parse_body(&body)
    }
}
