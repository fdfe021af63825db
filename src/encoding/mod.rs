//! Column encodings
//!
//! An encoding method is a pair of pools: the encoder pool hands out
//! [`ColumnEncoder`]s that pack typed tag values into byte chunks bounded by
//! a chunk size, the decoder pool hands out [`ColumnDecoder`]s that turn a
//! chunk back into the original values.
//!
//! Codecs are stateless between chunks and every `get()` returns a fresh
//! instance, so blocks sealed concurrently by different shards never share
//! mutable state.
//!
//! - **plain**: length-delimited values plus a CRC32 trailer (reference codec)
//! - **lz4**: the plain body compressed with LZ4

mod lz4;
mod plain;

pub use lz4::{Lz4DecoderPool, Lz4EncoderPool};
pub use plain::{PlainDecoderPool, PlainEncoderPool};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::TagValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Default chunk bound used by streams: 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Codec identity, recorded in every part header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EncodingKind {
    Plain = 0,
    Lz4 = 1,
}

impl TryFrom<u8> for EncodingKind {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EncodingKind::Plain),
            1 => Ok(EncodingKind::Lz4),
            _ => Err(StorageError::CorruptData(format!(
                "Unknown encoding kind: {}",
                value
            ))),
        }
    }
}

impl FromStr for EncodingKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(EncodingKind::Plain),
            "lz4" => Ok(EncodingKind::Lz4),
            other => Err(StorageError::Config(format!("unknown encoding: {}", other))),
        }
    }
}

impl fmt::Display for EncodingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingKind::Plain => write!(f, "plain"),
            EncodingKind::Lz4 => write!(f, "lz4"),
        }
    }
}

/// Raised by an encoder when a value does not fit in the current chunk
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("chunk full: {current} bytes used, value needs {needed}, bound is {chunk_size}")]
    ChunkFull {
        chunk_size: usize,
        current: usize,
        needed: usize,
    },
}

/// Packs values into one chunk at a time
pub trait ColumnEncoder: Send {
    /// Append one value to the current chunk.
    ///
    /// Returns [`EncodingError::ChunkFull`] when the value would push the
    /// chunk past the bound; the caller must `finish()` and retry. A value
    /// that alone exceeds the bound is accepted into an empty chunk.
    fn append(&mut self, value: &TagValue) -> Result<(), EncodingError>;

    /// Number of values in the current chunk
    fn value_count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.value_count() == 0
    }

    /// Emit the current chunk and reset
    fn finish(&mut self) -> Vec<u8>;
}

/// Reconstructs the values of one chunk, in order
pub trait ColumnDecoder: Send {
    fn decode(&self, data: &[u8]) -> StorageResult<Vec<TagValue>>;
}

pub trait EncoderPool: Send + Sync + fmt::Debug {
    fn kind(&self) -> EncodingKind;

    /// Chunk bound in bytes; 0 means unbounded
    fn chunk_size(&self) -> usize;

    fn get(&self) -> Box<dyn ColumnEncoder>;
}

pub trait DecoderPool: Send + Sync + fmt::Debug {
    fn kind(&self) -> EncodingKind;

    fn get(&self) -> Box<dyn ColumnDecoder>;
}

/// The encoder/decoder pair a database writes and reads blocks with
#[derive(Debug, Clone)]
pub struct EncodingMethod {
    pub encoder_pool: Arc<dyn EncoderPool>,
    pub decoder_pool: Arc<dyn DecoderPool>,
}

impl EncodingMethod {
    pub fn plain(chunk_size: usize) -> Self {
        Self::for_kind(EncodingKind::Plain, chunk_size)
    }

    pub fn lz4(chunk_size: usize) -> Self {
        Self::for_kind(EncodingKind::Lz4, chunk_size)
    }

    /// Built-in pools for a codec identity
    pub fn for_kind(kind: EncodingKind, chunk_size: usize) -> Self {
        match kind {
            EncodingKind::Plain => Self {
                encoder_pool: Arc::new(PlainEncoderPool::new(chunk_size)),
                decoder_pool: Arc::new(PlainDecoderPool),
            },
            EncodingKind::Lz4 => Self {
                encoder_pool: Arc::new(Lz4EncoderPool::new(chunk_size)),
                decoder_pool: Arc::new(Lz4DecoderPool),
            },
        }
    }

    pub fn kind(&self) -> EncodingKind {
        self.encoder_pool.kind()
    }

    /// Decoder for data recorded with `kind`.
    ///
    /// Parts written under a different method than the configured one are
    /// read with the built-in decoder for their recorded kind.
    pub fn decoder_for(&self, kind: EncodingKind) -> Box<dyn ColumnDecoder> {
        if self.decoder_pool.kind() == kind {
            self.decoder_pool.get()
        } else {
            Self::for_kind(kind, 0).decoder_pool.get()
        }
    }
}

impl Default for EncodingMethod {
    fn default() -> Self {
        Self::plain(DEFAULT_CHUNK_SIZE)
    }
}

/// One encoded run of a column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub value_count: u32,
    pub data: Vec<u8>,
}

/// Encode a whole column, starting a new chunk whenever the encoder is full
pub fn encode_column(pool: &dyn EncoderPool, values: &[TagValue]) -> Vec<Chunk> {
    let mut encoder = pool.get();
    let mut chunks = Vec::new();

    for value in values {
        if encoder.append(value).is_err() {
            chunks.push(finish_chunk(encoder.as_mut()));
            // An empty encoder always accepts
            let _ = encoder.append(value);
        }
    }
    if !encoder.is_empty() {
        chunks.push(finish_chunk(encoder.as_mut()));
    }

    chunks
}

fn finish_chunk(encoder: &mut dyn ColumnEncoder) -> Chunk {
    let value_count = encoder.value_count() as u32;
    Chunk {
        value_count,
        data: encoder.finish(),
    }
}

/// Decode a column's chunks back into one value list
pub fn decode_column(decoder: &dyn ColumnDecoder, chunks: &[Chunk]) -> StorageResult<Vec<TagValue>> {
    let mut values = Vec::new();
    for (idx, chunk) in chunks.iter().enumerate() {
        let decoded = decoder.decode(&chunk.data)?;
        if decoded.len() != chunk.value_count as usize {
            return Err(StorageError::CorruptData(format!(
                "chunk {} holds {} values, expected {}",
                idx,
                decoded.len(),
                chunk.value_count
            )));
        }
        values.extend(decoded);
    }
    Ok(values)
}
