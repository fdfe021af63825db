//! Entity location and shard routing
//!
//! An [`EntityLocator`] is built once per schema. It resolves the entity's
//! declared tag names to `(family, tag)` offsets, then for every write pulls
//! those values out of the payload, marshals each to its canonical index
//! bytes and hashes their concatenation to pick a shard.
//!
//! # Migration hazard
//!
//! Routing is `xxh64(concat(entity entries), seed 0) % shard_num`, with the
//! entries in schema-declared order. Changing the hash, the seed, the
//! marshaling or the order sends existing entities to different shards.

use crate::schema::{find_tag_by_name, EntityDecl, TagFamilySpec};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Entity, ShardId, TagFamilyForWrite, TagValue};
use xxhash_rust::xxh64::xxh64;

const SHARD_HASH_SEED: u64 = 0;

/// Position of one tag inside a write payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLocator {
    pub family_offset: usize,
    pub tag_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLocator {
    locators: Vec<TagLocator>,
}

impl EntityLocator {
    /// Resolve every entity tag; an unknown tag name is an `InvalidSchema`
    pub fn new(families: &[TagFamilySpec], entity: &EntityDecl) -> StorageResult<Self> {
        let locators = entity
            .tag_names
            .iter()
            .map(|name| {
                find_tag_by_name(families, name)
                    .map(|(fi, ti, _)| TagLocator {
                        family_offset: fi,
                        tag_offset: ti,
                    })
                    .ok_or_else(|| {
                        StorageError::InvalidSchema(format!(
                            "entity tag {:?} is not declared in any tag family",
                            name
                        ))
                    })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Self { locators })
    }

    /// Resolve entity tags, silently leaving out names that match nothing.
    ///
    /// Only for data already routed under this policy: dropping a tag
    /// changes the entity and therefore the shard.
    pub fn new_lenient(families: &[TagFamilySpec], entity: &EntityDecl) -> Self {
        let locators = entity
            .tag_names
            .iter()
            .filter_map(|name| find_tag_by_name(families, name))
            .map(|(fi, ti, _)| TagLocator {
                family_offset: fi,
                tag_offset: ti,
            })
            .collect();
        Self { locators }
    }

    pub fn from_locators(locators: Vec<TagLocator>) -> Self {
        Self { locators }
    }

    pub fn locators(&self) -> &[TagLocator] {
        &self.locators
    }

    /// Extract and marshal the entity values of a payload, in entity order
    pub fn find(&self, values: &[TagFamilyForWrite]) -> StorageResult<Entity> {
        self.locators
            .iter()
            .map(|loc| {
                let tag = tag_by_offset(values, loc.family_offset, loc.tag_offset)?;
                marshal_index_field_value(tag)
            })
            .collect::<StorageResult<Vec<_>>>()
            .map(Entity::new)
    }

    /// [`find`](Self::find), then route the entity to a shard
    pub fn locate(
        &self,
        values: &[TagFamilyForWrite],
        shard_num: u32,
    ) -> StorageResult<(Entity, ShardId)> {
        let entity = self.find(values)?;
        let shard = shard_id(&entity.marshal(), shard_num)?;
        Ok((entity, shard))
    }
}

/// The tag at `(family, tag)` of a payload
pub fn tag_by_offset(
    values: &[TagFamilyForWrite],
    family: usize,
    tag: usize,
) -> StorageResult<&TagValue> {
    let family_values = values.get(family).ok_or_else(|| {
        StorageError::MalformedElement(format!(
            "tag family offset {} is invalid for {} families",
            family,
            values.len()
        ))
    })?;
    family_values.tags.get(tag).ok_or_else(|| {
        StorageError::MalformedElement(format!(
            "tag offset {} is invalid for {} tags in family {}",
            tag,
            family_values.tags.len(),
            family
        ))
    })
}

/// Canonical index-field bytes of a tag value.
///
/// Strings are their UTF-8 bytes, binary data is passed through, and ints
/// are 8 bytes big-endian with the sign bit flipped so that byte order
/// matches numeric order. Null and array values cannot identify a series.
pub fn marshal_index_field_value(value: &TagValue) -> StorageResult<Vec<u8>> {
    match value {
        TagValue::Str(s) => Ok(s.as_bytes().to_vec()),
        TagValue::Int(i) => Ok(((*i as u64) ^ (1 << 63)).to_be_bytes().to_vec()),
        TagValue::BinaryData(b) => Ok(b.clone()),
        TagValue::Null => Err(StorageError::MalformedElement(
            "null value cannot be part of an entity".into(),
        )),
        TagValue::StrArray(_) | TagValue::IntArray(_) => Err(StorageError::MalformedElement(
            "array value cannot be part of an entity".into(),
        )),
    }
}

/// Shard owning a marshaled entity key
pub fn shard_id(key: &[u8], shard_num: u32) -> StorageResult<ShardId> {
    if shard_num == 0 {
        return Err(StorageError::ShardUnavailable {
            shard_id: 0,
            shard_num,
        });
    }
    Ok((xxh64(key, SHARD_HASH_SEED) % shard_num as u64) as ShardId)
}
