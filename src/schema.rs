//! Schema definitions supplied by the metadata registry
//!
//! The registry itself lives outside this crate. These are the read-only,
//! already-validated shapes the storage core consumes: tag families, the
//! entity declaration that fixes entity composition order, shard count and
//! index rules. They load from the registry's JSON documents.

use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Group-scoped name of a schema object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub group: String,
    pub name: String,
}

impl Metadata {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    String,
    Int,
    StringArray,
    IntArray,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
}

impl TagSpec {
    pub fn new(name: impl Into<String>, tag_type: TagType) -> Self {
        Self {
            name: name.into(),
            tag_type,
        }
    }
}

/// A named, ordered group of typed tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFamilySpec {
    pub name: String,
    pub tags: Vec<TagSpec>,
}

impl TagFamilySpec {
    pub fn new(name: impl Into<String>, tags: Vec<TagSpec>) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }
}

/// Entity composition: the tag names that identify a series, in order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDecl {
    pub tag_names: Vec<String>,
}

impl EntityDecl {
    pub fn new<S: Into<String>>(tag_names: impl IntoIterator<Item = S>) -> Self {
        Self {
            tag_names: tag_names.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOpts {
    pub shard_num: u32,
}

/// A stream definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSchema {
    pub metadata: Metadata,
    pub tag_families: Vec<TagFamilySpec>,
    pub entity: EntityDecl,
    pub opts: ResourceOpts,
}

impl StreamSchema {
    /// Load a stream definition from a JSON file
    pub fn load(path: &Path) -> StorageResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    Tree,
    Inverted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexLocation {
    Series,
    Global,
}

/// Secondary index configuration over one or more tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRule {
    pub metadata: Metadata,
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub index_type: IndexType,
    pub location: IndexLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub catalog: String,
    pub name: String,
}

/// Attaches index rules to a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRuleBinding {
    pub metadata: Metadata,
    pub rules: Vec<String>,
    pub subject: Subject,
}

impl IndexRuleBinding {
    /// The rules this binding names, in binding order; unknown names are skipped
    pub fn select(&self, rules: &[IndexRule]) -> Vec<IndexRule> {
        self.rules
            .iter()
            .filter_map(|name| {
                rules
                    .iter()
                    .find(|r| &r.metadata.name == name && r.metadata.group == self.metadata.group)
                    .cloned()
            })
            .collect()
    }
}

/// Locate a tag by name: (family index, tag index, spec), first match wins
pub fn find_tag_by_name<'a>(
    families: &'a [TagFamilySpec],
    name: &str,
) -> Option<(usize, usize, &'a TagSpec)> {
    families.iter().enumerate().find_map(|(fi, family)| {
        family
            .tags
            .iter()
            .position(|t| t.name == name)
            .map(|ti| (fi, ti, &family.tags[ti]))
    })
}

/// Load every index rule document (`*.json`) in a directory
pub fn load_index_rules(dir: &Path) -> StorageResult<Vec<IndexRule>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|p| {
            let content = std::fs::read_to_string(p)?;
            serde_json::from_str(&content).map_err(|e| {
                StorageError::Serialization(format!("index rule {}: {}", p.display(), e))
            })
        })
        .collect()
}
