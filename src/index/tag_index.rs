//! Tag Index - inverted index from tag values to postings
//!
//! Maps tag name → value → set of postings (entity, element id, timestamp).
//!
//! # Example
//! ```ignore
//! // Which elements of svcA hit /api/users?
//! let postings = index.find_all(&[("service", "svcA"), ("endpoint", "/api/users")]);
//! ```
//!
//! In-memory with JSON persistence; postings are deduplicated.

use crate::index::{IndexRequest, IndexWriter, IndexWriterFactory, IndexWriterOptions};
use crate::schema::find_tag_by_name;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Entity, TagValue, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

pub const TAG_INDEX_FILE: &str = "tag_index.json";

/// One indexed record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Posting {
    pub entity: Entity,
    pub element_id: String,
    pub timestamp: Timestamp,
}

#[derive(Debug)]
pub struct TagIndex {
    /// tag name → value → postings
    terms: HashMap<String, HashMap<String, HashSet<Posting>>>,
    file: PathBuf,
    unsaved: bool,
}

/// On-disk form of a [`TagIndex`]
#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    terms: BTreeMap<String, BTreeMap<String, Vec<Posting>>>,
}

const SNAPSHOT_VERSION: u32 = 2;

fn ordered(postings: impl IntoIterator<Item = Posting>) -> Vec<Posting> {
    let mut out: Vec<Posting> = postings.into_iter().collect();
    out.sort_by(|a, b| (a.timestamp, &a.element_id).cmp(&(b.timestamp, &b.element_id)));
    out
}

impl TagIndex {
    /// Open the index persisted in `dir`, or start an empty one
    pub fn new(dir: &Path) -> StorageResult<Self> {
        let mut index = Self {
            terms: HashMap::new(),
            file: dir.join(TAG_INDEX_FILE),
            unsaved: false,
        };

        let bytes = match std::fs::read(&index.file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::Serialization(format!(
                "tag index {} is unreadable: {}",
                index.file.display(),
                e
            ))
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StorageError::Serialization(format!(
                "tag index version {} is not supported",
                snapshot.version
            )));
        }

        index.terms = snapshot
            .terms
            .into_iter()
            .map(|(tag, values)| {
                let values = values
                    .into_iter()
                    .map(|(value, postings)| (value, postings.into_iter().collect()))
                    .collect();
                (tag, values)
            })
            .collect();
        Ok(index)
    }

    pub fn add(&mut self, tag: &str, value: &str, posting: Posting) {
        let postings = self
            .terms
            .entry(tag.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default();
        self.unsaved |= postings.insert(posting);
    }

    fn postings(&self, tag: &str, value: &str) -> Option<&HashSet<Posting>> {
        self.terms.get(tag)?.get(value)
    }

    pub fn find(&self, tag: &str, value: &str) -> Vec<Posting> {
        self.postings(tag, value)
            .map(|set| ordered(set.iter().cloned()))
            .unwrap_or_default()
    }

    /// Postings matching every given tag value (intersection)
    pub fn find_all(&self, tags: &[(&str, &str)]) -> Vec<Posting> {
        let empty = HashSet::new();
        let mut sets = tags
            .iter()
            .map(|(tag, value)| self.postings(tag, value).unwrap_or(&empty));

        let Some(first) = sets.next() else {
            return Vec::new();
        };
        let mut matched: HashSet<&Posting> = first.iter().collect();
        for set in sets {
            matched.retain(|p| set.contains(*p));
        }
        ordered(matched.into_iter().cloned())
    }

    /// All distinct values indexed for a tag
    pub fn get_values(&self, tag: &str) -> Vec<String> {
        let mut values: Vec<String> = self
            .terms
            .get(tag)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default();
        values.sort();
        values
    }

    pub fn has_key(&self, tag: &str) -> bool {
        self.terms.contains_key(tag)
    }

    /// Distinct (tag, value) terms
    pub fn tag_count(&self) -> usize {
        self.terms.values().map(HashMap::len).sum()
    }

    pub fn posting_count(&self) -> usize {
        self.terms
            .values()
            .flat_map(HashMap::values)
            .map(HashSet::len)
            .sum()
    }

    pub fn is_dirty(&self) -> bool {
        self.unsaved
    }

    /// Write the index next to a temp file and swap it in
    pub fn persist(&mut self) -> StorageResult<()> {
        if !self.unsaved {
            return Ok(());
        }
        if let Some(dir) = self.file.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            terms: self
                .terms
                .iter()
                .map(|(tag, values)| {
                    let values = values
                        .iter()
                        .map(|(value, set)| (value.clone(), ordered(set.iter().cloned())))
                        .collect();
                    (tag.clone(), values)
                })
                .collect(),
        };
        let encoded = serde_json::to_vec(&snapshot)?;

        let staging = self.file.with_extension("json.tmp");
        std::fs::write(&staging, encoded)?;
        std::fs::rename(&staging, &self.file)?;

        self.unsaved = false;
        Ok(())
    }
}

impl Drop for TagIndex {
    fn drop(&mut self) {
        if let Err(e) = self.persist() {
            warn!(path = %self.file.display(), "Dropping unsaved tag index: {}", e);
        }
    }
}

/// Canonical index terms of a tag value; arrays index every member
fn index_terms(value: &TagValue) -> Vec<String> {
    match value {
        TagValue::Str(s) => vec![s.clone()],
        TagValue::Int(i) => vec![i.to_string()],
        TagValue::StrArray(v) => v.clone(),
        TagValue::IntArray(v) => v.iter().map(|i| i.to_string()).collect(),
        TagValue::Null | TagValue::BinaryData(_) => Vec::new(),
    }
}

#[derive(Debug, Clone)]
struct IndexedTag {
    name: String,
    family: usize,
    tag: usize,
}

/// [`IndexWriter`] that feeds the tags named by index rules into a
/// [`TagIndex`]
#[derive(Debug)]
pub struct TagIndexWriter {
    tags: Vec<IndexedTag>,
    index: Mutex<TagIndex>,
    closed: AtomicBool,
}

impl TagIndexWriter {
    pub fn new(opts: &IndexWriterOptions) -> StorageResult<Self> {
        let mut tags: Vec<IndexedTag> = Vec::new();
        for rule in &opts.index_rules {
            for name in &rule.tags {
                if tags.iter().any(|t| &t.name == name) {
                    continue;
                }
                match find_tag_by_name(&opts.families, name) {
                    Some((family, tag, _)) => tags.push(IndexedTag {
                        name: name.clone(),
                        family,
                        tag,
                    }),
                    None => warn!(
                        rule = %rule.metadata.name,
                        tag = %name,
                        "Index rule names an unknown tag"
                    ),
                }
            }
        }

        debug!(shard_id = opts.shard_id, tags = tags.len(), "Built tag index writer");
        Ok(Self {
            tags,
            index: Mutex::new(TagIndex::new(&opts.shard_path)?),
            closed: AtomicBool::new(false),
        })
    }

    pub fn find(&self, tag: &str, value: &str) -> StorageResult<Vec<Posting>> {
        Ok(self.index.lock()?.find(tag, value))
    }

    pub fn find_all(&self, tags: &[(&str, &str)]) -> StorageResult<Vec<Posting>> {
        Ok(self.index.lock()?.find_all(tags))
    }
}

#[async_trait]
impl IndexWriter for TagIndexWriter {
    async fn write(&self, request: IndexRequest) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }

        let mut index = self.index.lock()?;
        for tag in &self.tags {
            let Some(value) = request
                .tag_families
                .get(tag.family)
                .and_then(|f| f.tags.get(tag.tag))
            else {
                continue;
            };

            for term in index_terms(value) {
                index.add(
                    &tag.name,
                    &term,
                    Posting {
                        entity: request.entity.clone(),
                        element_id: request.element_id.clone(),
                        timestamp: request.timestamp,
                    },
                );
            }
        }
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.index.lock()?.persist()
    }
}

/// Builds a [`TagIndexWriter`] per shard
#[derive(Debug, Default, Clone, Copy)]
pub struct TagIndexWriterFactory;

impl IndexWriterFactory for TagIndexWriterFactory {
    fn build(&self, opts: IndexWriterOptions) -> StorageResult<Box<dyn IndexWriter>> {
        Ok(Box::new(TagIndexWriter::new(&opts)?))
    }
}
