use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cairn_types::checksum::Checksum;
use cairn_types::snapshot_id::SnapshotId;

use crate::error::{CairnError, Result};
use crate::vfs::Summary;

/// Who produced the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub identifier: Uuid,
    pub public_key: Option<Vec<u8>>,
}

/// Where the snapshot's data came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Importer {
    pub kind: String,
    pub origin: String,
    pub directory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// The snapshot header: metadata record binding the root, index, metadata,
/// statistics and errors sections to one snapshot identity. A zero section
/// checksum means "absent". Headers compare equal iff their snapshot_id
/// bytes compare equal; re-serialization never changes the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub snapshot_id: SnapshotId,
    pub version: u32,
    pub creation_time: DateTime<Utc>,
    pub creation_duration: Duration,

    pub identity: Identity,

    pub category: String,
    pub tags: Vec<String>,

    /// Insertion-order significant; keys are not unique.
    pub context: Vec<KeyValue>,

    pub importer: Importer,

    pub root: Checksum,
    pub index: Checksum,
    pub metadata: Checksum,
    pub statistics: Checksum,
    pub errors: Checksum,

    pub summary: Summary,
}

impl Header {
    pub fn new(snapshot_id: SnapshotId, version: u32) -> Self {
        Header {
            snapshot_id,
            version,
            creation_time: Utc::now(),
            creation_duration: Duration::ZERO,
            identity: Identity::default(),
            category: "default".to_string(),
            tags: Vec::new(),
            context: Vec::new(),
            importer: Importer::default(),
            root: Checksum::zero(),
            index: Checksum::zero(),
            metadata: Checksum::zero(),
            statistics: Checksum::zero(),
            errors: Checksum::zero(),
            summary: Summary::default(),
        }
    }

    /// Append a context pair. Existing keys are not deduplicated.
    pub fn set_context(&mut self, key: &str, value: &str) {
        self.context.push(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    /// Value of the first matching key, or empty string.
    pub fn get_context(&self, key: &str) -> String {
        self.context
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.clone())
            .unwrap_or_default()
    }

    /// Section checksums in a fixed order, for reference walking.
    pub fn sections(&self) -> [(&'static str, Checksum); 5] {
        [
            ("root", self.root),
            ("index", self.index),
            ("metadata", self.metadata),
            ("statistics", self.statistics),
            ("errors", self.errors),
        ]
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot_id == other.snapshot_id
    }
}

impl Eq for Header {}

/// Header fields a listing can be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    CreationTime,
    SnapshotId,
    Version,
    Tags,
}

impl SortField {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "CreationTime" => Ok(SortField::CreationTime),
            "SnapshotID" => Ok(SortField::SnapshotId),
            "Version" => Ok(SortField::Version),
            "Tags" => Ok(SortField::Tags),
            other => Err(CairnError::InvalidSortKey(other.to_string())),
        }
    }
}

/// One parsed sort key: a field plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub descending: bool,
}

/// Parse a sort specification like `"CreationTime,-Tags"`. A leading `-`
/// denotes descending. The same base field may appear only once, in either
/// direction.
pub fn parse_sort_keys(spec: &str) -> Result<Vec<SortKey>> {
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen: Vec<SortField> = Vec::new();
    let mut keys = Vec::new();
    for raw in spec.split(',') {
        let raw = raw.trim();
        let (descending, name) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let field = SortField::parse(name)?;
        if seen.contains(&field) {
            return Err(CairnError::DuplicateSortKey(raw.to_string()));
        }
        seen.push(field);
        keys.push(SortKey { field, descending });
    }
    Ok(keys)
}

fn compare_tags(a: &[String], b: &[String]) -> Ordering {
    // Element-wise, then by length.
    for (x, y) in a.iter().zip(b.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

fn compare_by(a: &Header, b: &Header, key: &SortKey) -> Ordering {
    let ordering = match key.field {
        SortField::CreationTime => a.creation_time.cmp(&b.creation_time),
        SortField::SnapshotId => a.snapshot_id.0.cmp(&b.snapshot_id.0),
        SortField::Version => a.version.cmp(&b.version),
        SortField::Tags => compare_tags(&a.tags, &b.tags),
    };
    if key.descending {
        ordering.reverse()
    } else {
        ordering
    }
}

/// Sort headers lexicographically across the given keys. Equal-case ties
/// fall through to the next key; the sort is stable, so the result is
/// always a permutation of the input.
pub fn sort_headers(headers: &mut [Header], keys: &[SortKey]) {
    headers.sort_by(|a, b| {
        for key in keys {
            match compare_by(a, b, key) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    });
}
