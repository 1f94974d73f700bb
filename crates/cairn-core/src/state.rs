use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cairn_types::checksum::Checksum;
use cairn_types::snapshot_id::SnapshotId;

use crate::error::Result;
use crate::packfile::BlobKind;

/// Where one encoded blob lives: which packfile, and the sub-range inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub packfile: Checksum,
    pub offset: u64,
    pub length: u32,
    pub kind: BlobKind,
}

/// A committed, serialized summary of which digests belong to a completed
/// snapshot, and where each one lives. Answers "does this digest exist?"
/// without scanning packfiles. Identified by the checksum of its body;
/// immutable once written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    pub snapshot_id: SnapshotId,
    entries: HashMap<Checksum, Location>,
}

impl State {
    pub fn new(snapshot_id: SnapshotId) -> Self {
        State {
            snapshot_id,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, checksum: Checksum, location: Location) {
        self.entries.insert(checksum, location);
    }

    pub fn get(&self, checksum: &Checksum) -> Option<&Location> {
        self.entries.get(checksum)
    }

    pub fn contains(&self, checksum: &Checksum) -> bool {
        self.entries.contains_key(checksum)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Checksum, &Location)> {
        self.entries.iter()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// The repository's aggregate view over all committed states, rebuilt at
/// open time. First location wins on overlap — identical digests name
/// identical content, so any copy is as good as another.
#[derive(Debug, Default)]
pub struct StateIndex {
    locations: HashMap<Checksum, Location>,
    /// Digest of each merged state body, keyed by snapshot id.
    states: HashMap<SnapshotId, Checksum>,
}

impl StateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one committed state into the aggregate.
    pub fn merge(&mut self, state_checksum: Checksum, state: &State) {
        self.states.insert(state.snapshot_id, state_checksum);
        for (checksum, location) in state.iter() {
            self.locations.entry(*checksum).or_insert(*location);
        }
    }

    pub fn lookup(&self, checksum: &Checksum) -> Option<&Location> {
        self.locations.get(checksum)
    }

    pub fn contains(&self, checksum: &Checksum) -> bool {
        self.locations.contains_key(checksum)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn state_for(&self, snapshot_id: &SnapshotId) -> Option<&Checksum> {
        self.states.get(snapshot_id)
    }

    /// Packfiles referenced by at least one location.
    pub fn referenced_packfiles(&self) -> std::collections::HashSet<Checksum> {
        self.locations.values().map(|l| l.packfile).collect()
    }
}
