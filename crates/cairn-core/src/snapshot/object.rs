use serde::{Deserialize, Serialize};

use cairn_types::checksum::Checksum;

use crate::error::Result;

/// Reference to one chunk of a file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub checksum: Checksum,
    /// Plaintext size of the chunk.
    pub size: u32,
}

/// An object: the ordered chunk list representing one file's content.
/// Identified by the digest of its serialized form, so identical files
/// collapse to one stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub chunks: Vec<ChunkRef>,
}

impl Object {
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
