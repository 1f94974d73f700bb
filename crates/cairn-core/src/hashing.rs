use blake2::digest::consts::U32;
use blake2::Blake2b;
use sha2::{Digest as _, Sha256};

use cairn_types::checksum::Checksum;

use crate::error::{CairnError, Result};

type Blake2b256 = Blake2b<U32>;

/// A named digest function producing 32-byte checksums.
///
/// The repository configuration records the algorithm **name**; looking the
/// name up again on open keeps old repositories readable when new hashers
/// are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashingAlgorithm {
    #[default]
    Sha256,
    Blake2b256,
}

impl HashingAlgorithm {
    /// Resolve a configured name. Unknown names are an error, never a
    /// silent fallback.
    pub fn lookup(name: &str) -> Result<Self> {
        match name {
            "sha256" => Ok(HashingAlgorithm::Sha256),
            "blake2b256" => Ok(HashingAlgorithm::Blake2b256),
            other => Err(CairnError::UnsupportedHashing(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashingAlgorithm::Sha256 => "sha256",
            HashingAlgorithm::Blake2b256 => "blake2b256",
        }
    }

    /// One-shot checksum of a byte slice.
    pub fn checksum(&self, data: &[u8]) -> Checksum {
        let mut digester = self.digester();
        digester.update(data);
        digester.finalize()
    }

    /// Incremental hasher for streamed input.
    pub fn digester(&self) -> Digester {
        match self {
            HashingAlgorithm::Sha256 => Digester::Sha256(Sha256::new()),
            HashingAlgorithm::Blake2b256 => Digester::Blake2b256(Blake2b256::new()),
        }
    }
}

pub enum Digester {
    Sha256(Sha256),
    Blake2b256(Blake2b256),
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Sha256(h) => h.update(data),
            Digester::Blake2b256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        let mut out = [0u8; 32];
        match self {
            Digester::Sha256(h) => out.copy_from_slice(&h.finalize()),
            Digester::Blake2b256(h) => out.copy_from_slice(&h.finalize()),
        }
        Checksum(out)
    }
}
