use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunker::ChunkingConfig;
use crate::error::{CairnError, Result};

/// Current repository format version.
pub const REPOSITORY_VERSION: u32 = 1;

/// Passphrase-derived encryption settings persisted in the CONFIG blob.
///
/// `key` is the base64-encoded `salt || scrypt(passphrase, salt)` secret;
/// it never contains usable key material on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub algorithm: String,
    pub key: String,
}

/// The singleton CONFIG blob, written once at repository creation and
/// never modified. All algorithm choices are recorded by **name** so a
/// future version can add algorithms without breaking old repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub version: u32,
    pub repository_id: Uuid,
    pub creation_time: DateTime<Utc>,
    pub hashing: String,
    pub chunking: ChunkingConfig,
    pub compression: Option<String>,
    pub encryption: Option<EncryptionConfig>,
}

impl RepositoryConfig {
    /// Default configuration: SHA-256 hashing, FastCDC chunking, LZ4
    /// compression, no encryption (enabled when a passphrase is supplied
    /// at creation time).
    pub fn new() -> Self {
        RepositoryConfig {
            version: REPOSITORY_VERSION,
            repository_id: Uuid::new_v4(),
            creation_time: Utc::now(),
            hashing: "sha256".to_string(),
            chunking: ChunkingConfig::default(),
            compression: Some("lz4".to_string()),
            encryption: None,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config: RepositoryConfig = rmp_serde::from_slice(data)?;
        if config.version != REPOSITORY_VERSION {
            return Err(CairnError::UnsupportedVersion(config.version));
        }
        config.chunking.validate()?;
        Ok(config)
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_roundtrip() {
        let config = RepositoryConfig::new();
        let bytes = config.serialize().unwrap();
        let restored = RepositoryConfig::deserialize(&bytes).unwrap();
        assert_eq!(config.repository_id, restored.repository_id);
        assert_eq!(config.hashing, restored.hashing);
        assert_eq!(config.compression, restored.compression);
        assert_eq!(config.chunking.min_size, restored.chunking.min_size);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut config = RepositoryConfig::new();
        config.version = 99;
        let bytes = config.serialize().unwrap();
        assert!(matches!(
            RepositoryConfig::deserialize(&bytes),
            Err(CairnError::UnsupportedVersion(99))
        ));
    }
}
