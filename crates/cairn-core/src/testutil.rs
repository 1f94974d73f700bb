use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::chunker::ChunkingConfig;
use crate::config::RepositoryConfig;
use crate::error::{CairnError, Result};
use crate::repository::Repository;
use crate::storage::StorageBackend;

/// In-memory storage backend for tests. Thread-safe via Mutex; cloneable
/// so a repository can be "re-opened" over the same stored bytes.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip one bit in the first stored object whose key starts with
    /// `prefix`, at `offset` into its body. Returns the affected key.
    pub fn flip_bit(&self, prefix: &str, offset: usize) -> Option<String> {
        let mut map = self.data.lock().unwrap();
        let key = map.keys().find(|k| k.starts_with(prefix))?.clone();
        let value = map.get_mut(&key)?;
        let byte = value.get_mut(offset)?;
        *byte ^= 0x01;
        Some(key)
    }

    pub fn key_count(&self, prefix: &str) -> usize {
        self.data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.entry(key.to_string()).or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        match map.get(key) {
            Some(data) => {
                let start = offset as usize;
                let end = start + length as usize;
                // Same contract as the real backends: a short read is an
                // error, not a silent truncation.
                if end > data.len() {
                    return Err(CairnError::corruption(
                        key,
                        format!(
                            "short range read: wanted {length} bytes at offset {offset}, object has {}",
                            data.len()
                        ),
                    ));
                }
                Ok(Some(data[start..end].to_vec()))
            }
            None => Ok(None),
        }
    }
}

/// Small chunking bounds so tests hit multi-chunk paths with little data.
pub fn small_chunking() -> ChunkingConfig {
    ChunkingConfig {
        algorithm: "fastcdc".to_string(),
        min_size: 256,
        normal_size: 1024,
        max_size: 4096,
    }
}

pub fn test_config() -> RepositoryConfig {
    let mut config = RepositoryConfig::new();
    config.chunking = small_chunking();
    config
}

/// Create a plaintext repository over a fresh memory backend.
pub fn test_repo_plaintext() -> (MemoryBackend, Repository) {
    let backend = MemoryBackend::new();
    let repo = Repository::init(Box::new(backend.clone()), test_config(), None)
        .expect("failed to init test repo");
    (backend, repo)
}

/// Create an encrypted repository over a fresh memory backend.
pub fn test_repo_encrypted(passphrase: &[u8]) -> (MemoryBackend, Repository) {
    let backend = MemoryBackend::new();
    let repo = Repository::init(Box::new(backend.clone()), test_config(), Some(passphrase))
        .expect("failed to init test repo");
    (backend, repo)
}

/// Deterministic pseudo-random bytes (xorshift), so chunk boundaries are
/// content-driven and reproducible across runs.
pub fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}
