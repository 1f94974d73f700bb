use crate::error::Result;
use crate::storage::StorageBackend;

/// Backend that accepts every write and remembers nothing. Useful for
/// benchmarking the producer pipeline without storage costs.
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        NullBackend
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for NullBackend {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn put(&self, _key: &str, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn get_range(&self, _key: &str, _offset: u64, _length: u64) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}
