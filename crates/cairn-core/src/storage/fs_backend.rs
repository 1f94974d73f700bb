use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{CairnError, Result};
use crate::storage::StorageBackend;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

/// On-disk storage backend. Objects are plain files under the repository
/// root, sharded by the first byte of their digest. Files are created mode
/// 0600, directories 0700.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        // Canonicalize when the path exists so strip_prefix behaves with
        // symlinked roots.
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self { root })
    }

    /// Reject storage keys that could escape the repository root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CairnError::InvalidFormat("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') || key.contains('\\') {
            return Err(CairnError::InvalidFormat(format!(
                "unsafe storage key: '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(CairnError::InvalidFormat(format!(
                    "unsafe storage key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn create_dir_restricted(path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl StorageBackend for FsBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if path.exists() {
            // Digest-keyed objects are immutable; an existing key is a no-op.
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            Self::create_dir_restricted(parent)?;
        }

        // Write to a temp name then rename, so readers never see a partial
        // object and concurrent writers of the same digest race benignly.
        let tmp = path.with_extension("tmp");
        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(0o600);
            let mut file = options.open(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let mut keys = Vec::new();
                self.list_recursive(&dir, &mut keys)?;
                Ok(keys)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(e.into()),
            }
        }
        if filled < buf.len() {
            return Err(CairnError::corruption(
                key,
                format!("short range read: wanted {length} bytes, got {filled}"),
            ));
        }
        Ok(Some(buf))
    }

    fn create_dir(&self, key: &str) -> Result<()> {
        let path = self.resolve(key.trim_end_matches('/'))?;
        Self::create_dir_restricted(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(FsBackend::validate_key("/etc/passwd").is_err());
        assert!(FsBackend::validate_key("../../outside").is_err());
        assert!(FsBackend::validate_key("foo/../../etc/passwd").is_err());
        assert!(FsBackend::validate_key("foo\\bar").is_err());
        assert!(FsBackend::validate_key("").is_err());
    }

    #[test]
    fn validate_key_accepts_safe_keys() {
        assert!(FsBackend::validate_key("CONFIG").is_ok());
        assert!(FsBackend::validate_key("PACKFILE/ab/deadbeef").is_ok());
        assert!(FsBackend::validate_key("SNAPSHOT/01/0123").is_ok());
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("CHUNK/ab/abcd", b"hello").unwrap();
        assert_eq!(backend.get("CHUNK/ab/abcd").unwrap().unwrap(), b"hello");
        assert!(backend.exists("CHUNK/ab/abcd").unwrap());
        assert!(backend.get("CHUNK/ab/missing").unwrap().is_none());
    }

    #[test]
    fn put_existing_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("CHUNK/ab/abcd", b"first").unwrap();
        backend.put("CHUNK/ab/abcd", b"second").unwrap();
        assert_eq!(backend.get("CHUNK/ab/abcd").unwrap().unwrap(), b"first");
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("CHUNK/ab/abcd", b"secret").unwrap();

        let file_mode = fs::metadata(dir.path().join("CHUNK/ab/abcd"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = fs::metadata(dir.path().join("CHUNK/ab"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn get_range_reads_subpart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("PACKFILE/00/0000", b"0123456789").unwrap();
        assert_eq!(
            backend.get_range("PACKFILE/00/0000", 2, 4).unwrap().unwrap(),
            b"2345"
        );
        assert!(backend.get_range("PACKFILE/00/missing", 0, 4).unwrap().is_none());
    }

    #[test]
    fn get_range_rejects_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("PACKFILE/00/0000", b"tiny").unwrap();
        assert!(backend.get_range("PACKFILE/00/0000", 0, 100).is_err());
    }

    #[test]
    fn list_returns_keys_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("STATE/aa/aa01", b"x").unwrap();
        backend.put("STATE/bb/bb02", b"y").unwrap();
        backend.put("CONFIG", b"z").unwrap();

        let mut keys = backend.list("STATE").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["STATE/aa/aa01", "STATE/bb/bb02"]);
        assert!(backend.list("no_such_prefix").unwrap().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path().to_str().unwrap()).unwrap();
        backend.put("BLOB/cc/cc01", b"x").unwrap();
        backend.delete("BLOB/cc/cc01").unwrap();
        backend.delete("BLOB/cc/cc01").unwrap();
        assert!(!backend.exists("BLOB/cc/cc01").unwrap());
    }
}
