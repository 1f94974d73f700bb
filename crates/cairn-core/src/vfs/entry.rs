use serde::{Deserialize, Serialize};

// Unix file-type bits, kept verbatim in `mode`.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Stat record for one filesystem identity. Identical (dev, ino) pairs
/// share one record regardless of how many paths reference them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mod_time: i64,
    pub dev: u64,
    pub ino: u64,
    pub uid: u32,
    pub gid: u32,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// The dedup key for this filesystem identity.
    pub fn inode_key(&self) -> String {
        format!("{},{}", self.dev, self.ino)
    }

    /// Build a FileInfo from local metadata (unix).
    #[cfg(unix)]
    pub fn from_metadata(name: &str, metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        FileInfo {
            name: name.to_string(),
            size: metadata.size(),
            mode: metadata.mode(),
            mod_time: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            dev: metadata.dev(),
            ino: metadata.ino(),
            uid: metadata.uid(),
            gid: metadata.gid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn file_info(name: &str, size: u64, mode: u32, dev: u64, ino: u64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size,
            mode,
            mod_time: 0,
            dev,
            ino,
            uid: 1000,
            gid: 1000,
        }
    }

    #[test]
    fn mode_helpers() {
        let dir = file_info("d", 0, S_IFDIR | 0o755, 1, 1);
        assert!(dir.is_dir());
        assert!(!dir.is_regular());

        let file = file_info("f", 10, S_IFREG | 0o644, 1, 2);
        assert!(file.is_regular());
        assert!(!file.is_dir());

        let link = file_info("l", 0, S_IFLNK | 0o777, 1, 3);
        assert!(link.is_symlink());
        assert!(!link.is_regular());
        assert!(!link.is_dir());
    }

    #[test]
    fn inode_key_format() {
        let info = file_info("f", 10, S_IFREG, 42, 7);
        assert_eq!(info.inode_key(), "42,7");
    }
}
