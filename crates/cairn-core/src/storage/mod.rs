pub mod fs_backend;
pub mod net_backend;
pub mod null_backend;
pub mod object_backend;
pub mod protocol;

use std::fmt;

use cairn_types::checksum::Checksum;
use cairn_types::snapshot_id::SnapshotId;
use url::Url;

use crate::error::{CairnError, Result};

/// The content-addressed namespaces of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Snapshot,
    Blob,
    Chunk,
    Packfile,
    State,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Snapshot => "SNAPSHOT",
            Namespace::Blob => "BLOB",
            Namespace::Chunk => "CHUNK",
            Namespace::Packfile => "PACKFILE",
            Namespace::State => "STATE",
        }
    }

    /// Storage key for a checksum in this namespace: `NS/<hex[0:2]>/<hex>`.
    pub fn key(&self, checksum: &Checksum) -> String {
        format!(
            "{}/{}/{}",
            self.prefix(),
            checksum.shard_prefix(),
            checksum.to_hex()
        )
    }

    /// Parse a full key back into the checksum it names.
    pub fn checksum_from_key(&self, key: &str) -> Option<Checksum> {
        let hex = key.rsplit('/').next()?;
        Checksum::from_hex(hex).ok()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Storage key of the singleton CONFIG blob.
pub const CONFIG_KEY: &str = "CONFIG";

/// Storage key for a snapshot header.
pub fn snapshot_key(id: &SnapshotId) -> String {
    format!("SNAPSHOT/{}/{}", id.shard_prefix(), id.to_hex())
}

/// Abstract key-value storage for repository objects.
/// Keys are `/`-separated string paths (e.g. `PACKFILE/ab/ab01cd02...`).
pub trait StorageBackend: Send + Sync {
    /// Read an object by key. Returns `None` if not found.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object. Writing an existing digest-keyed object with
    /// identical content is a no-op.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Check if an object exists.
    fn exists(&self, key: &str) -> Result<bool>;

    /// List all keys under a prefix. Iteration order is unspecified.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read a byte range from an object. Returns `None` if not found.
    /// A short read is an error, not a silent truncation.
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    /// Create a directory marker (no-op for flat object stores).
    fn create_dir(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Whether a backend I/O error is transient and worth a single retry.
fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Run a backend operation, retrying exactly once on a transient I/O error.
/// Recovery is local to this boundary; all other errors propagate as-is.
pub fn with_retry<T>(op_name: &str, f: impl Fn() -> Result<T>) -> Result<T> {
    match f() {
        Ok(val) => Ok(val),
        Err(CairnError::Io(e)) if is_retryable_io(&e) => {
            tracing::warn!("storage {op_name}: transient error, retrying once: {e}");
            f()
        }
        Err(e) => Err(e),
    }
}

/// Parsed repository location.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLocation {
    /// Local filesystem path.
    Fs { path: String },
    /// S3-compatible object store.
    Object {
        bucket: String,
        root: String,
        endpoint: String,
    },
    /// Network transport (persistent RPC connection).
    Net { addr: String },
    /// Discards all writes; reads return nothing.
    Null,
}

/// Parse a repository location into its components.
///
/// Supported formats:
/// - Bare path (`/backups/repo`, `./relative`, `relative`) -> `Fs`
/// - `file:///backups/repo` -> `Fs`
/// - `s3://endpoint[:port]/bucket[/prefix]` -> `Object`
/// - `tcp://host:port` -> `Net`
/// - `null://` -> `Null`
pub fn parse_location(raw: &str) -> Result<ParsedLocation> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CairnError::Config(
            "repository location must not be empty".into(),
        ));
    }

    if !trimmed.contains("://") {
        return Ok(ParsedLocation::Fs {
            path: trimmed.to_string(),
        });
    }

    // `null://` has no host or path to parse.
    if trimmed == "null://" {
        return Ok(ParsedLocation::Null);
    }

    let url = Url::parse(trimmed)
        .map_err(|e| CairnError::Config(format!("invalid repository location '{trimmed}': {e}")))?;

    match url.scheme() {
        "file" => {
            let path = url.path().to_string();
            if path.is_empty() {
                return Err(CairnError::Config("file:// URL has empty path".into()));
            }
            Ok(ParsedLocation::Fs { path })
        }
        "s3" => {
            let host = url
                .host_str()
                .ok_or_else(|| CairnError::Config("s3 URL is missing an endpoint host".into()))?;
            let port_suffix = url.port().map(|p| format!(":{p}")).unwrap_or_default();
            let endpoint = format!("https://{host}{port_suffix}");

            let path = url.path().trim_start_matches('/');
            let (bucket, root) = path.split_once('/').unwrap_or((path, ""));
            if bucket.is_empty() {
                return Err(CairnError::Config(
                    "s3 URL must include a bucket in the path".into(),
                ));
            }
            Ok(ParsedLocation::Object {
                bucket: bucket.to_string(),
                root: root.to_string(),
                endpoint,
            })
        }
        "tcp" => {
            let host = url
                .host_str()
                .ok_or_else(|| CairnError::Config("tcp:// URL is missing a host".into()))?;
            let port = url
                .port()
                .ok_or_else(|| CairnError::Config("tcp:// URL is missing a port".into()))?;
            Ok(ParsedLocation::Net {
                addr: format!("{host}:{port}"),
            })
        }
        "null" => Ok(ParsedLocation::Null),
        other => Err(CairnError::UnsupportedBackend(format!(
            "unsupported location scheme: '{other}'"
        ))),
    }
}

/// Build a storage backend for a repository location.
pub fn backend_from_location(location: &str) -> Result<Box<dyn StorageBackend>> {
    match parse_location(location)? {
        ParsedLocation::Fs { path } => Ok(Box::new(fs_backend::FsBackend::new(&path)?)),
        ParsedLocation::Object {
            bucket,
            root,
            endpoint,
        } => {
            let access_key_id = std::env::var("CAIRN_ACCESS_KEY_ID")
                .map_err(|_| CairnError::Config("object store requires CAIRN_ACCESS_KEY_ID".into()))?;
            let secret_access_key = std::env::var("CAIRN_SECRET_ACCESS_KEY").map_err(|_| {
                CairnError::Config("object store requires CAIRN_SECRET_ACCESS_KEY".into())
            })?;
            Ok(Box::new(object_backend::ObjectBackend::new(
                &bucket,
                &root,
                &endpoint,
                &access_key_id,
                &secret_access_key,
            )?))
        }
        ParsedLocation::Net { addr } => Ok(Box::new(net_backend::NetBackend::connect(&addr)?)),
        ParsedLocation::Null => Ok(Box::new(null_backend::NullBackend::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_key_is_sharded() {
        let c = Checksum([0xAB; 32]);
        let key = Namespace::Chunk.key(&c);
        assert!(key.starts_with("CHUNK/ab/ab"));
        assert_eq!(Namespace::Chunk.checksum_from_key(&key), Some(c));
    }

    #[test]
    fn snapshot_key_is_sharded() {
        let id = SnapshotId([0x01; 32]);
        assert!(snapshot_key(&id).starts_with("SNAPSHOT/01/01"));
    }

    #[test]
    fn parse_bare_paths() {
        assert_eq!(
            parse_location("/backups/repo").unwrap(),
            ParsedLocation::Fs {
                path: "/backups/repo".into()
            }
        );
        assert_eq!(
            parse_location("./repo").unwrap(),
            ParsedLocation::Fs {
                path: "./repo".into()
            }
        );
        assert_eq!(
            parse_location("repo").unwrap(),
            ParsedLocation::Fs {
                path: "repo".into()
            }
        );
    }

    #[test]
    fn parse_file_url() {
        assert_eq!(
            parse_location("file:///backups/repo").unwrap(),
            ParsedLocation::Fs {
                path: "/backups/repo".into()
            }
        );
    }

    #[test]
    fn parse_s3_url() {
        assert_eq!(
            parse_location("s3://minio.local:9000/bucket/prefix").unwrap(),
            ParsedLocation::Object {
                bucket: "bucket".into(),
                root: "prefix".into(),
                endpoint: "https://minio.local:9000".into(),
            }
        );
    }

    #[test]
    fn parse_s3_requires_bucket() {
        assert!(parse_location("s3://minio.local:9000").is_err());
    }

    #[test]
    fn parse_tcp_url() {
        assert_eq!(
            parse_location("tcp://backup.local:7629").unwrap(),
            ParsedLocation::Net {
                addr: "backup.local:7629".into()
            }
        );
        assert!(parse_location("tcp://backup.local").is_err());
    }

    #[test]
    fn parse_null_url() {
        assert_eq!(parse_location("null://").unwrap(), ParsedLocation::Null);
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(matches!(
            parse_location("ftp://host/path"),
            Err(CairnError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn retry_recovers_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let attempts = AtomicUsize::new(0);
        let result: Result<u32> = with_retry("get", || {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CairnError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "slow",
                )))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retry_does_not_mask_permanent_errors() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let attempts = AtomicUsize::new(0);
        let result: Result<u32> = with_retry("get", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(CairnError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "denied",
            )))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
