use thiserror::Error;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("not found: '{0}'")]
    NotFound(String),

    #[error("repository already exists at '{0}'")]
    AlreadyExists(String),

    #[error("passphrase does not match")]
    BadPassphrase,

    #[error("unsupported hashing algorithm: '{0}'")]
    UnsupportedHashing(String),

    #[error("unsupported compression algorithm: '{0}'")]
    UnsupportedCompression(String),

    #[error("unsupported chunking algorithm: '{0}'")]
    UnsupportedChunking(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("codec '{name}' failed: {message}")]
    Codec { name: &'static str, message: String },

    #[error("corruption in '{context}': {message}")]
    Corruption { context: String, message: String },

    #[error("snapshot not found: '{0}'")]
    SnapshotNotFound(String),

    #[error("not a directory: '{0}'")]
    NotADirectory(String),

    #[error("invalid sort key: '{0}'")]
    InvalidSortKey(String),

    #[error("duplicate sort key: '{0}'")]
    DuplicateSortKey(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported repository version: {0}")]
    UnsupportedVersion(u32),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// Corruption helper used wherever a decode, AEAD open, or digest
    /// mismatch names the object it failed on.
    pub fn corruption(context: impl Into<String>, message: impl Into<String>) -> Self {
        CairnError::Corruption {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Whether this error should skip a single source file instead of
    /// aborting the whole backup. Only pre-commit read errors qualify.
    pub fn is_soft_file_error(&self) -> bool {
        match self {
            CairnError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_errors_are_only_read_failures() {
        let denied = CairnError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(denied.is_soft_file_error());

        let missing = CairnError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(missing.is_soft_file_error());

        assert!(!CairnError::BadPassphrase.is_soft_file_error());
        assert!(!CairnError::corruption("x", "y").is_soft_file_error());
    }
}
