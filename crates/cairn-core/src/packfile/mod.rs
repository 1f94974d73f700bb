use serde::{Deserialize, Serialize};

use cairn_types::checksum::Checksum;

use crate::error::{CairnError, Result};
use crate::hashing::HashingAlgorithm;
use crate::storage::{Namespace, StorageBackend};

/// Default target size for a packfile before it is flushed.
pub const DEFAULT_PACKFILE_TARGET: usize = 20 * 1024 * 1024;

/// Fixed trailer: index_offset (u64 LE) || blob_count (u32 LE) || footer checksum.
const TRAILER_SIZE: usize = 8 + 4 + 32;

/// What an encoded blob inside a packfile contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobKind {
    /// File content produced by the chunker.
    Chunk,
    /// A file's ordered chunk list.
    Object,
    /// A snapshot section (VFS, statistics, errors, ...).
    Section,
}

/// One entry in a packfile's in-band index, sorted by offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackfileEntry {
    pub checksum: Checksum,
    pub offset: u64,
    pub length: u32,
    pub kind: BlobKind,
}

struct BufferedBlob {
    checksum: Checksum,
    kind: BlobKind,
    encoded: Vec<u8>,
}

/// A sealed packfile ready for upload: its identity, full body, and the
/// index entries describing each contained blob.
pub struct SealedPackfile {
    pub checksum: Checksum,
    pub data: Vec<u8>,
    pub entries: Vec<PackfileEntry>,
}

/// Accumulates encoded blobs in memory and assembles them into packfiles.
pub struct PackfileWriter {
    hashing: HashingAlgorithm,
    target_size: usize,
    buffer: Vec<BufferedBlob>,
    current_size: usize,
}

impl PackfileWriter {
    pub fn new(hashing: HashingAlgorithm, target_size: usize) -> Self {
        Self {
            hashing,
            target_size,
            buffer: Vec::new(),
            current_size: 0,
        }
    }

    /// Add an encoded blob. Returns the offset it will occupy in the
    /// sealed packfile.
    pub fn add_blob(&mut self, checksum: Checksum, kind: BlobKind, encoded: Vec<u8>) -> u64 {
        let offset = self.current_size as u64;
        self.current_size += encoded.len();
        self.buffer.push(BufferedBlob {
            checksum,
            kind,
            encoded,
        });
        offset
    }

    /// Whether the current buffer has reached its target size.
    pub fn should_flush(&self) -> bool {
        !self.buffer.is_empty() && self.current_size >= self.target_size
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Assemble buffered blobs into a packfile body and clear internal
    /// state. Does NOT write to storage — the caller uploads `data`.
    pub fn seal(&mut self) -> Result<SealedPackfile> {
        if self.buffer.is_empty() {
            return Err(CairnError::Other("cannot seal empty packfile writer".into()));
        }

        let mut entries: Vec<PackfileEntry> = Vec::with_capacity(self.buffer.len());
        let mut data: Vec<u8> = Vec::with_capacity(self.current_size + TRAILER_SIZE + 1024);

        // 1. Contiguous encoded blobs, offsets assigned in add order.
        for blob in &self.buffer {
            entries.push(PackfileEntry {
                checksum: blob.checksum,
                offset: data.len() as u64,
                length: blob.encoded.len() as u32,
                kind: blob.kind,
            });
            data.extend_from_slice(&blob.encoded);
        }

        // 2. Index section, sorted by offset.
        let index_offset = data.len() as u64;
        let index_bytes = rmp_serde::to_vec(&entries)?;
        data.extend_from_slice(&index_bytes);

        // 3. Trailer: index offset, blob count, footer digest over blobs+index.
        let footer = self.hashing.checksum(&data);
        data.extend_from_slice(&index_offset.to_le_bytes());
        data.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        data.extend_from_slice(footer.as_bytes());

        let checksum = self.hashing.checksum(&data);

        self.buffer.clear();
        self.current_size = 0;

        Ok(SealedPackfile {
            checksum,
            data,
            entries,
        })
    }
}

/// Parse and verify a packfile's in-band index from its full body.
pub fn parse_index(data: &[u8], hashing: HashingAlgorithm) -> Result<Vec<PackfileEntry>> {
    if data.len() < TRAILER_SIZE {
        return Err(CairnError::InvalidFormat("packfile too small".into()));
    }

    let trailer = &data[data.len() - TRAILER_SIZE..];
    let index_offset = u64::from_le_bytes(trailer[..8].try_into().unwrap()) as usize;
    let blob_count = u32::from_le_bytes(trailer[8..12].try_into().unwrap()) as usize;
    let footer = &trailer[12..];

    let body_end = data.len() - TRAILER_SIZE;
    if index_offset > body_end {
        return Err(CairnError::InvalidFormat(
            "packfile index offset out of bounds".into(),
        ));
    }

    let computed = hashing.checksum(&data[..body_end]);
    if computed.as_bytes() != footer {
        return Err(CairnError::corruption(
            "packfile",
            "footer digest mismatch".to_string(),
        ));
    }

    let entries: Vec<PackfileEntry> = rmp_serde::from_slice(&data[index_offset..body_end])?;
    if entries.len() != blob_count {
        return Err(CairnError::InvalidFormat(format!(
            "packfile blob count mismatch: trailer says {blob_count}, index has {}",
            entries.len()
        )));
    }
    for pair in entries.windows(2) {
        if pair[1].offset < pair[0].offset {
            return Err(CairnError::InvalidFormat(
                "packfile index is not sorted by offset".into(),
            ));
        }
    }
    Ok(entries)
}

/// Read a single encoded blob from a stored packfile using a range read,
/// avoiding a full download.
pub fn read_entry(
    storage: &dyn StorageBackend,
    packfile: &Checksum,
    offset: u64,
    length: u32,
) -> Result<Vec<u8>> {
    let key = Namespace::Packfile.key(packfile);
    storage
        .get_range(&key, offset, length as u64)?
        .ok_or_else(|| CairnError::NotFound(format!("packfile {packfile}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_checksum(byte: u8) -> Checksum {
        Checksum([byte; 32])
    }

    #[test]
    fn should_flush_on_size() {
        let mut writer = PackfileWriter::new(HashingAlgorithm::Sha256, 100);
        assert!(!writer.should_flush());
        writer.add_blob(dummy_checksum(0), BlobKind::Chunk, vec![0u8; 120]);
        assert!(writer.should_flush());
    }

    #[test]
    fn seal_empty_fails() {
        let mut writer = PackfileWriter::new(HashingAlgorithm::Sha256, 100);
        assert!(writer.seal().is_err());
    }

    #[test]
    fn seal_and_parse_index() {
        let mut writer = PackfileWriter::new(HashingAlgorithm::Sha256, usize::MAX);
        let off_a = writer.add_blob(dummy_checksum(1), BlobKind::Chunk, vec![0xAA; 100]);
        let off_b = writer.add_blob(dummy_checksum(2), BlobKind::Object, vec![0xBB; 50]);
        assert_eq!(off_a, 0);
        assert_eq!(off_b, 100);

        let sealed = writer.seal().unwrap();
        assert!(!writer.has_pending());

        let entries = parse_index(&sealed.data, HashingAlgorithm::Sha256).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].checksum, dummy_checksum(1));
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[0].length, 100);
        assert_eq!(entries[0].kind, BlobKind::Chunk);
        assert_eq!(entries[1].offset, 100);
        assert_eq!(entries[1].kind, BlobKind::Object);

        // Sub-ranges locate the original blobs.
        let blob_b = &sealed.data[entries[1].offset as usize..][..entries[1].length as usize];
        assert_eq!(blob_b, &[0xBB; 50][..]);
    }

    #[test]
    fn packfile_identity_is_content_digest() {
        let mut writer = PackfileWriter::new(HashingAlgorithm::Sha256, usize::MAX);
        writer.add_blob(dummy_checksum(1), BlobKind::Chunk, vec![1, 2, 3]);
        let sealed = writer.seal().unwrap();
        assert_eq!(
            sealed.checksum,
            HashingAlgorithm::Sha256.checksum(&sealed.data)
        );
    }

    #[test]
    fn parse_rejects_flipped_bit() {
        let mut writer = PackfileWriter::new(HashingAlgorithm::Sha256, usize::MAX);
        writer.add_blob(dummy_checksum(1), BlobKind::Chunk, vec![0xCC; 64]);
        let mut sealed = writer.seal().unwrap();

        sealed.data[10] ^= 0x01;
        assert!(matches!(
            parse_index(&sealed.data, HashingAlgorithm::Sha256),
            Err(CairnError::Corruption { .. })
        ));
    }

    #[test]
    fn parse_rejects_truncated_packfile() {
        assert!(parse_index(&[0u8; 10], HashingAlgorithm::Sha256).is_err());
    }

    #[test]
    fn seal_resets_writer_for_reuse() {
        let mut writer = PackfileWriter::new(HashingAlgorithm::Sha256, usize::MAX);
        writer.add_blob(dummy_checksum(1), BlobKind::Chunk, vec![1; 10]);
        let first = writer.seal().unwrap();

        writer.add_blob(dummy_checksum(2), BlobKind::Chunk, vec![2; 10]);
        let second = writer.seal().unwrap();

        assert_ne!(first.checksum, second.checksum);
        assert_eq!(second.entries[0].offset, 0);
    }
}
