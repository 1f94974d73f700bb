pub mod header;
pub mod object;
pub mod pipeline;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cairn_types::checksum::Checksum;
use cairn_types::snapshot_id::SnapshotId;

use crate::chunker::ChunkStream;
use crate::error::{CairnError, Result};
use crate::packfile::{BlobKind, PackfileWriter, DEFAULT_PACKFILE_TARGET};
use crate::repository::Repository;
use crate::state::State;
use crate::storage::{with_retry, Namespace};
use crate::vfs::{clean_path, entry::FileInfo, Filesystem};

use self::header::{Header, Importer};
use self::object::{ChunkRef, Object};

/// Cancellation signal carried through every suspension point of a backup
/// or restore. Cloneable; cancelling one handle cancels them all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CairnError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One per-path failure recorded into the snapshot's errors section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotError {
    pub path: String,
    pub message: String,
}

/// Aggregate counters stored in the statistics section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub chunks: u64,
    pub new_chunks: u64,
    pub objects: u64,
    pub source_bytes: u64,
    pub stored_bytes: u64,
}

/// Options applied to the header at finalize time.
#[derive(Debug, Clone, Default)]
pub struct FinalizeOptions {
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub importer: Importer,
    pub context: Vec<(String, String)>,
}

/// An in-progress snapshot (the `Building` state). Dropped without
/// `finalize`, it leaves no header and no committed state behind; any
/// packfiles already flushed are unreferenced but harmless and will be
/// deduplicated against on retry.
pub struct SnapshotWriter<'a> {
    repo: &'a Repository,
    snapshot_id: SnapshotId,
    started: Instant,
    fs: Filesystem,
    objects: BTreeMap<Checksum, Object>,
    /// Pathname -> object digest, the metadata section.
    path_objects: BTreeMap<String, Checksum>,
    packer: PackfileWriter,
    /// Locations of everything this snapshot has persisted so far.
    state: State,
    /// Digests buffered in the open packer, not yet locatable.
    staged: std::collections::HashSet<Checksum>,
    errors: Vec<SnapshotError>,
    statistics: Statistics,
    cancel: CancelToken,
}

impl Repository {
    /// Start building a snapshot. Its id is random and assigned now.
    pub fn begin_snapshot(&self) -> SnapshotWriter<'_> {
        let snapshot_id = SnapshotId::generate();
        debug!(snapshot = %snapshot_id, "begin snapshot");
        SnapshotWriter {
            repo: self,
            snapshot_id,
            started: Instant::now(),
            fs: Filesystem::new(),
            objects: BTreeMap::new(),
            path_objects: BTreeMap::new(),
            packer: PackfileWriter::new(self.hashing(), DEFAULT_PACKFILE_TARGET),
            state: State::new(snapshot_id),
            staged: std::collections::HashSet::new(),
            errors: Vec::new(),
            statistics: Statistics::default(),
            cancel: CancelToken::new(),
        }
    }
}

impl<'a> SnapshotWriter<'a> {
    pub fn id(&self) -> SnapshotId {
        self.snapshot_id
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn repository(&self) -> &'a Repository {
        self.repo
    }

    /// Account for one chunk reference. Returns `true` when the chunk is
    /// already held — by this snapshot's packer or state, or by a committed
    /// state, whose location is then adopted so this snapshot's STATE
    /// covers every digest it references (deletion of the older snapshot
    /// must not orphan shared chunks).
    fn adopt_or_miss(&mut self, checksum: &Checksum) -> bool {
        if self.staged.contains(checksum) || self.state.contains(checksum) {
            return true;
        }
        if let Some(location) = self.repo.lookup_location(checksum) {
            self.state.insert(*checksum, location);
            return true;
        }
        false
    }

    /// Encode a chunk and buffer it for packing, flushing the packer when
    /// it reaches its target size.
    fn stage_chunk(&mut self, checksum: Checksum, data: &[u8]) -> Result<()> {
        let encoded = self.repo.encode_blob(data)?;
        self.stage_encoded_chunk(checksum, encoded)
    }

    /// Buffer an already-encoded chunk (parallel workers encode off-thread).
    fn stage_encoded_chunk(&mut self, checksum: Checksum, encoded: Vec<u8>) -> Result<()> {
        self.statistics.new_chunks += 1;
        self.statistics.stored_bytes += encoded.len() as u64;
        self.packer.add_blob(checksum, BlobKind::Chunk, encoded);
        self.staged.insert(checksum);
        if self.packer.should_flush() {
            self.flush_packer()?;
        }
        Ok(())
    }

    /// Seal the open packer and persist it, recording blob locations.
    fn flush_packer(&mut self) -> Result<()> {
        if !self.packer.has_pending() {
            return Ok(());
        }
        let sealed = self.packer.seal()?;
        self.repo.put_packfile(&sealed, &mut self.state)?;
        self.staged.clear();
        Ok(())
    }

    /// Record a file's content: chunk, digest, dedup-skip, encode and
    /// stage the misses, then store its object and index it in the VFS.
    pub fn put_file(&mut self, path: &str, info: &FileInfo, reader: impl Read) -> Result<()> {
        let mut refs: Vec<ChunkRef> = Vec::new();
        for chunk in ChunkStream::new(reader, &self.repo.config().chunking) {
            self.cancel.check()?;
            let chunk = chunk?;
            let checksum = self.repo.checksum(&chunk.data);
            self.statistics.chunks += 1;
            self.statistics.source_bytes += chunk.data.len() as u64;
            if !self.adopt_or_miss(&checksum) {
                self.stage_chunk(checksum, &chunk.data)?;
            }
            refs.push(ChunkRef {
                checksum,
                size: chunk.data.len() as u32,
            });
        }
        self.finish_file(path, info, refs)
    }

    /// Register the object for a fully chunked file and index its path.
    fn finish_file(&mut self, path: &str, info: &FileInfo, refs: Vec<ChunkRef>) -> Result<()> {
        let object = Object { chunks: refs };
        let object_checksum = self.repo.put_blob(&object.serialize()?)?;

        let path = clean_path(path);
        self.statistics.objects += 1;
        self.objects.insert(object_checksum, object);
        self.path_objects.insert(path.clone(), object_checksum);
        self.fs.record(&path, info);
        Ok(())
    }

    pub fn put_directory(&mut self, path: &str, info: &FileInfo) {
        self.fs.record(path, info);
    }

    pub fn put_symlink(&mut self, path: &str, info: &FileInfo, target: &str) {
        self.fs.record(path, info);
        self.fs.record_symlink(path, target);
    }

    /// Record a per-path failure. The snapshot still commits, reflecting
    /// what was readable; the failure lands in the errors section.
    pub fn record_error(&mut self, path: &str, message: &str) {
        warn!(path, message, "recording per-path backup error");
        self.errors.push(SnapshotError {
            path: path.to_string(),
            message: message.to_string(),
        });
    }

    /// Walk a source tree sequentially, recording everything under its
    /// absolute pathname. Unreadable entries become errors-section records.
    pub fn scan(&mut self, source: &Path) -> Result<()> {
        let source = source
            .canonicalize()
            .map_err(|e| CairnError::Io(std::io::Error::new(e.kind(), format!("{source:?}: {e}"))))?;
        self.scan_entry(&source)
    }

    fn scan_entry(&mut self, path: &Path) -> Result<()> {
        self.cancel.check()?;
        let logical = clean_path(&path.to_string_lossy());

        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                self.record_error(&logical, &e.to_string());
                return Ok(());
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let info = FileInfo::from_metadata(&name, &metadata);

        if metadata.file_type().is_symlink() {
            match std::fs::read_link(path) {
                Ok(target) => {
                    self.put_symlink(&logical, &info, &target.to_string_lossy());
                }
                Err(e) => self.record_error(&logical, &e.to_string()),
            }
            return Ok(());
        }

        if metadata.is_dir() {
            self.put_directory(&logical, &info);
            let mut entries: Vec<_> = match std::fs::read_dir(path) {
                Ok(iter) => match iter.collect::<std::io::Result<Vec<_>>>() {
                    Ok(entries) => entries,
                    Err(e) => {
                        self.record_error(&logical, &e.to_string());
                        return Ok(());
                    }
                },
                Err(e) => {
                    self.record_error(&logical, &e.to_string());
                    return Ok(());
                }
            };
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                self.scan_entry(&entry.path())?;
            }
            return Ok(());
        }

        match std::fs::File::open(path) {
            Ok(file) => self.put_file(&logical, &info, file),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                self.record_error(&logical, &e.to_string());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the snapshot: pack the sections, flush packfiles, commit
    /// the state (strictly after all packfile puts), then store the
    /// header. Only after the header lands is the snapshot visible.
    pub fn finalize(mut self, options: FinalizeOptions) -> Result<Header> {
        self.cancel.check()?;

        // Section payloads go through the same codec pipeline as chunks.
        let root = self.repo.put_blob(&self.fs.serialize()?)?;
        let index = self.repo.put_blob(&rmp_serde::to_vec(&self.objects)?)?;
        let metadata = self.repo.put_blob(&rmp_serde::to_vec(&self.path_objects)?)?;
        let statistics = self.repo.put_blob(&rmp_serde::to_vec(&self.statistics)?)?;
        let errors = if self.errors.is_empty() {
            Checksum::zero()
        } else {
            self.repo.put_blob(&rmp_serde::to_vec(&self.errors)?)?
        };

        self.flush_packer()?;
        self.repo.commit_state(&self.state)?;

        let mut header = Header::new(self.snapshot_id, self.repo.config().version);
        header.creation_duration = self.started.elapsed();
        header.category = options.category.unwrap_or_else(|| "default".to_string());
        header.tags = options.tags;
        header.importer = options.importer;
        for (key, value) in &options.context {
            header.set_context(key, value);
        }
        header.set_context("engine.version", env!("CARGO_PKG_VERSION"));
        header.root = root;
        header.index = index;
        header.metadata = metadata;
        header.statistics = statistics;
        header.errors = errors;
        header.summary = self.fs.summary();

        self.repo.put_header(&header)?;
        debug!(
            snapshot = %self.snapshot_id,
            files = header.summary.files,
            errors = self.errors.len(),
            "finalized snapshot"
        );
        Ok(header)
    }
}

/// A finalized snapshot opened for reading. Sections are fetched lazily
/// and cached.
pub struct Snapshot<'a> {
    repo: &'a Repository,
    header: Header,
    fs: Mutex<Option<Arc<Filesystem>>>,
    objects: Mutex<Option<Arc<BTreeMap<Checksum, Object>>>>,
    path_objects: Mutex<Option<Arc<BTreeMap<String, Checksum>>>>,
}

impl Repository {
    /// Fetch a snapshot header and verify its section references resolve.
    pub fn open_snapshot(&self, id: &SnapshotId) -> Result<Snapshot<'_>> {
        let header = self.get_header(id)?;
        for (name, checksum) in header.sections() {
            if !checksum.is_zero() && !self.has_blob(&checksum)? {
                return Err(CairnError::corruption(
                    format!("snapshot {id}"),
                    format!("section '{name}' does not resolve"),
                ));
            }
        }
        Ok(Snapshot {
            repo: self,
            header,
            fs: Mutex::new(None),
            objects: Mutex::new(None),
            path_objects: Mutex::new(None),
        })
    }
}

impl Snapshot<'_> {
    pub fn id(&self) -> SnapshotId {
        self.header.snapshot_id
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    fn context(&self) -> String {
        format!("snapshot {}", self.header.snapshot_id)
    }

    /// The VFS index, loaded on first use.
    pub fn filesystem(&self) -> Result<Arc<Filesystem>> {
        let mut slot = self.fs.lock().unwrap();
        if let Some(fs) = slot.as_ref() {
            return Ok(Arc::clone(fs));
        }
        let bytes = self.repo.read_blob(&self.header.root, &self.context())?;
        let fs = Arc::new(Filesystem::deserialize(&bytes)?);
        *slot = Some(Arc::clone(&fs));
        Ok(fs)
    }

    fn object_table(&self) -> Result<Arc<BTreeMap<Checksum, Object>>> {
        let mut slot = self.objects.lock().unwrap();
        if let Some(table) = slot.as_ref() {
            return Ok(Arc::clone(table));
        }
        let bytes = self.repo.read_blob(&self.header.index, &self.context())?;
        let table: BTreeMap<Checksum, Object> = rmp_serde::from_slice(&bytes)?;
        let table = Arc::new(table);
        *slot = Some(Arc::clone(&table));
        Ok(table)
    }

    fn path_object_table(&self) -> Result<Arc<BTreeMap<String, Checksum>>> {
        let mut slot = self.path_objects.lock().unwrap();
        if let Some(table) = slot.as_ref() {
            return Ok(Arc::clone(table));
        }
        let bytes = self
            .repo
            .read_blob(&self.header.metadata, &self.context())?;
        let table: BTreeMap<String, Checksum> = rmp_serde::from_slice(&bytes)?;
        let table = Arc::new(table);
        *slot = Some(Arc::clone(&table));
        Ok(table)
    }

    /// Sorted pathnames of every regular file in the snapshot.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut files = self.filesystem()?.list_files();
        files.sort();
        Ok(files)
    }

    /// Per-path errors recorded during the backup, if any.
    pub fn errors(&self) -> Result<Vec<SnapshotError>> {
        if self.header.errors.is_zero() {
            return Ok(Vec::new());
        }
        let bytes = self.repo.read_blob(&self.header.errors, &self.context())?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    pub fn statistics(&self) -> Result<Statistics> {
        let bytes = self
            .repo
            .read_blob(&self.header.statistics, &self.context())?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Reassemble one file's content, verifying every chunk digest.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = clean_path(path);
        let object_checksum = *self
            .path_object_table()?
            .get(&path)
            .ok_or_else(|| CairnError::NotFound(path.clone()))?;
        let table = self.object_table()?;
        let object = table
            .get(&object_checksum)
            .ok_or_else(|| CairnError::corruption(&path, "object missing from index section"))?;

        let mut content = Vec::with_capacity(object.size() as usize);
        for chunk_ref in &object.chunks {
            let data = self.repo.read_chunk(&chunk_ref.checksum, &path)?;
            if data.len() != chunk_ref.size as usize {
                return Err(CairnError::corruption(
                    &path,
                    format!(
                        "chunk size mismatch: expected {}, got {}",
                        chunk_ref.size,
                        data.len()
                    ),
                ));
            }
            content.extend_from_slice(&data);
        }
        Ok(content)
    }

    /// Materialize the snapshot's tree under `dest`.
    pub fn restore_to(&self, dest: &Path) -> Result<()> {
        let fs = self.filesystem()?;

        let mut directories = fs.list_directories();
        directories.sort();
        for dir in &directories {
            let target = join_restored(dest, dir);
            std::fs::create_dir_all(&target)?;
        }

        let mut files = fs.list_files();
        files.sort();
        for file in &files {
            let content = self.read_file(file)?;
            let target = join_restored(dest, file);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &content)?;
        }

        for path in fs.list_non_regular() {
            if let Some(link_target) = fs.symlink_target(&path) {
                let target = join_restored(dest, &path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&link_target, &target)?;
            }
        }
        Ok(())
    }
}

fn join_restored(dest: &Path, pathname: &str) -> std::path::PathBuf {
    dest.join(pathname.trim_start_matches('/'))
}

/// What `check` verifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Structural references only: sections, object entries, locations,
    /// packfile existence.
    Fast,
    /// Everything Fast does, plus re-reading every referenced chunk,
    /// decoding it, and recomputing its digest.
    Full,
}

#[derive(Debug, Clone)]
pub struct CheckIssue {
    pub path: String,
    pub message: String,
}

#[derive(Debug)]
pub struct CheckReport {
    pub mode: CheckMode,
    pub chunks_checked: usize,
    pub chunks_verified: usize,
    pub issues: Vec<CheckIssue>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.issues.is_empty()
    }
}

impl Repository {
    /// Verify a snapshot's integrity. Per-blob failures are collected into
    /// the report; the sweep continues across remaining paths.
    pub fn check(&self, id: &SnapshotId, mode: CheckMode) -> Result<CheckReport> {
        let header = self.get_header(id)?;
        let mut report = CheckReport {
            mode,
            chunks_checked: 0,
            chunks_verified: 0,
            issues: Vec::new(),
        };

        for (name, checksum) in header.sections() {
            if !checksum.is_zero() && !self.has_blob(&checksum)? {
                report.issues.push(CheckIssue {
                    path: format!("<section:{name}>"),
                    message: format!("section digest {checksum} does not resolve"),
                });
            }
        }

        let context = format!("snapshot {id}");
        let path_objects: BTreeMap<String, Checksum> =
            match self.read_blob(&header.metadata, &context) {
                Ok(bytes) => rmp_serde::from_slice(&bytes)?,
                Err(e) => {
                    report.issues.push(CheckIssue {
                        path: "<section:metadata>".into(),
                        message: e.to_string(),
                    });
                    return Ok(report);
                }
            };
        let objects: BTreeMap<Checksum, Object> = match self.read_blob(&header.index, &context) {
            Ok(bytes) => rmp_serde::from_slice(&bytes)?,
            Err(e) => {
                report.issues.push(CheckIssue {
                    path: "<section:index>".into(),
                    message: e.to_string(),
                });
                return Ok(report);
            }
        };

        let mut seen_packfiles: std::collections::HashMap<Checksum, bool> =
            std::collections::HashMap::new();

        for (path, object_checksum) in &path_objects {
            let Some(object) = objects.get(object_checksum) else {
                report.issues.push(CheckIssue {
                    path: path.clone(),
                    message: format!("object {object_checksum} missing from index section"),
                });
                continue;
            };

            for chunk_ref in &object.chunks {
                report.chunks_checked += 1;
                let Some(location) = self.lookup_location(&chunk_ref.checksum) else {
                    report.issues.push(CheckIssue {
                        path: path.clone(),
                        message: format!("chunk {} has no committed location", chunk_ref.checksum),
                    });
                    continue;
                };

                let packfile_present = match seen_packfiles.entry(location.packfile) {
                    std::collections::hash_map::Entry::Occupied(entry) => *entry.get(),
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let key = Namespace::Packfile.key(&location.packfile);
                        let present =
                            with_retry("packfile exists", || self.storage().exists(&key))?;
                        *entry.insert(present)
                    }
                };
                if !packfile_present {
                    report.issues.push(CheckIssue {
                        path: path.clone(),
                        message: format!("packfile {} is missing", location.packfile),
                    });
                    continue;
                }

                if mode == CheckMode::Full {
                    match self.read_chunk_at(&chunk_ref.checksum, &location, path) {
                        Ok(_) => report.chunks_verified += 1,
                        Err(e) => report.issues.push(CheckIssue {
                            path: path.clone(),
                            message: e.to_string(),
                        }),
                    }
                }
            }
        }

        Ok(report)
    }
}
