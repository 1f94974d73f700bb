//! Parallel backup pipeline: a walker thread feeds a bounded work channel,
//! chunk/encode workers feed a bounded result channel, and a sequential
//! committer drains results through a reorder buffer so commits happen in
//! walk order. Backpressure comes from channel capacity; the cancellation
//! token is observed at every send/receive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use cairn_types::checksum::Checksum;

use crate::chunker::ChunkStream;
use crate::error::{CairnError, Result};
use crate::repository::Repository;
use crate::snapshot::object::ChunkRef;
use crate::snapshot::{CancelToken, SnapshotWriter};
use crate::vfs::{clean_path, entry::FileInfo};

/// Default worker pool size: `8 x logical_cpus + 1`.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    8 * cpus + 1
}

enum WalkEntry {
    Directory {
        path: String,
        info: FileInfo,
    },
    Symlink {
        path: String,
        info: FileInfo,
        target: String,
    },
    File {
        path: String,
        abs: PathBuf,
        info: FileInfo,
    },
    /// Unreadable during the walk; carried through so the committer can
    /// record it in order.
    Unreadable {
        path: String,
        message: String,
    },
}

/// One chunk processed by a worker. `encoded` is `None` when the chunk is
/// already committed (dedup hit against the state index).
struct WorkerChunk {
    checksum: Checksum,
    size: u32,
    encoded: Option<Vec<u8>>,
}

enum Processed {
    Directory {
        path: String,
        info: FileInfo,
    },
    Symlink {
        path: String,
        info: FileInfo,
        target: String,
    },
    File {
        path: String,
        info: FileInfo,
        chunks: Vec<WorkerChunk>,
    },
    Skipped {
        path: String,
        message: String,
    },
}

enum PipelineResult {
    Ok(usize, Box<Processed>),
    Err(usize, CairnError),
}

/// Recursively walk `dir` in lexicographic order, sending entries tagged
/// with a sequence index.
fn walk(
    dir: &Path,
    cancel: &CancelToken,
    seq: &mut usize,
    tx: &crossbeam_channel::Sender<(usize, WalkEntry)>,
) -> std::result::Result<(), ()> {
    let logical = clean_path(&dir.to_string_lossy());
    if cancel.is_cancelled() {
        return Err(());
    }

    let send = |entry: WalkEntry, seq: &mut usize| -> std::result::Result<(), ()> {
        let idx = *seq;
        *seq += 1;
        tx.send((idx, entry)).map_err(|_| ())
    };

    let metadata = match std::fs::symlink_metadata(dir) {
        Ok(metadata) => metadata,
        Err(e) => {
            return send(
                WalkEntry::Unreadable {
                    path: logical,
                    message: e.to_string(),
                },
                seq,
            );
        }
    };
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    let info = FileInfo::from_metadata(&name, &metadata);

    if metadata.file_type().is_symlink() {
        return match std::fs::read_link(dir) {
            Ok(target) => send(
                WalkEntry::Symlink {
                    path: logical,
                    info,
                    target: target.to_string_lossy().into_owned(),
                },
                seq,
            ),
            Err(e) => send(
                WalkEntry::Unreadable {
                    path: logical,
                    message: e.to_string(),
                },
                seq,
            ),
        };
    }

    if metadata.is_dir() {
        send(
            WalkEntry::Directory {
                path: logical.clone(),
                info,
            },
            seq,
        )?;
        let mut entries: Vec<_> = match std::fs::read_dir(dir)
            .and_then(|iter| iter.collect::<std::io::Result<Vec<_>>>())
        {
            Ok(entries) => entries,
            Err(e) => {
                return send(
                    WalkEntry::Unreadable {
                        path: logical,
                        message: e.to_string(),
                    },
                    seq,
                );
            }
        };
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            walk(&entry.path(), cancel, seq, tx)?;
        }
        return Ok(());
    }

    send(
        WalkEntry::File {
            path: logical,
            abs: dir.to_path_buf(),
            info,
        },
        seq,
    )
}

/// Chunk and encode one file inside a worker. Dedup against committed
/// state happens here; dedup against this snapshot's own pending chunks is
/// the committer's job.
fn process_file(
    repo: &Repository,
    path: &str,
    abs: &Path,
    info: FileInfo,
    cancel: &CancelToken,
) -> Result<Processed> {
    let file = match std::fs::File::open(abs) {
        Ok(file) => file,
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            warn!(path, "skipping unreadable file: {e}");
            return Ok(Processed::Skipped {
                path: path.to_string(),
                message: e.to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let mut chunks = Vec::new();
    for chunk in ChunkStream::new(file, &repo.config().chunking) {
        cancel.check()?;
        let chunk = chunk?;
        let checksum = repo.checksum(&chunk.data);
        let encoded = if repo.has_location(&checksum) {
            None
        } else {
            Some(repo.encode_blob(&chunk.data)?)
        };
        chunks.push(WorkerChunk {
            checksum,
            size: chunk.data.len() as u32,
            encoded,
        });
    }
    Ok(Processed::File {
        path: path.to_string(),
        info,
        chunks,
    })
}

impl SnapshotWriter<'_> {
    /// Commit one worker-processed file: stage chunks this snapshot does
    /// not yet hold, then register the object and VFS entry.
    fn commit_worker_file(
        &mut self,
        path: &str,
        info: &FileInfo,
        chunks: Vec<WorkerChunk>,
    ) -> Result<()> {
        let mut refs = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            self.statistics.chunks += 1;
            self.statistics.source_bytes += chunk.size as u64;
            // Workers only dedup against committed state; pending chunks
            // of this same snapshot are deduped here, in commit order.
            if !self.adopt_or_miss(&chunk.checksum) {
                match chunk.encoded {
                    Some(encoded) => self.stage_encoded_chunk(chunk.checksum, encoded)?,
                    None => {
                        // The worker saw a committed location that the
                        // committer no longer finds. Single-writer rules
                        // make this unreachable; fail loudly if violated.
                        return Err(CairnError::Other(format!(
                            "chunk {} vanished between worker and commit",
                            chunk.checksum
                        )));
                    }
                }
            }
            refs.push(ChunkRef {
                checksum: chunk.checksum,
                size: chunk.size,
            });
        }
        self.finish_file(path, info, refs)
    }

    /// Walk a source tree with a parallel worker pool and commit the
    /// results in walk order. Cancelling leaves no committed state and no
    /// header behind; the repository stays consistent.
    pub fn scan_parallel(&mut self, source: &Path, num_workers: usize) -> Result<()> {
        debug_assert!(num_workers > 0, "num_workers must be non-zero");
        let source = source
            .canonicalize()
            .map_err(|e| CairnError::Io(std::io::Error::new(e.kind(), format!("{source:?}: {e}"))))?;

        let repo: &Repository = self.repository();
        let cancel = self.cancel_token();

        let work_cap = num_workers * 2;
        let result_cap = num_workers * 2;

        let mut outcome: Result<()> = Ok(());

        std::thread::scope(|scope| {
            let (work_tx, work_rx) = crossbeam_channel::bounded::<(usize, WalkEntry)>(work_cap);
            let (result_tx, result_rx) = crossbeam_channel::bounded::<PipelineResult>(result_cap);

            // Walker: emits entries in deterministic order.
            let walker_cancel = cancel.clone();
            scope.spawn(move || {
                let mut seq = 0usize;
                let _ = walk(&source, &walker_cancel, &mut seq, &work_tx);
                // work_tx drops here; workers drain and exit.
            });

            // Workers: chunk + digest + encode, off the commit thread.
            for _ in 0..num_workers {
                let rx = work_rx.clone();
                let tx = result_tx.clone();
                let worker_cancel = cancel.clone();
                scope.spawn(move || {
                    for (idx, entry) in rx {
                        let result = match entry {
                            WalkEntry::Directory { path, info } => {
                                Ok(Processed::Directory { path, info })
                            }
                            WalkEntry::Symlink { path, info, target } => {
                                Ok(Processed::Symlink { path, info, target })
                            }
                            WalkEntry::Unreadable { path, message } => {
                                Ok(Processed::Skipped { path, message })
                            }
                            WalkEntry::File { path, abs, info } => {
                                process_file(repo, &path, &abs, info, &worker_cancel)
                            }
                        };
                        let msg = match result {
                            Ok(processed) => PipelineResult::Ok(idx, Box::new(processed)),
                            Err(e) => PipelineResult::Err(idx, e),
                        };
                        if tx.send(msg).is_err() {
                            return; // committer gone
                        }
                    }
                });
            }
            drop(work_rx);
            drop(result_tx);

            // Committer: reorder by sequence index, apply sequentially.
            let mut next_expected = 0usize;
            let mut pending: BTreeMap<usize, std::result::Result<Processed, CairnError>> =
                BTreeMap::new();

            'recv: for msg in &result_rx {
                if cancel.is_cancelled() {
                    outcome = Err(CairnError::Cancelled);
                    break;
                }
                match msg {
                    PipelineResult::Ok(idx, processed) => {
                        pending.insert(idx, Ok(*processed));
                    }
                    PipelineResult::Err(idx, e) => {
                        pending.insert(idx, Err(e));
                    }
                }

                while let Some(result) = pending.remove(&next_expected) {
                    next_expected += 1;
                    let applied = result.and_then(|processed| self.apply(processed));
                    if let Err(e) = applied {
                        outcome = Err(e);
                        break 'recv;
                    }
                }
            }
            drop(result_rx); // unblock workers stuck on send

            if outcome.is_ok() && cancel.is_cancelled() {
                outcome = Err(CairnError::Cancelled);
            }
        });

        outcome
    }

    fn apply(&mut self, processed: Processed) -> Result<()> {
        match processed {
            Processed::Directory { path, info } => {
                self.put_directory(&path, &info);
                Ok(())
            }
            Processed::Symlink { path, info, target } => {
                self.put_symlink(&path, &info, &target);
                Ok(())
            }
            Processed::File { path, info, chunks } => {
                self.commit_worker_file(&path, &info, chunks)
            }
            Processed::Skipped { path, message } => {
                self.record_error(&path, &message);
                Ok(())
            }
        }
    }
}
