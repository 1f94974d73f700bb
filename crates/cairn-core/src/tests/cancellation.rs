use std::io::Cursor;

use crate::error::CairnError;
use crate::repository::Repository;
use crate::snapshot::{CheckMode, FinalizeOptions};
use crate::testutil::{pseudo_random, test_repo_plaintext};
use crate::vfs::entry::{FileInfo, S_IFDIR, S_IFREG};

fn file_info(name: &str, size: u64, ino: u64) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size,
        mode: S_IFREG | 0o644,
        mod_time: 0,
        dev: 1,
        ino,
        uid: 0,
        gid: 0,
    }
}

fn root_info() -> FileInfo {
    FileInfo {
        name: "/".to_string(),
        size: 4096,
        mode: S_IFDIR | 0o755,
        mod_time: 0,
        dev: 1,
        ino: 1,
        uid: 0,
        gid: 0,
    }
}

#[test]
fn cancelled_writer_rejects_further_work() {
    let (_backend, repo) = test_repo_plaintext();
    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &root_info());

    writer.cancel_token().cancel();

    let content = pseudo_random(64 * 1024, 0x11);
    let result = writer.put_file(
        "/f",
        &file_info("f", content.len() as u64, 2),
        Cursor::new(&content),
    );
    assert!(matches!(result, Err(CairnError::Cancelled)));
}

#[test]
fn cancelled_finalize_commits_nothing() {
    let (backend, repo) = test_repo_plaintext();
    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &root_info());
    let content = pseudo_random(256 * 1024, 0x22);
    writer
        .put_file("/f", &file_info("f", content.len() as u64, 2), Cursor::new(&content))
        .unwrap();

    writer.cancel_token().cancel();
    assert!(matches!(
        writer.finalize(FinalizeOptions::default()),
        Err(CairnError::Cancelled)
    ));

    // No header, no state: the cancelled snapshot never became visible.
    assert!(repo.list_snapshots().unwrap().is_empty());
    assert_eq!(backend.key_count("SNAPSHOT/"), 0);
    assert_eq!(backend.key_count("STATE/"), 0);
}

#[test]
fn repository_reopens_cleanly_after_cancellation() {
    let (backend, repo) = test_repo_plaintext();

    // Abort one snapshot mid-build.
    let mut aborted = repo.begin_snapshot();
    aborted.put_directory("/", &root_info());
    let content = pseudo_random(512 * 1024, 0x33);
    aborted
        .put_file("/big", &file_info("big", content.len() as u64, 2), Cursor::new(&content))
        .unwrap();
    aborted.cancel_token().cancel();
    assert!(aborted.finalize(FinalizeOptions::default()).is_err());
    drop(repo);

    // Re-open over the same bytes and take a snapshot that succeeds.
    let repo = Repository::open_with(Box::new(backend), None).unwrap();
    assert!(repo.list_snapshots().unwrap().is_empty());

    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &root_info());
    writer
        .put_file("/ok", &file_info("ok", content.len() as u64, 3), Cursor::new(&content))
        .unwrap();
    let header = writer.finalize(FinalizeOptions::default()).unwrap();

    assert_eq!(repo.list_snapshots().unwrap(), vec![header.snapshot_id]);
    let report = repo.check(&header.snapshot_id, CheckMode::Fast).unwrap();
    assert!(report.ok(), "unexpected issues: {:?}", report.issues);
}
