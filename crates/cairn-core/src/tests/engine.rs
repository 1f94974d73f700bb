use std::io::Cursor;

use crate::error::CairnError;
use crate::repository::Repository;
use crate::snapshot::{CheckMode, FinalizeOptions};
use crate::testutil::{pseudo_random, test_config, test_repo_encrypted, test_repo_plaintext};
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

fn dir_info(name: &str, ino: u64) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size: 4096,
        mode: S_IFDIR | 0o755,
        mod_time: 0,
        dev: 1,
        ino,
        uid: 0,
        gid: 0,
    }
}

#[test]
fn create_twice_fails() {
    let (backend, _repo) = test_repo_plaintext();
    let result = Repository::init(Box::new(backend), test_config(), None);
    assert!(matches!(result, Err(CairnError::AlreadyExists(_))));
}

#[test]
fn open_missing_repository_fails() {
    let backend = crate::testutil::MemoryBackend::new();
    let result = Repository::open_with(Box::new(backend), None);
    assert!(matches!(result, Err(CairnError::NotFound(_))));
}

#[test]
fn wrong_passphrase_rejected_before_any_blob_read() {
    let (backend, repo) = test_repo_encrypted(b"hunter2");
    drop(repo);
    let result = Repository::open_with(Box::new(backend), Some(b"wrong"));
    assert!(matches!(result, Err(CairnError::BadPassphrase)));
}

#[test]
fn missing_passphrase_rejected() {
    let (backend, repo) = test_repo_encrypted(b"hunter2");
    drop(repo);
    let result = Repository::open_with(Box::new(backend), None);
    assert!(matches!(result, Err(CairnError::Config(_))));
}

#[test]
fn roundtrip_single_file_encrypted() {
    let (backend, repo) = test_repo_encrypted(b"hunter2");
    let content = vec![0xAA; 3 * 1024 * 1024];

    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &dir_info("/", 1));
    writer
        .put_file("/f", &file_info("f", content.len() as u64, 2), Cursor::new(&content))
        .unwrap();
    let header = writer.finalize(FinalizeOptions::default()).unwrap();
    let snapshot_id = header.snapshot_id;

    assert_eq!(header.summary.files, 1);
    assert_eq!(header.summary.directories, 1);
    assert!(!header.root.is_zero());
    assert!(header.errors.is_zero());

    // Re-open from stored bytes, as a fresh process would.
    let repo = Repository::open_with(Box::new(backend), Some(b"hunter2")).unwrap();
    let ids = repo.list_snapshots().unwrap();
    assert_eq!(ids, vec![snapshot_id]);

    let snapshot = repo.open_snapshot(&snapshot_id).unwrap();
    assert_eq!(snapshot.list_files().unwrap(), vec!["/f"]);

    let restored = snapshot.read_file("/f").unwrap();
    assert_eq!(restored, content);

    // With bounds 256/1024/4096 a 3 MiB uniform file chunks within limits.
    let stats = snapshot.statistics().unwrap();
    assert!(stats.chunks >= 1);
    assert_eq!(stats.objects, 1);
    assert_eq!(stats.source_bytes, content.len() as u64);

    let report = repo.check(&snapshot_id, CheckMode::Full).unwrap();
    assert!(report.ok(), "unexpected issues: {:?}", report.issues);
    assert_eq!(report.chunks_verified, report.chunks_checked);
}

#[test]
fn empty_file_yields_empty_object() {
    let (_backend, repo) = test_repo_plaintext();
    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &dir_info("/", 1));
    writer
        .put_file("/empty", &file_info("empty", 0, 2), Cursor::new(Vec::new()))
        .unwrap();
    let header = writer.finalize(FinalizeOptions::default()).unwrap();

    let snapshot = repo.open_snapshot(&header.snapshot_id).unwrap();
    assert_eq!(snapshot.read_file("/empty").unwrap(), Vec::<u8>::new());
    let stats = snapshot.statistics().unwrap();
    assert_eq!(stats.chunks, 0);
    assert_eq!(stats.objects, 1);
}

#[test]
fn snapshot_id_is_stable_across_reserialization() {
    let (backend, repo) = test_repo_plaintext();
    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &dir_info("/", 1));
    writer
        .put_file("/f", &file_info("f", 4, 2), Cursor::new(b"data".to_vec()))
        .unwrap();
    let header = writer.finalize(FinalizeOptions::default()).unwrap();

    let repo = Repository::open_with(Box::new(backend), None).unwrap();
    let reread = repo.get_header(&header.snapshot_id).unwrap();
    assert_eq!(reread.snapshot_id, header.snapshot_id);

    let reserialized = reread.serialize().unwrap();
    let again = crate::snapshot::header::Header::deserialize(&reserialized).unwrap();
    assert_eq!(again.snapshot_id, header.snapshot_id);
}

#[test]
fn delete_snapshot_removes_header_and_reclaims_packfiles() {
    let (backend, repo) = test_repo_plaintext();
    let content = pseudo_random(64 * 1024, 0xBEEF);

    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &dir_info("/", 1));
    writer
        .put_file("/f", &file_info("f", content.len() as u64, 2), Cursor::new(&content))
        .unwrap();
    let header = writer.finalize(FinalizeOptions::default()).unwrap();

    assert!(backend.key_count("PACKFILE/") > 0);
    assert_eq!(backend.key_count("STATE/"), 1);

    repo.delete_snapshot(&header.snapshot_id).unwrap();
    assert!(repo.list_snapshots().unwrap().is_empty());
    assert_eq!(backend.key_count("STATE/"), 0);
    assert_eq!(backend.key_count("PACKFILE/"), 0);

    assert!(matches!(
        repo.delete_snapshot(&header.snapshot_id),
        Err(CairnError::SnapshotNotFound(_))
    ));
}

#[test]
fn delete_keeps_packfiles_shared_with_other_snapshots() {
    let (backend, repo) = test_repo_plaintext();
    let content = pseudo_random(32 * 1024, 0xCAFE);

    let mut first = repo.begin_snapshot();
    first.put_directory("/", &dir_info("/", 1));
    first
        .put_file("/a", &file_info("a", content.len() as u64, 2), Cursor::new(&content))
        .unwrap();
    let first_header = first.finalize(FinalizeOptions::default()).unwrap();

    let mut second = repo.begin_snapshot();
    second.put_directory("/", &dir_info("/", 1));
    second
        .put_file("/a", &file_info("a", content.len() as u64, 2), Cursor::new(&content))
        .unwrap();
    let second_header = second.finalize(FinalizeOptions::default()).unwrap();

    repo.delete_snapshot(&first_header.snapshot_id).unwrap();

    // The second snapshot still restores: shared packfiles survived.
    let snapshot = repo.open_snapshot(&second_header.snapshot_id).unwrap();
    assert_eq!(snapshot.read_file("/a").unwrap(), content);
    assert!(backend.key_count("PACKFILE/") > 0);
}

#[test]
fn finalize_records_context_and_tags() {
    let (_backend, repo) = test_repo_plaintext();
    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &dir_info("/", 1));
    let header = writer
        .finalize(FinalizeOptions {
            category: Some("nightly".into()),
            tags: vec!["prod".into(), "eu".into()],
            context: vec![("hostname".into(), "builder-1".into())],
            ..FinalizeOptions::default()
        })
        .unwrap();

    assert_eq!(header.category, "nightly");
    assert_eq!(header.tags, vec!["prod", "eu"]);
    assert_eq!(header.get_context("hostname"), "builder-1");
    assert_eq!(header.get_context("engine.version"), env!("CARGO_PKG_VERSION"));
}

#[test]
fn errors_section_survives_roundtrip() {
    let (_backend, repo) = test_repo_plaintext();
    let mut writer = repo.begin_snapshot();
    writer.put_directory("/", &dir_info("/", 1));
    writer
        .put_file("/ok", &file_info("ok", 2, 2), Cursor::new(b"ok".to_vec()))
        .unwrap();
    writer.record_error("/broken", "permission denied");
    let header = writer.finalize(FinalizeOptions::default()).unwrap();

    assert!(!header.errors.is_zero());
    let snapshot = repo.open_snapshot(&header.snapshot_id).unwrap();
    let errors = snapshot.errors().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, "/broken");

    // The snapshot still committed what was readable.
    assert_eq!(snapshot.read_file("/ok").unwrap(), b"ok");
}
