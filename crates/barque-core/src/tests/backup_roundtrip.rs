//! Directory backup semantics over an in-memory repository.

use std::fs;
use std::path::Path;

use crate::backup::create::{backup_dir, BaseIndex};
use crate::backup::entry::parse_manifest;
use crate::backup::restore::BackupReader;
use crate::commands;
use crate::error::BkError;
use crate::merkle::StreamReader;
use crate::report::Report;
use crate::testutil::mem_store;

const SPLIT_BITS: u32 = 10;

fn write_tree(root: &Path) {
    fs::create_dir_all(root.join("sub/inner")).unwrap();
    fs::write(root.join("alpha.txt"), b"alpha contents").unwrap();
    fs::write(root.join("sub/beta.bin"), vec![0xB5u8; 40 * 1024]).unwrap();
    fs::write(root.join("sub/inner/gamma"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("../alpha.txt", root.join("sub/link")).unwrap();
}

fn assert_trees_equal(a: &Path, b: &Path) {
    let mut names_a: Vec<_> = fs::read_dir(a)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    let mut names_b: Vec<_> = fs::read_dir(b)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    names_a.sort();
    names_b.sort();
    assert_eq!(names_a, names_b, "directory listings differ at {a:?}");

    for name in names_a {
        let pa = a.join(&name);
        let pb = b.join(&name);
        let ma = fs::symlink_metadata(&pa).unwrap();
        if ma.file_type().is_dir() {
            assert_trees_equal(&pa, &pb);
        } else if ma.file_type().is_symlink() {
            assert_eq!(
                fs::read_link(&pa).unwrap(),
                fs::read_link(&pb).unwrap(),
                "symlink target differs at {pa:?}"
            );
        } else {
            assert_eq!(
                fs::read(&pa).unwrap(),
                fs::read(&pb).unwrap(),
                "contents differ at {pa:?}"
            );
        }
    }
}

#[test]
fn backup_restore_roundtrip() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path());

    let mut store = mem_store();
    let report = Report::new();
    let (root, stats) =
        backup_dir(&mut store, source.path(), SPLIT_BITS, None, &report).unwrap();
    store.sync().unwrap();
    assert_eq!(report.error_count(), 0);
    assert_eq!(stats.files, 3);
    assert_eq!(stats.dirs, 2);

    let dest = tempfile::tempdir().unwrap();
    let out = dest.path().join("restored");
    BackupReader::new(&mut store, root)
        .restore(&out, &report)
        .unwrap();
    assert_eq!(report.error_count(), 0);
    assert_trees_equal(source.path(), &out);
}

#[test]
fn empty_dir_manifest_has_zero_entries() {
    let source = tempfile::tempdir().unwrap();
    let mut store = mem_store();
    let report = Report::new();
    let (root, _) = backup_dir(&mut store, source.path(), SPLIT_BITS, None, &report).unwrap();

    let manifest = StreamReader::new(&mut store, root).read_all().unwrap();
    assert!(parse_manifest(&manifest).unwrap().is_empty());

    let dest = tempfile::tempdir().unwrap();
    let out = dest.path().join("restored");
    BackupReader::new(&mut store, root)
        .restore(&out, &report)
        .unwrap();
    assert!(fs::read_dir(&out).unwrap().next().is_none());
}

#[test]
fn restore_refuses_nonempty_target() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path());
    let mut store = mem_store();
    let report = Report::new();
    let (root, _) = backup_dir(&mut store, source.path(), SPLIT_BITS, None, &report).unwrap();

    let dest = tempfile::tempdir().unwrap();
    fs::write(dest.path().join("occupied"), b"x").unwrap();
    let err = BackupReader::new(&mut store, root)
        .restore(dest.path(), &report)
        .unwrap_err();
    assert!(matches!(err, BkError::TargetExists(_)));
}

#[test]
fn repeated_backup_stores_nothing_new() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path());
    let mut store = mem_store();
    let report = Report::new();

    let (root_a, _) = backup_dir(&mut store, source.path(), SPLIT_BITS, None, &report).unwrap();
    let stored_before = store.stats().chunks_stored;
    let (root_b, _) = backup_dir(&mut store, source.path(), SPLIT_BITS, None, &report).unwrap();

    assert_eq!(root_a, root_b, "pure content addressing");
    assert_eq!(store.stats().chunks_stored, stored_before);
}

#[test]
fn base_snapshot_changes_performance_not_output() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path());
    let report = Report::new();

    // Plain backup in one repository.
    let mut store_plain = mem_store();
    let (root_plain, _) =
        backup_dir(&mut store_plain, source.path(), SPLIT_BITS, None, &report).unwrap();

    // Base-accelerated backup in another.
    let mut store_base = mem_store();
    let (first_root, _) =
        backup_dir(&mut store_base, source.path(), SPLIT_BITS, None, &report).unwrap();
    let base = BaseIndex::build(&mut store_base, first_root).unwrap();
    let (root_incr, stats) = backup_dir(
        &mut store_base,
        source.path(),
        SPLIT_BITS,
        Some(&base),
        &report,
    )
    .unwrap();

    assert!(stats.files_reused > 0, "base index must get hits");
    assert_eq!(root_incr, first_root);
    assert_eq!(root_incr, root_plain, "base affects performance, not output");
}

#[test]
fn modified_file_defeats_base_reuse() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path());
    let report = Report::new();

    let mut store = mem_store();
    let (first_root, _) = backup_dir(&mut store, source.path(), SPLIT_BITS, None, &report).unwrap();
    let base = BaseIndex::build(&mut store, first_root).unwrap();

    // Same length, different bytes, and a bumped mtime: must be re-read.
    fs::write(source.path().join("alpha.txt"), b"ALPHA CONTENTS").unwrap();
    let later = filetime::FileTime::from_unix_time(2_000_000_000, 0);
    filetime::set_file_mtime(source.path().join("alpha.txt"), later).unwrap();

    let (second_root, _) = backup_dir(
        &mut store,
        source.path(),
        SPLIT_BITS,
        Some(&base),
        &report,
    )
    .unwrap();
    assert_ne!(second_root, first_root);

    let dest = tempfile::tempdir().unwrap();
    let out = dest.path().join("restored");
    BackupReader::new(&mut store, second_root)
        .restore(&out, &report)
        .unwrap();
    assert_eq!(fs::read(out.join("alpha.txt")).unwrap(), b"ALPHA CONTENTS");
}

#[test]
fn duplicate_snapshot_name_is_refused() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path());
    let mut store = mem_store();
    let report = Report::new();

    commands::backup::run_with_timestamp(
        &mut store,
        "x",
        "20260801-120000",
        source.path(),
        SPLIT_BITS,
        None,
        &report,
    )
    .unwrap();
    let err = commands::backup::run_with_timestamp(
        &mut store,
        "x",
        "20260801-120000",
        source.path(),
        SPLIT_BITS,
        None,
        &report,
    )
    .unwrap_err();
    assert!(matches!(err, BkError::DuplicateName(_)));
}

#[test]
fn savebits_restorebits_identity() {
    let mut store = mem_store();
    let report = Report::new();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();

    let full_name = commands::savebits::run_with_timestamp(
        &mut store,
        "stream",
        "20260801-120000",
        SPLIT_BITS,
        &mut payload.as_slice(),
        &report,
    )
    .unwrap();
    assert_eq!(full_name, "stream-20260801-120000");

    let mut out = Vec::new();
    let copied = commands::restorebits::run(&mut store, &full_name, &mut out).unwrap();
    assert_eq!(copied, payload.len() as u64);
    assert_eq!(out, payload);
}

#[test]
fn list_groups_names_by_kind() {
    let source = tempfile::tempdir().unwrap();
    let mut store = mem_store();
    let report = Report::new();

    commands::backup::run_with_timestamp(
        &mut store,
        "home",
        "20260801-120000",
        source.path(),
        SPLIT_BITS,
        None,
        &report,
    )
    .unwrap();
    commands::savebits::run_with_timestamp(
        &mut store,
        "tarball",
        "20260801-120001",
        SPLIT_BITS,
        &mut &b"stream bytes"[..],
        &report,
    )
    .unwrap();

    let listing = commands::list::run(&mut store).unwrap();
    assert_eq!(listing.backups, vec!["home-20260801-120000".to_string()]);
    assert_eq!(listing.bits, vec!["tarball-20260801-120001".to_string()]);
}

#[test]
fn fsck_covers_all_names() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path());
    let mut store = mem_store();
    let report = Report::new();

    commands::backup::run_with_timestamp(
        &mut store,
        "home",
        "20260801-120000",
        source.path(),
        SPLIT_BITS,
        None,
        &report,
    )
    .unwrap();
    commands::savebits::run_with_timestamp(
        &mut store,
        "tarball",
        "20260801-120001",
        SPLIT_BITS,
        &mut &b"opaque stream"[..],
        &report,
    )
    .unwrap();

    let totals = commands::fsck::run(&mut store, &report).unwrap();
    assert_eq!(report.error_count(), 0);
    assert_eq!(totals.names_checked, 2);
    assert!(totals.chunks_checked > 0);
    assert!(totals.bytes_verified > 0);
}

#[test]
fn missing_name_is_not_found() {
    let mut store = mem_store();
    let report = Report::new();
    let dest = tempfile::tempdir().unwrap();
    let err = commands::restore::run(&mut store, "nope-20260101-000000", dest.path(), &report)
        .unwrap_err();
    assert!(matches!(err, BkError::NotFound(_)));

    let mut sink = Vec::new();
    let err = commands::restorebits::run(&mut store, "nope-20260101-000000", &mut sink).unwrap_err();
    assert!(matches!(err, BkError::NotFound(_)));
}
