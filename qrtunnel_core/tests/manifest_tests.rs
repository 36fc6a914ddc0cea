use qrtunnel_core::{Manifest, ShareError};
use std::fs;

#[test]
fn test_entries_follow_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let b = dir.path().join("b.txt");
    let a = dir.path().join("a.txt");
    fs::write(&b, vec![b'b'; 30]).unwrap();
    fs::write(&a, vec![b'a'; 12]).unwrap();

    let manifest = Manifest::build(&[&b, &a]).expect("valid manifest");

    let names: Vec<&str> = manifest.iter().map(|e| e.display_name.as_str()).collect();
    assert_eq!(names, vec!["b.txt", "a.txt"]);
    assert_eq!(manifest.get("a.txt").unwrap().size_bytes, 12);
    assert_eq!(manifest.get("b.txt").unwrap().size_bytes, 30);
    assert_eq!(manifest.total_size(), 42);
    assert!(manifest.iter().all(|e| e.absolute_path.is_absolute()));
}

#[test]
fn test_same_base_name_gets_unique_display_names() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("one");
    let second = dir.path().join("two");
    fs::create_dir_all(&first).unwrap();
    fs::create_dir_all(&second).unwrap();
    fs::write(first.join("notes.txt"), b"first").unwrap();
    fs::write(second.join("notes.txt"), b"second").unwrap();

    let manifest =
        Manifest::build(&[first.join("notes.txt"), second.join("notes.txt")]).unwrap();

    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest.entries()[0].display_name, "notes.txt");
    assert_eq!(manifest.entries()[1].display_name, "notes (1).txt");
}

#[test]
fn test_directory_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("ok.txt");
    fs::write(&file, b"ok").unwrap();

    let result = Manifest::build(&[file, dir.path().to_path_buf()]);
    match result {
        Err(ShareError::InvalidPath { reason, .. }) => assert!(reason.contains("directory")),
        other => panic!("expected InvalidPath, got {:?}", other),
    }
}

#[test]
fn test_missing_file_fails_whole_build() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("ok.txt");
    fs::write(&file, b"ok").unwrap();

    let result = Manifest::build(&[file, dir.path().join("missing.txt")]);
    let err = result.unwrap_err();
    assert!(matches!(err, ShareError::InvalidPath { .. }));
    assert_eq!(err.exit_code(), qrtunnel_core::exit_code::INVALID_INPUT);
}

#[test]
fn test_empty_file_is_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("empty.bin");
    fs::write(&file, b"").unwrap();

    let manifest = Manifest::build(&[file]).unwrap();
    assert_eq!(manifest.entries()[0].size_bytes, 0);
}

#[cfg(unix)]
#[test]
fn test_symlink_is_listed_under_link_name() {
    let dir = tempfile::tempdir().unwrap();
    let blob = dir.path().join("blob-7f3a9c");
    let link = dir.path().join("report.pdf");
    fs::write(&blob, b"%PDF-1.7").unwrap();
    std::os::unix::fs::symlink(&blob, &link).unwrap();

    let manifest = Manifest::build(&[&link]).unwrap();

    let entry = &manifest.entries()[0];
    assert_eq!(entry.display_name, "report.pdf");
    assert_eq!(entry.absolute_path, blob.canonicalize().unwrap());
    assert_eq!(entry.size_bytes, 8);
}
