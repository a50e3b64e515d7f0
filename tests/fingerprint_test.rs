//! Integration tests for content fingerprinting

mod common;

use common::TestProject;
use plz::core::fingerprint::{artifact_fingerprint, hash_file, FileSetFingerprint, EMPTY_FILE_HASH};
use plz::error::FingerprintError;

#[test]
fn test_directory_fingerprint_covers_nested_files() {
    let project = TestProject::new();
    project.create_file("src/handler.py", "def handler(): pass\n");
    project.create_file("src/lib/util.py", "X = 1\n");
    project.create_file("src/lib/empty.py", "");

    let fingerprint = FileSetFingerprint::compute(&[project.path().join("src")]).unwrap();

    assert_eq!(fingerprint.len(), 3);
    let empty = project.path().join("src/lib/empty.py");
    assert_eq!(fingerprint.get(&empty.display().to_string()), Some(EMPTY_FILE_HASH));
}

#[test]
fn test_fingerprint_changes_with_content_only() {
    let project = TestProject::new();
    project.create_file("requirements.txt", "six==1.16.0\n");
    let paths = [project.path().join("requirements.txt")];

    let first = FileSetFingerprint::compute(&paths).unwrap();
    let again = FileSetFingerprint::compute(&paths).unwrap();
    assert_eq!(first, again);

    project.create_file("requirements.txt", "six==1.15.0\n");
    let changed = FileSetFingerprint::compute(&paths).unwrap();
    assert_ne!(first, changed);
}

#[test]
fn test_missing_input_is_an_error() {
    let project = TestProject::new();
    let err = FileSetFingerprint::compute(&[project.path().join("nope.py")]).unwrap_err();
    assert!(matches!(err, FingerprintError::Io { .. }));
}

#[test]
fn test_artifact_fingerprint_matches_file_hash() {
    let project = TestProject::new();
    let artifact = project.path().join("build/package.zip");
    assert_eq!(artifact_fingerprint(&artifact).unwrap(), None);

    project.create_file("build/package.zip", "zip bytes");
    assert_eq!(
        artifact_fingerprint(&artifact).unwrap(),
        Some(hash_file(&artifact).unwrap())
    );
}
