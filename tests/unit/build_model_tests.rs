//! Unit tests for build metadata.

use std::path::PathBuf;

use game_warden::models::build::Build;

#[test]
fn derive_id_is_deterministic() {
    assert_eq!(Build::derive_id(b"manifest"), Build::derive_id(b"manifest"));
}

#[test]
fn derive_id_distinguishes_manifests() {
    assert_ne!(Build::derive_id(b"alpha"), Build::derive_id(b"beta"));
}

#[test]
fn derive_id_is_short_hex() {
    let id = Build::derive_id(b"anything");
    assert_eq!(id.len(), 16);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn entrypoint_path_joins_relative_entrypoints() {
    let build = Build::new(
        "a".into(),
        PathBuf::from("/srv/builds/a"),
        PathBuf::from("world.pack"),
    );
    assert_eq!(
        build.entrypoint_path(),
        PathBuf::from("/srv/builds/a/world.pack")
    );
}

#[test]
fn entrypoint_path_keeps_absolute_entrypoints() {
    let build = Build::new(
        "a".into(),
        PathBuf::from("/srv/builds/a"),
        PathBuf::from("/opt/shared/world.pack"),
    );
    assert_eq!(
        build.entrypoint_path(),
        PathBuf::from("/opt/shared/world.pack")
    );
}

#[test]
fn exists_reflects_directory_presence() {
    let missing = Build::new(
        "a".into(),
        PathBuf::from("/nonexistent/builds/a"),
        PathBuf::from("world.pack"),
    );
    assert!(!missing.exists());

    let dir = tempfile::tempdir().expect("tempdir");
    let present = Build::new(
        "b".into(),
        dir.path().to_path_buf(),
        PathBuf::from("world.pack"),
    );
    assert!(present.exists());
}
