//! Integration tests for deploy-marker parsing, startup scanning and
//! the live builds-directory watcher.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use game_warden::registry::{watcher, BuildRegistry};

use super::support::wait_until;

fn deploy(dir: &std::path::Path, name: &str, marker: &str) -> std::path::PathBuf {
    let deploy_dir = dir.join(name);
    fs::create_dir_all(&deploy_dir).expect("deploy dir");
    fs::write(deploy_dir.join("world.pack"), b"compiled world").expect("entrypoint");
    fs::write(deploy_dir.join(watcher::DEPLOY_MARKER), marker).expect("marker");
    deploy_dir
}

// ── Marker parsing ───────────────────────────────────────────

#[test]
fn marker_with_explicit_id_is_honored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let deploy_dir = deploy(dir.path(), "a", "world.pack\nrelease-42\n");

    let build = watcher::read_deploy_marker(&deploy_dir)
        .expect("parse")
        .expect("build");
    assert_eq!(build.id, "release-42");
    assert_eq!(build.entrypoint, std::path::PathBuf::from("world.pack"));
    assert_eq!(build.directory, deploy_dir);
}

#[test]
fn marker_without_id_derives_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let deploy_dir = deploy(dir.path(), "a", "world.pack\n");

    let build = watcher::read_deploy_marker(&deploy_dir)
        .expect("parse")
        .expect("build");
    assert_eq!(build.id.len(), 16);
    assert!(build.id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn directory_without_marker_is_not_a_deploy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plain = dir.path().join("scratch");
    fs::create_dir_all(&plain).expect("dir");

    assert!(watcher::read_deploy_marker(&plain).expect("parse").is_none());
}

#[test]
fn empty_marker_is_malformed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let deploy_dir = deploy(dir.path(), "a", "\n");

    assert!(watcher::read_deploy_marker(&deploy_dir).is_err());
}

// ── Startup scan ─────────────────────────────────────────────

#[test]
fn load_from_dir_seeds_completed_deploys() {
    let dir = tempfile::tempdir().expect("tempdir");
    deploy(dir.path(), "one", "world.pack\nbuild-one\n");
    deploy(dir.path(), "two", "world.pack\nbuild-two\n");
    // An in-progress deploy without a marker is skipped.
    fs::create_dir_all(dir.path().join("three")).expect("dir");

    let registry = BuildRegistry::load_from_dir(dir.path()).expect("load");
    assert_eq!(registry.len(), 2);
    assert!(registry.latest_id().is_some());
}

#[test]
fn load_from_missing_dir_is_fatal() {
    let result = BuildRegistry::load_from_dir(std::path::Path::new("/nonexistent/builds"));
    assert!(result.is_err());
}

// ── Live watching ────────────────────────────────────────────

#[tokio::test]
async fn watcher_installs_deploys_as_they_complete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(BuildRegistry::new());

    let _watcher =
        watcher::DeployWatcher::start(dir.path(), Arc::clone(&registry)).expect("watcher");

    // Deploy lands after the watcher is up; the marker is written last.
    let deploy_dir = dir.path().join("fresh");
    fs::create_dir_all(&deploy_dir).expect("deploy dir");
    fs::write(deploy_dir.join("world.pack"), b"compiled world").expect("entrypoint");
    fs::write(
        deploy_dir.join(watcher::DEPLOY_MARKER),
        "world.pack\nfresh-build\n",
    )
    .expect("marker");

    let installed = wait_until(
        || registry.latest_id().as_deref() == Some("fresh-build"),
        Duration::from_secs(10),
    )
    .await;
    assert!(installed, "watcher must install the completed deploy");
    assert_eq!(registry.reference_count("fresh-build"), Some(0));
}
