//! Unit tests for build registry reference counting and deletion rules.

use std::path::PathBuf;
use std::sync::Arc;

use game_warden::models::build::Build;
use game_warden::registry::BuildRegistry;

fn build(id: &str) -> Build {
    Build::new(
        id.to_owned(),
        PathBuf::from(format!("/nonexistent/builds/{id}")),
        PathBuf::from("world.pack"),
    )
}

// ── Install and latest pointer ───────────────────────────────

#[test]
fn install_sets_latest() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));
    assert_eq!(registry.latest_id().as_deref(), Some("a"));

    registry.install(build("b"));
    assert_eq!(registry.latest_id().as_deref(), Some("b"));
}

#[test]
fn acquire_latest_without_installs_fails() {
    let registry = Arc::new(BuildRegistry::new());
    assert!(registry.acquire_latest(1).is_err());
}

// ── Reference counting ───────────────────────────────────────

#[test]
fn acquire_increments_by_requested_units() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));

    let handle = registry.acquire_latest(2).expect("acquire");
    assert_eq!(registry.reference_count("a"), Some(2));
    assert_eq!(handle.units_remaining(), 2);
}

#[test]
fn release_decrements_one_unit_per_call() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));

    let handle = registry.acquire_latest(2).expect("acquire");
    handle.release_unit();
    assert_eq!(registry.reference_count("a"), Some(1));
    assert_eq!(handle.units_remaining(), 1);

    handle.release_unit();
    assert_eq!(registry.reference_count("a"), Some(0));
}

#[test]
fn release_beyond_held_units_is_ignored() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));

    let handle = registry.acquire_latest(1).expect("acquire");
    handle.release_unit();
    handle.release_unit();
    assert_eq!(registry.reference_count("a"), Some(0));
}

#[test]
fn count_tracks_multiple_handles() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));

    let first = registry.acquire_latest(1).expect("acquire");
    let second = registry.acquire_latest(1).expect("acquire");
    assert_eq!(registry.reference_count("a"), Some(2));

    first.release_unit();
    second.release_unit();
    assert_eq!(registry.reference_count("a"), Some(0));
}

// ── Deletion eligibility ─────────────────────────────────────

#[test]
fn latest_build_survives_at_zero_references() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));

    let handle = registry.acquire_latest(1).expect("acquire");
    handle.release_unit();

    // Still latest: deletion-ineligible even at zero.
    assert_eq!(registry.reference_count("a"), Some(0));
    assert_eq!(registry.latest_id().as_deref(), Some("a"));
}

#[test]
fn superseded_unreferenced_build_is_deleted() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));
    registry.install(build("b"));

    // "a" was superseded with no holders — swept on install.
    assert_eq!(registry.reference_count("a"), None);
    assert_eq!(registry.reference_count("b"), Some(0));
    assert_eq!(registry.len(), 1);
}

#[test]
fn referenced_superseded_build_survives_until_release() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));
    let handle = registry.acquire_latest(1).expect("acquire");

    registry.install(build("b"));
    assert_eq!(registry.reference_count("a"), Some(1));

    handle.release_unit();
    assert_eq!(registry.reference_count("a"), None);
    assert_eq!(registry.latest_id().as_deref(), Some("b"));
}

#[test]
fn release_remaining_gives_back_every_unit() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));

    let handle = registry.acquire_latest(2).expect("acquire");
    registry.install(build("b"));
    handle.release_remaining();

    assert_eq!(handle.units_remaining(), 0);
    assert_eq!(registry.reference_count("a"), None);
}

// ── Targeted acquire ─────────────────────────────────────────

#[test]
fn acquire_by_id_hits_registered_builds_only() {
    let registry = Arc::new(BuildRegistry::new());
    registry.install(build("a"));

    assert!(registry.acquire("a", 1).is_some());
    assert!(registry.acquire("missing", 1).is_none());
}

// ── Newer-build notification ─────────────────────────────────

#[tokio::test]
async fn install_fires_newer_build_notification() {
    let registry = Arc::new(BuildRegistry::new());
    let mut rx = registry.subscribe();

    registry.install(build("a"));
    rx.changed().await.expect("notification");

    // Re-armable: a second install fires again.
    registry.install(build("b"));
    rx.changed().await.expect("second notification");
}
