//! Unit tests for session exit classification.

use game_warden::models::session::{ExitKind, SessionExit};

#[test]
fn killed_classification_has_no_code() {
    let exit = SessionExit::killed();
    assert_eq!(exit.kind, ExitKind::Killed);
    assert_eq!(exit.code, None);
    assert!(!exit.is_crash());
}

#[test]
fn cancelled_classification_is_not_a_crash() {
    let exit = SessionExit::cancelled();
    assert_eq!(exit.kind, ExitKind::Cancelled);
    assert!(!exit.is_crash());
}

#[test]
fn crash_classification_is_a_crash() {
    let exit = SessionExit {
        kind: ExitKind::Crashed,
        code: Some(1),
    };
    assert!(exit.is_crash());
}

#[cfg(unix)]
#[tokio::test]
async fn clean_process_exit_classifies_normal() {
    let status = tokio::process::Command::new("true")
        .status()
        .await
        .expect("run true");
    let exit = SessionExit::from_status(status);
    assert_eq!(exit.kind, ExitKind::Normal);
    assert_eq!(exit.code, Some(0));
}

#[cfg(unix)]
#[tokio::test]
async fn nonzero_process_exit_classifies_crashed() {
    let status = tokio::process::Command::new("false")
        .status()
        .await
        .expect("run false");
    let exit = SessionExit::from_status(status);
    assert_eq!(exit.kind, ExitKind::Crashed);
    assert_eq!(exit.code, Some(1));
}

#[cfg(unix)]
#[tokio::test]
async fn signalled_process_exit_classifies_killed() {
    let mut child = tokio::process::Command::new("sleep")
        .arg("60")
        .spawn()
        .expect("spawn sleep");
    child.kill().await.expect("kill");
    let status = child.wait().await.expect("wait");

    let exit = SessionExit::from_status(status);
    assert_eq!(exit.kind, ExitKind::Killed);
    assert_eq!(exit.code, None);
}
