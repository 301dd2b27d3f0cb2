//! Unit tests for server argument template rendering.

use game_warden::models::launch::{LaunchParameters, SecurityLevel, Visibility};
use game_warden::session::factory::render_args;

fn params() -> LaunchParameters {
    LaunchParameters {
        primary_port: 1337,
        secondary_port: 1338,
        security_level: SecurityLevel::Trusted,
        visibility: Visibility::Private,
        startup_timeout_seconds: 60,
        topic_timeout_seconds: 5,
        shutdown_grace_seconds: 10,
        health_check_interval_seconds: 60,
        health_check_failure_limit: 3,
        auto_update: true,
        restart_on_crash: true,
        additional_arguments: Vec::new(),
    }
}

#[test]
fn placeholders_are_substituted() {
    let template = vec![
        "{entrypoint}".to_owned(),
        "-port".to_owned(),
        "{port}".to_owned(),
        "-security".to_owned(),
        "{security}".to_owned(),
        "-visibility".to_owned(),
        "{visibility}".to_owned(),
        "-token".to_owned(),
        "{token}".to_owned(),
    ];

    let args = render_args(&template, "/srv/builds/a/world.pack", 1337, "secret", &params());

    assert_eq!(
        args,
        vec![
            "/srv/builds/a/world.pack",
            "-port",
            "1337",
            "-security",
            "trusted",
            "-visibility",
            "private",
            "-token",
            "secret",
        ]
    );
}

#[test]
fn literal_arguments_pass_through() {
    let template = vec!["300".to_owned(), "-quiet".to_owned()];
    let args = render_args(&template, "ignored", 1337, "ignored", &params());
    assert_eq!(args, vec!["300", "-quiet"]);
}

#[test]
fn multiple_placeholders_in_one_argument() {
    let template = vec!["{port}:{token}".to_owned()];
    let args = render_args(&template, "e", 42, "t", &params());
    assert_eq!(args, vec!["42:t"]);
}
