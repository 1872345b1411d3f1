//! CLI tests for the producer commands.
//!
//! Spawns the goal-runner binary against a scratch data directory and checks
//! output and exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use goal_runner::exit_codes;
use goal_runner::io::init::{InitOptions, init_data_dir};

fn goal_runner(data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_goal-runner"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .output()
        .expect("spawn goal-runner")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn add_status_cancel() {
    let temp = tempfile::tempdir().expect("tempdir");
    let data_dir = temp.path().join("data");
    init_data_dir(&data_dir, &InitOptions::default()).expect("init");

    let added = goal_runner(&data_dir, &["add", "plan a trip", "--tier", "tier2"]);
    assert_eq!(added.status.code(), Some(exit_codes::OK));
    let id = stdout(&added);
    assert!(!id.is_empty());
    assert!(data_dir.join("wake").exists());

    let status = goal_runner(&data_dir, &["status"]);
    let listed = stdout(&status);
    assert!(listed.contains(&id));
    assert!(listed.contains("pending"));
    assert!(listed.contains("plan a trip"));

    let cancelled = goal_runner(&data_dir, &["cancel", &id]);
    assert_eq!(cancelled.status.code(), Some(exit_codes::OK));
    assert!(stdout(&goal_runner(&data_dir, &["status"])).contains("cancelled"));
}

#[test]
fn unknown_goal_exits_with_not_active_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = goal_runner(temp.path(), &["cancel", "no-such-goal"]);
    assert_eq!(output.status.code(), Some(exit_codes::NOT_ACTIVE));
}

#[test]
fn unknown_tier_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = goal_runner(temp.path(), &["add", "x", "--tier", "gold"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown tier 'gold'"));
}

#[test]
fn validate_reports_plan_defects() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bad = temp.path().join("bad.json");
    fs::write(
        &bad,
        r#"{"steps": [
            {"step_id": 1, "dependencies": [2], "instruction": "a"},
            {"step_id": 2, "dependencies": [1], "instruction": "b"}
        ]}"#,
    )
    .expect("write plan");
    let output = goal_runner(temp.path(), &["validate", bad.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID_PLAN));
    assert!(String::from_utf8_lossy(&output.stderr).contains("dependency cycle"));

    let good = temp.path().join("good.json");
    fs::write(
        &good,
        r#"{"strategy": {}, "steps": [{"step_id": 1, "instruction": "a"}]}"#,
    )
    .expect("write plan");
    let output = goal_runner(temp.path(), &["validate", good.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout(&output), "ok: 1 steps");
}

#[test]
fn profile_set_then_get() {
    let temp = tempfile::tempdir().expect("tempdir");
    let set = goal_runner(temp.path(), &["profile", "set", "home_city", "Lisbon"]);
    assert_eq!(set.status.code(), Some(exit_codes::OK));
    let get = goal_runner(temp.path(), &["profile", "get", "home_city"]);
    assert_eq!(stdout(&get), "Lisbon");
    let missing = goal_runner(temp.path(), &["profile", "get", "budget"]);
    assert_eq!(missing.status.code(), Some(exit_codes::INVALID));
}
