//! CLI subprocess integration tests.
//!
//! These run the `cairn` binary against a directory store and check exit
//! codes and JSON output.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn cairn(store: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cairn"));
    cmd.arg("--store").arg(store);
    cmd.env_remove("CAIRN_LOG");
    cmd
}

fn run(store: &Path, args: &[&str]) -> Output {
    cairn(store).args(args).output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_environ(dir: &Path) -> PathBuf {
    let path = dir.join("environments.toml");
    std::fs::write(
        &path,
        "name = \"erewhemos\"\ntype = \"dummy\"\nadmin-secret = \"pork\"\n",
    )
    .unwrap();
    path
}

fn write_charm(dir: &Path) -> (PathBuf, PathBuf) {
    let meta = dir.join("metadata.toml");
    std::fs::write(
        &meta,
        "name = \"wordpress\"\n\n[requires.db]\ninterface = \"mysql\"\n",
    )
    .unwrap();
    let bundle = dir.join("wordpress.charm");
    std::fs::write(&bundle, b"wordpress bundle").unwrap();
    (meta, bundle)
}

fn init(dir: &Path, store: &Path) {
    let environ = write_environ(dir);
    let out = run(store, &["init", environ.to_str().unwrap()]);
    assert!(out.status.success(), "init failed: {}", stderr(&out));
}

#[test]
fn help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(dir.path(), &["--help"]);
    assert!(out.status.success());
    let text = stdout(&out);
    for cmd in ["init", "status", "deploy", "destroy-unit", "resolved", "watch"] {
        assert!(text.contains(cmd), "help is missing {cmd}: {text}");
    }
}

#[test]
fn commands_before_init_fail() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(&dir.path().join("store"), &["status"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("cairn init"));
}

#[test]
fn init_twice_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    init(dir.path(), &store);
    let environ = write_environ(dir.path());
    let out = run(&store, &["init", environ.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("already initialised"));
}

#[test]
fn deploy_then_status_json() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    init(dir.path(), &store);
    let (meta, bundle) = write_charm(dir.path());

    let out = run(
        &store,
        &[
            "--json",
            "deploy",
            meta.to_str().unwrap(),
            bundle.to_str().unwrap(),
            "-n",
            "2",
        ],
    );
    assert!(out.status.success(), "deploy failed: {}", stderr(&out));
    let deployed: Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(deployed["service"], "wordpress");
    assert_eq!(deployed["charm"], "local:precise/wordpress-0");
    assert_eq!(
        deployed["units"],
        serde_json::json!(["wordpress/0", "wordpress/1"])
    );

    let out = run(&store, &["status", "--json"]);
    assert!(out.status.success(), "status failed: {}", stderr(&out));
    let status: Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(status["environment"], "erewhemos");
    assert_eq!(status["services"][0]["name"], "wordpress");
    assert_eq!(status["machines"].as_array().unwrap().len(), 2);
    let units = status["units"].as_array().unwrap();
    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|u| u["life"] == "alive"));
    assert!(units.iter().all(|u| !u["machine"].is_null()));

    let out = run(&store, &["destroy-unit", "wordpress/1"]);
    assert!(out.status.success(), "destroy failed: {}", stderr(&out));
    let out = run(&store, &["status", "--json"]);
    let status: Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(status["units"][1]["life"], "dying");
}

#[test]
fn destroying_missing_unit_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    init(dir.path(), &store);
    let out = run(&store, &["destroy-unit", "wordpress/9"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(
        stderr(&out).contains("cannot destroy units: unit \"wordpress/9\" is not alive"),
        "stderr: {}",
        stderr(&out)
    );
}

#[test]
fn invalid_status_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    init(dir.path(), &store);
    let (meta, bundle) = write_charm(dir.path());
    let out = run(
        &store,
        &["deploy", meta.to_str().unwrap(), bundle.to_str().unwrap()],
    );
    assert!(out.status.success(), "deploy failed: {}", stderr(&out));

    let out = run(&store, &["set-status", "wordpress/0", "sleeping"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("invalid status \"sleeping\""));

    let out = run(&store, &["set-status", "wordpress/0", "active", "serving"]);
    assert!(out.status.success(), "set-status failed: {}", stderr(&out));
    let out = run(&store, &["status", "--json"]);
    let status: Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(status["units"][0]["status"], "active");
    assert_eq!(status["units"][0]["message"], "serving");
}
