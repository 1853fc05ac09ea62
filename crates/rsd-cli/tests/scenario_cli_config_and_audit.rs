//! Scenario: offline CLI commands (no database).
//!
//! # Invariants under test
//!
//! 1. `config-hash` over the shipped base config is stable across runs.
//! 2. `config-check --strict` fails when an overlay adds a key nothing reads.
//! 3. `audit verify` accepts an intact log and rejects a tampered one.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn base_config() -> String {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../config/base.yaml")
        .to_string_lossy()
        .to_string()
}

fn rsd() -> Command {
    let mut cmd = Command::cargo_bin("rsd").expect("rsd binary");
    cmd.env_remove("RSD_DATABASE_URL");
    cmd
}

#[test]
fn config_hash_is_stable() {
    let first = rsd()
        .args(["config-hash", &base_config()])
        .output()
        .expect("run config-hash");
    assert!(first.status.success());
    let second = rsd()
        .args(["config-hash", &base_config()])
        .output()
        .expect("run config-hash");

    let line = String::from_utf8_lossy(&first.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    assert!(line.starts_with("config_hash="), "got {line}");
    assert_eq!(first.stdout, second.stdout);
}

#[test]
fn strict_config_check_rejects_unread_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let overlay = dir.path().join("overlay.yaml");
    std::fs::write(&overlay, "handover:\n  surprise_knob: 7\n").expect("write overlay");

    rsd()
        .args(["config-check", "--mode", "SERVICE", &base_config()])
        .assert()
        .success()
        .stdout(predicate::str::contains("unused_keys=0"))
        .stdout(predicate::str::contains("code_length=8"));

    rsd()
        .args([
            "config-check",
            "--strict",
            "--mode",
            "SERVICE",
            &base_config(),
            &overlay.to_string_lossy(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("surprise_knob"));
}

#[test]
fn audit_verify_detects_tampering() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("audit.jsonl");

    let mut writer = rsd_audit::AuditWriter::new(&path, true).expect("writer");
    let stream = uuid::Uuid::new_v4();
    writer
        .append(stream, "CODE_ISSUED", serde_json::json!({"code_ref": "abc"}))
        .expect("append 1");
    writer
        .append(stream, "CODE_CONSUMED", serde_json::json!({"code_ref": "abc"}))
        .expect("append 2");

    rsd()
        .args(["audit", "verify", "--path", &path.to_string_lossy()])
        .assert()
        .success()
        .stdout(predicate::str::contains("audit_valid=true lines=2"));

    let content = std::fs::read_to_string(&path).expect("read log");
    std::fs::write(&path, content.replace("CODE_CONSUMED", "CODE_CANCELLED")).expect("tamper");

    rsd()
        .args(["audit", "verify", "--path", &path.to_string_lossy()])
        .assert()
        .failure()
        .stdout(predicate::str::contains("audit_valid=false line=2"));
}
