//! End-to-end checks for the `mtrain` binary that need no Redis.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn mtrain() -> Command {
    let mut cmd = Command::cargo_bin("mtrain").unwrap();
    for key in ["REDIS_URL", "DATA_BANK_URL", "DATA_BANK_API_KEY", "DATA_ROOT", "ARTIFACTS_ROOT", "RUST_LOG"] {
        cmd.env_remove(key);
    }
    cmd
}

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("mtrain.toml");
    let body = format!(
        "[app]\ndata_root = {:?}\nartifacts_root = {:?}\n{extra}",
        dir.join("data").display().to_string(),
        dir.join("artifacts").display().to_string(),
    );
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_help_lists_subcommands() {
    mtrain()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cleanup"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("worker"));
}

#[test]
fn test_worker_help_shows_idle_option() {
    mtrain()
        .args(["worker", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--idle-ms"))
        .stdout(predicate::str::contains("Ctrl-C"));
}

#[test]
fn test_worker_rejects_invalid_config() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "[queue]
retry_max = 2
retry_intervals_sec = []
");

    mtrain()
        .arg("--config")
        .arg(&config)
        .arg("worker")
        .assert()
        .failure()
        .stderr(predicate::str::contains("queue.retry_intervals_sec"));
}

#[test]
fn test_missing_config_file_fails() {
    mtrain()
        .args(["--config", "/nonexistent/mtrain.toml", "cleanup", "tokenizers"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration file not found"));
}

#[test]
fn test_invalid_config_value_fails() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "[state_store]\nattempts = 0\n");

    mtrain()
        .arg("--config")
        .arg(&config)
        .args(["cleanup", "corpus-cache"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("state_store.attempts"));
}

#[test]
fn test_corpus_cache_cleanup_with_missing_cache_reports_nothing_freed() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");

    mtrain()
        .arg("--config")
        .arg(&config)
        .args(["cleanup", "corpus-cache"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"deleted_files\": 0"))
        .stdout(predicate::str::contains("\"bytes_freed\": 0"));
}

#[test]
fn test_tokenizer_cleanup_deletes_unreferenced_old_tokenizer() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "[tokenizer_cleanup]\nmin_unused_days = 0\n");

    let tok = temp.path().join("artifacts").join("tokenizers").join("tok-old");
    std::fs::create_dir_all(&tok).unwrap();
    std::fs::write(tok.join("tokenizer.json"), b"{}").unwrap();

    mtrain()
        .arg("--config")
        .arg(&config)
        .args(["cleanup", "tokenizers"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"deleted_tokenizers\": 1"));

    assert!(!tok.exists());
}

#[test]
fn test_artifact_cleanup_requires_run_id() {
    mtrain()
        .args(["cleanup", "artifacts"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--run-id"));
}
