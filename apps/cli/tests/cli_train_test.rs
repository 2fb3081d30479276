//! Integration tests for the `train`, `checkpoints` and `config` commands.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn train(results: &Path, snapshot: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cadence").unwrap();
    cmd.arg("train")
        .arg("--results-folder")
        .arg(results)
        .arg("--snapshot-dir")
        .arg(snapshot)
        .args(["--epochs", "1", "--records", "128", "--batch-size", "32", "--seed", "3"]);
    cmd
}

fn workspace() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let results = temp_dir.path().join("results");
    let snapshot = temp_dir.path().join("src");
    std::fs::create_dir_all(&snapshot).unwrap();
    std::fs::write(snapshot.join("model.rs"), "fn main() {}\n").unwrap();
    std::fs::write(snapshot.join("notes.txt"), "not copied\n").unwrap();
    (temp_dir, results, snapshot)
}

#[test]
fn test_train_prints_progress_and_creates_layout() {
    let (_temp_dir, results, snapshot) = workspace();

    let output = train(&results, &snapshot).arg("-t").arg("2").assert().success().get_output().stdout.clone();
    let stdout = String::from_utf8(output).unwrap();

    let lines: Vec<&str> = stdout.lines().filter(|l| l.starts_with("iteration ")).collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("iteration 1\tloss "));
    assert!(lines[3].starts_with("iteration 4\t"));
    assert!(lines[0].contains("\taccuracy "));
    assert!(stdout.contains("training has ended"));

    assert!(results.join("models").join("model-0.ckpt").exists());
    assert!(results.join("models").join("checkpoints.json").exists());
    assert!(results.join("summary").join("events.jsonl").exists());
    assert!(results.join("source").join("config.toml").exists());
    assert!(results.join("source").join("model.rs").exists());
    assert!(!results.join("source").join("notes.txt").exists());
}

#[test]
fn test_existing_results_require_overwrite() {
    let (_temp_dir, results, snapshot) = workspace();
    train(&results, &snapshot).assert().success();

    train(&results, &snapshot).assert().failure().stderr(predicate::str::contains("already exists"));
    train(&results, &snapshot)
        .args(["-o", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("training has ended"));
}

#[test]
fn test_overwrite_flag_accepts_only_zero_or_one() {
    let (_temp_dir, results, snapshot) = workspace();
    train(&results, &snapshot).args(["-o", "2"]).assert().failure();
    assert!(!results.exists());
}

#[test]
fn test_zero_reader_threads_rejected() {
    let (_temp_dir, results, snapshot) = workspace();
    train(&results, &snapshot)
        .args(["-t", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least one reader thread"));
}

#[test]
fn test_checkpoints_lists_saved_models() {
    let (_temp_dir, results, snapshot) = workspace();
    train(&results, &snapshot).assert().success();

    let mut cmd = Command::cargo_bin("cadence").unwrap();
    cmd.arg("checkpoints")
        .arg("--results-folder")
        .arg(&results)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("model-0.ckpt"))
        .stdout(predicate::str::contains("\"sha256\""));
}

#[test]
fn test_checkpoints_without_results_fails() {
    let temp_dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("cadence").unwrap();
    cmd.arg("checkpoints").arg("-r").arg(temp_dir.path().join("missing")).assert().failure();
}

#[test]
fn test_config_prints_defaults_and_merges_file() {
    let mut cmd = Command::cargo_bin("cadence").unwrap();
    cmd.arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("batch_size = 64"))
        .stdout(predicate::str::contains("[annealing.learning_rate]"));

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("cadence.toml");
    std::fs::write(&path, "batch_size = 16\n").unwrap();
    let mut cmd = Command::cargo_bin("cadence").unwrap();
    cmd.arg("config").arg("-c").arg(&path).assert().success().stdout(predicate::str::contains("batch_size = 16"));
}
