//! End-to-end tests for enclave CLI commands.
//!
//! These tests write a demo package with `enclave pack` and drive it through
//! the other subcommands.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

/// A demo package written into a temporary directory.
struct TestPackage {
    _temp_dir: TempDir,
    root: PathBuf,
}

impl TestPackage {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().join("demo");
        enclave()
            .args(["pack", root.to_str().unwrap(), "--in-features", "8", "--out-features", "3"])
            .assert()
            .success();
        Self {
            _temp_dir: temp_dir,
            root,
        }
    }

    fn path(&self) -> &str {
        self.root.to_str().unwrap()
    }
}

fn enclave() -> Command {
    let mut cmd = Command::cargo_bin("enclave").unwrap();
    cmd.env_remove("ENCLAVE_POOL_SIZE")
        .env_remove("ENCLAVE_PARALLEL_LOAD")
        .env_remove("RUST_LOG");
    cmd
}

// =============================================================================
// pack / inspect
// =============================================================================

#[test]
fn test_pack_writes_manifest() {
    let package = TestPackage::new();
    let manifest = fs::read_to_string(package.root.join("manifest.json")).unwrap();
    assert!(manifest.contains("model.pkl"));
    assert!(manifest.contains("example.pkl"));
    assert!(package.root.join("model").join("model.pkl").exists());
}

#[test]
fn test_pack_rejects_zero_features() {
    let temp = TempDir::new().unwrap();
    enclave()
        .args(["pack", temp.path().join("bad").to_str().unwrap(), "--in-features", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("feature counts must be positive"));
}

#[test]
fn test_inspect_lists_objects() {
    let package = TestPackage::new();
    enclave()
        .args(["inspect", package.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("demo"))
        .stdout(predicate::str::contains("model/"))
        .stdout(predicate::str::contains("example.pkl"));
}

#[test]
fn test_inspect_missing_package() {
    let temp = TempDir::new().unwrap();
    enclave()
        .args(["inspect", temp.path().join("nope").to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("load failure"))
        .stderr(predicate::str::contains("hint:"));
}

// =============================================================================
// run / bench
// =============================================================================

#[test]
fn test_run_prints_output_shape() {
    let package = TestPackage::new();
    enclave()
        .args(["run", package.path(), "--interpreters", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tensor [1, 3]"))
        .stdout(predicate::str::contains("Completed"));
}

#[test]
fn test_run_missing_object() {
    let package = TestPackage::new();
    enclave()
        .args(["run", package.path(), "--object", "garbage.pkl", "-i", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("garbage.pkl"));
}

#[test]
fn test_run_zero_interpreters() {
    let package = TestPackage::new();
    enclave()
        .args(["run", package.path(), "--interpreters", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("pool exhausted"));
}

#[test]
fn test_bench_results_identical() {
    let package = TestPackage::new();
    enclave()
        .args([
            "bench",
            package.path(),
            "--interpreters",
            "3",
            "--threads",
            "3",
            "--iterations",
            "20",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("60 calls"))
        .stdout(predicate::str::contains("all identical to baseline"));
}

#[test]
fn test_pool_size_from_env() {
    let package = TestPackage::new();
    enclave()
        .env("ENCLAVE_POOL_SIZE", "2")
        .args(["run", package.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("(2 instances)"));
}
