//! Integration tests for the `sols` binary.
//!
//! Each test spawns the compiled binary against the simulated instrument.

use std::path::PathBuf;
use std::process::{Command, Output};

fn sols(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sols"))
        .current_dir(workspace_root())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute sols binary")
}

fn workspace_root() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop();
    path.pop();
    path
}

#[test]
fn help_lists_subcommands() {
    let output = sols(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["compile", "run", "plate-positions", "verify"] {
        assert!(stdout.contains(command), "help should mention {}", command);
    }
}

#[test]
fn compile_prints_plan_with_fingerprint() {
    let output = sols(&["compile", "config/requests/eleven_slices.toml", "--mode", "instant"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["fingerprint"].as_str().unwrap().len(), 64);
    assert_eq!(json["plan"]["steps"].as_array().unwrap().len(), 11);
}

#[test]
fn compile_rejects_unknown_filter() {
    let dir = tempfile::tempdir().unwrap();
    let request = dir.path().join("bad.toml");
    std::fs::write(
        &request,
        r#"
        timepoints = 1
        exposure_us = 10000
        z = { start_um = 0.0, stop_um = 0.0, step_um = 1.0 }

        [[channels]]
        laser_nm = 488
        power_pct = 20.0
        filter = "GFP"

        [[angles]]
        angle_deg = 0.0
        mirrors = { scan_deg = 0.0, tilt_deg = 0.0 }
        "#,
    )
    .unwrap();

    let output = sols(&["compile", request.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("GFP"));
}

#[test]
fn plate_positions_snake_over_wells() {
    let output = sols(&["plate-positions", "config/plates/phenoplate_384.toml"]);
    assert!(output.status.success());
    let listing: toml::Table = toml::from_str(&String::from_utf8_lossy(&output.stdout)).unwrap();
    let labels: Vec<&str> = listing["positions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["label"].as_str().unwrap())
        .collect();
    assert_eq!(
        labels,
        [
            "A01r00c00", "A01r01c00", "B01r00c00", "B01r01c00", "B02r00c00", "B02r01c00",
            "A02r00c00", "A02r01c00",
        ]
    );
}

#[test]
fn run_writes_a_reproducible_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let output = sols(&[
        "run",
        "config/requests/eleven_slices.toml",
        "--mode",
        "instant",
        "--manifest-dir",
        dir.path().to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let manifest = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "json"))
        .expect("manifest written");
    let verify = sols(&["verify", manifest.to_str().unwrap()]);
    assert!(verify.status.success());
    assert!(String::from_utf8_lossy(&verify.stdout).contains("plan reproduces"));
}
