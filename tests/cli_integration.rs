//! Integration tests for the repeat-predictor CLI
//!
//! These tests exercise the full CLI workflow inside a temporary project
//! directory. They verify that commands work end-to-end without mocking.

use chrono::{Duration, Local};
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Helper to run repeat-predictor inside `dir`
fn run_cli(args: &[&str], dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_repeat-predictor"))
        .args(args)
        .current_dir(dir)
        .env_remove("REPEAT_PREDICTOR_DB_PATH")
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to execute repeat-predictor")
}

/// Helper to get stdout as string
fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Helper to get stderr as string
fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

const SMALL_CONFIG: &str = r#"
[pipeline]
calibration_rows = 200
min_training_rows = 100

[trainer]
mirror_input_layer = false
hidden_layers = [8]
dropout = 0.0
max_epochs = 3
"#;

/// Initialised project with a small model config and 1500 calls over the last 400 days
fn seeded_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["init"], dir.path());
    assert!(output.status.success(), "init failed: {}", stderr(&output));
    std::fs::write(dir.path().join(".repeat-predictor/config.toml"), SMALL_CONFIG).unwrap();

    let now = Local::now().naive_local();
    let first = now - Duration::days(400);
    let calls: Vec<serde_json::Value> = (0..1500i64)
        .map(|i| {
            let attended = first + Duration::minutes(i * 384);
            serde_json::json!({
                "incident": 50_000 + i,
                "attend_date_time": attended.format("%Y-%m-%d %H:%M:%S").to_string(),
                "business_type": (["Retail", "Office", "School"][(i % 3) as usize]),
                "manufacturer": (["Ricoh", "Canon"][(i % 2) as usize]),
                "product_id": format!("P{}", i % 5),
                "device_type": "MFP",
                "last_other_call_type": if i % 4 == 0 { None } else { Some("Toner") },
                "created_by": "web",
                "created_day": (["Mon", "Tue", "Wed"][(i % 3) as usize]),
                "attend_day": (["Tue", "Wed", "Thu"][(i % 3) as usize]),
                "post_code_area": (["LS", "M"][(i % 2) as usize]),
                "first_engineer": format!("E{}", i % 7),
                "symptom_code_id": format!("S{}", i % 6),
                "device_age_days": (i % 90) as f64 * 20.0,
                "meter_total": 1000.0 + (i % 13) as f64 * 350.0,
                "repeated": if i % 10 == 0 { "YES" } else { "NO" },
            })
        })
        .collect();
    let file = dir.path().join("calls.json");
    std::fs::write(&file, serde_json::to_string(&calls).unwrap()).unwrap();

    let output = run_cli(&["import", "calls.json"], dir.path());
    assert!(output.status.success(), "import failed: {}", stderr(&output));
    assert!(stdout(&output).contains("1500 calls"));
    dir
}

fn live_run_date() -> String {
    (Local::now().date_naive() - Duration::days(14))
        .format("%d/%m/%Y")
        .to_string()
}

// =============================================================================
// Basic Command Tests
// =============================================================================

#[test]
fn test_help_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_repeat-predictor"))
        .arg("--help")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("repeat-predictor"));
    assert!(out.contains("repeat visit"));
}

#[test]
fn test_version_command() {
    let output = Command::new(env!("CARGO_BIN_EXE_repeat-predictor"))
        .arg("--version")
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    assert!(stdout(&output).contains("repeat-predictor"));
}

#[test]
fn test_run_without_credentials_prints_usage() {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["run"], dir.path());

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Usage"));
}

#[test]
fn test_run_rejects_bad_start_date() {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["run", "analyst", "secret", "--start-date", "2024-01-31"], dir.path());

    assert!(!output.status.success());
    assert!(stderr(&output).contains("dd/mm/yyyy"));
}

#[test]
fn test_run_without_database_fails() {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["run", "analyst", "secret"], dir.path());

    assert!(!output.status.success());
    assert!(stderr(&output).contains("database not found"));
}

// =============================================================================
// Shell Completion Tests
// =============================================================================

#[test]
fn test_completion_zsh() {
    let output = Command::new(env!("CARGO_BIN_EXE_repeat-predictor"))
        .args(["completion", "zsh"])
        .output()
        .expect("Failed to execute");

    assert!(
        output.status.success(),
        "completion zsh failed: {}",
        stderr(&output)
    );
    assert!(
        stdout(&output).contains("#compdef repeat-predictor"),
        "zsh completion should contain #compdef"
    );
}

#[test]
fn test_completion_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_repeat-predictor"))
        .args(["completion", "bash"])
        .output()
        .expect("Failed to execute");

    assert!(output.status.success());
    assert!(stdout(&output).contains("_repeat-predictor"));
}

// =============================================================================
// Project Workflow Tests
// =============================================================================

#[test]
fn test_init_creates_project() {
    let dir = TempDir::new().unwrap();
    let output = run_cli(&["init"], dir.path());

    assert!(output.status.success(), "init failed: {}", stderr(&output));
    assert!(dir.path().join(".repeat-predictor/config.toml").is_file());
    assert!(dir.path().join(".repeat-predictor/calls.db").is_file());
    assert!(stdout(&output).contains("initialized"));
}

#[test]
fn test_import_rejects_malformed_file() {
    let dir = TempDir::new().unwrap();
    run_cli(&["init"], dir.path());
    std::fs::write(dir.path().join("bad.json"), "[{\"incident\": 1}]").unwrap();

    let output = run_cli(&["import", "bad.json"], dir.path());
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Invalid JSON"));
}

#[test]
fn test_live_run_then_review() {
    let dir = seeded_project();
    let date = live_run_date();

    let output = run_cli(&["run", "analyst", "secret"], dir.path());
    assert!(output.status.success(), "run failed: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains(&format!("Run as of {}", date)));
    assert!(out.contains("1 runs completed"));

    let output = run_cli(&["predictions", "--date", &date], dir.path());
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("INCIDENT"));
    assert!(out.contains("Precision:"));

    let output = run_cli(&["predictions", "--date", &date, "--format", "csv"], dir.path());
    assert!(output.status.success());
    let csv = stdout(&output);
    assert!(csv.starts_with("prediction_date,incident"));
    assert!(csv.lines().count() > 1);

    let output = run_cli(&["predictions", "--date", &date, "--format", "json"], dir.path());
    let value: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(value["prediction_date"], date.as_str());

    let output = run_cli(&["reconcile", "--date", &date], dir.path());
    assert!(output.status.success());
    assert!(stdout(&output).contains("Reconciled"));

    let output = run_cli(&["log"], dir.path());
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains(&date));
    assert!(out.contains("predictions"));
}

#[test]
fn test_historical_run_reports_failed_dates() {
    let dir = seeded_project();
    // The first run date has no history to train on
    let start = (Local::now().date_naive() - Duration::days(395))
        .format("%d/%m/%Y")
        .to_string();

    let output = run_cli(
        &["run", "analyst", "secret", "--start-date", &start, "--interval-days", "200"],
        dir.path(),
    );
    assert!(!output.status.success());
    let out = stdout(&output);
    assert!(out.contains("Failed"));
    assert!(out.contains("1 runs completed, 1 failed"));
}
