//! Integration tests for the prediction pipeline
//!
//! These tests run whole as-of runs against a temporary SQLite store filled
//! with synthetic calls.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use repeat_predictor::config::Config;
use repeat_predictor::db::{CallRow, ConnectOptions, Database};
use repeat_predictor::pipeline::{execute_run, run_schedule, RunState, Schedule};
use repeat_predictor::predict::reconcile;
use repeat_predictor::record::{FeatureSchema, Verdict};
use repeat_predictor::{PipelineError, RecordStore};
use std::path::PathBuf;
use tempfile::TempDir;

const CALLS: i64 = 1500;
const SPAN_DAYS: i64 = 400;
const FIRST_INCIDENT: i64 = 10_000;

fn first_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 2).unwrap()
}

fn day(offset: i64) -> NaiveDate {
    first_day() + Duration::days(offset)
}

/// Calls evenly spread over 400 days, incidents increasing with attend time,
/// roughly one in ten a repeat.
fn synthetic_calls() -> Vec<CallRow> {
    let mut rng = StdRng::seed_from_u64(7);
    let start = first_day().and_hms_opt(8, 0, 0).unwrap();
    let step_minutes = SPAN_DAYS * 24 * 60 / CALLS;
    let weekdays = ["Mon", "Tue", "Wed", "Thu", "Fri"];

    (0..CALLS)
        .map(|i| {
            let attended: NaiveDateTime = start + Duration::minutes(i * step_minutes);
            let symptom = rng.gen_range(0..6);
            let old_device = rng.gen_bool(0.3);
            let p_repeat = match (symptom, old_device) {
                (0, true) => 0.45,
                (0, false) | (_, true) => 0.12,
                _ => 0.03,
            };
            CallRow {
                incident: FIRST_INCIDENT + i,
                attend_date_time: attended.format("%Y-%m-%d %H:%M:%S").to_string(),
                business_type: Some(["Retail", "Office", "School"][rng.gen_range(0..3usize)].into()),
                manufacturer: Some(["Ricoh", "Canon", "Xerox", "Kyocera"][rng.gen_range(0..4usize)].into()),
                product_id: Some(format!("P{}", rng.gen_range(0..8))),
                device_type: Some(["MFP", "Printer"][rng.gen_range(0..2usize)].into()),
                last_other_call_type: if rng.gen_bool(0.2) {
                    None
                } else {
                    Some(["Install", "Toner", "Break"][rng.gen_range(0..3usize)].into())
                },
                created_by: Some(["web", "phone"][rng.gen_range(0..2usize)].into()),
                created_day: Some(weekdays[rng.gen_range(0..5usize)].into()),
                attend_day: Some(weekdays[rng.gen_range(0..5usize)].into()),
                post_code_area: Some(["LS", "M", "B", "NE"][rng.gen_range(0..4usize)].into()),
                first_engineer: Some(format!("E{}", rng.gen_range(0..12))),
                symptom_code_id: Some(format!("S{}", symptom)),
                device_age_days: Some(if old_device {
                    rng.gen_range(1500.0..3000.0)
                } else {
                    rng.gen_range(10.0..1500.0)
                }),
                days_since_install: Some(rng.gen_range(0.0..3000.0)),
                days_since_last_break: if rng.gen_bool(0.25) {
                    None
                } else {
                    Some(rng.gen_range(0.0..365.0))
                },
                days_since_last_other_call: Some(rng.gen_range(0.0..200.0)),
                meter_total: Some(rng.gen_range(1000.0..500_000.0)),
                meter_since_last_call: None,
                repeated: Some(if rng.gen_bool(p_repeat) { "YES" } else { "NO" }.into()),
            }
        })
        .collect()
}

/// Small network so the tests train in seconds.
fn test_config() -> Config {
    let mut config = Config::default();
    config.pipeline.calibration_rows = 200;
    config.pipeline.min_training_rows = 100;
    config.trainer.mirror_input_layer = false;
    config.trainer.hidden_layers = vec![8];
    config.trainer.dropout = 0.0;
    config.trainer.max_epochs = 5;
    config.trainer.learning_rate = 0.01;
    config
}

fn seeded_db(calls: &[CallRow]) -> (TempDir, PathBuf, Database) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("calls.db");
    let db = Database::open_at(&path).unwrap();
    db.upsert_calls(calls).unwrap();
    (dir, path, db)
}

/// Calls attended from the start of `as_of` to the end of `as_of + repeat_days`.
fn prediction_region(calls: &[CallRow], as_of: NaiveDate, repeat_days: i64) -> Vec<&CallRow> {
    let last = as_of + Duration::days(repeat_days);
    calls
        .iter()
        .filter(|c| {
            let date = NaiveDate::parse_from_str(&c.attend_date_time[..10], "%Y-%m-%d").unwrap();
            date >= as_of && date <= last
        })
        .collect()
}

// =============================================================================
// End-to-end runs
// =============================================================================

#[test]
fn test_end_to_end_run() {
    let calls = synthetic_calls();
    let (_dir, _path, db) = seeded_db(&calls);
    let config = test_config();
    let as_of = day(300);

    let report = execute_run(&db, &config, &FeatureSchema::standard(), as_of).unwrap();
    let expected = prediction_region(&calls, as_of, 14);

    assert_eq!(report.state, RunState::Done);
    assert!(!expected.is_empty());
    assert_eq!(report.prediction_rows, expected.len());
    assert_eq!(report.predictions_written, expected.len());
    assert_eq!(report.calibration_rows, 200);
    assert_eq!(report.model_rows, report.records_loaded - report.prediction_rows);
    assert_eq!(
        report.training_rows + report.validation_rows + report.calibration_rows,
        report.model_rows
    );
    assert!(report.epochs >= 1 && report.epochs <= 5);

    let threshold = report.calibration.threshold;
    assert!(threshold > 0.0 && threshold <= 1.0);

    let stored = db.get_predictions(as_of).unwrap();
    assert_eq!(stored.len(), expected.len());
    for (record, call) in stored.iter().zip(&expected) {
        assert_eq!(record.incident, call.incident);
        assert_eq!(record.run_date, as_of);
        assert_eq!(record.threshold, threshold);
        assert!((0.0..=1.0).contains(&record.confidence));
        assert_eq!(record.predicted, record.confidence >= threshold);
    }
}

#[test]
fn test_reconciliation_with_all_outcomes_known() {
    let calls = synthetic_calls();
    let (_dir, _path, db) = seeded_db(&calls);
    let as_of = day(300);

    let report = execute_run(&db, &test_config(), &FeatureSchema::standard(), as_of).unwrap();
    assert_eq!(report.reconciled.pending, 0);
    assert_eq!(report.reconciled.total(), report.predictions_written);

    for record in db.get_predictions(as_of).unwrap() {
        let actual = record.actual.expect("outcome should be known");
        let expected = if record.predicted == actual {
            Verdict::Correct
        } else {
            Verdict::Incorrect
        };
        assert_eq!(record.verdict, Some(expected));
    }
}

#[test]
fn test_rerun_replaces_predictions() {
    let calls = synthetic_calls();
    let (_dir, _path, db) = seeded_db(&calls);
    let config = test_config();
    let as_of = day(250);

    let first = execute_run(&db, &config, &FeatureSchema::standard(), as_of).unwrap();
    let second = execute_run(&db, &config, &FeatureSchema::standard(), as_of).unwrap();

    assert_eq!(first.predictions_written, second.predictions_written);
    assert_eq!(db.get_predictions(as_of).unwrap().len(), first.predictions_written);
    assert_ne!(first.run_id, second.run_id);
}

#[test]
fn test_pending_outcomes_reconcile_later() {
    let mut calls = synthetic_calls();
    let as_of = day(300);
    // Outcomes of the last week of the window are not known yet
    let unsettled_from = (as_of + Duration::days(7)).format("%Y-%m-%d").to_string();
    let mut settled = Vec::new();
    for call in calls.iter_mut() {
        if call.attend_date_time[..10] >= unsettled_from[..] {
            settled.push(call.clone());
            call.repeated = None;
        }
    }
    let (_dir, _path, db) = seeded_db(&calls);

    let report = execute_run(&db, &test_config(), &FeatureSchema::standard(), as_of).unwrap();
    let stored = db.get_predictions(as_of).unwrap();
    let unknown = stored.iter().filter(|p| p.actual.is_none()).count();
    assert!(unknown > 0);
    assert_eq!(report.reconciled.pending, unknown);
    assert!(stored
        .iter()
        .filter(|p| p.actual.is_none())
        .all(|p| p.verdict == Some(Verdict::Pending)));

    // Ground truth arrives
    db.upsert_calls(&settled).unwrap();
    let summary = reconcile(&db, as_of).unwrap();
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.total(), stored.len());
}

// =============================================================================
// Error handling
// =============================================================================

#[test]
fn test_prediction_date_after_all_calls_is_a_window_error() {
    let calls = synthetic_calls();
    let (_dir, _path, db) = seeded_db(&calls);
    let err = execute_run(&db, &test_config(), &FeatureSchema::standard(), day(SPAN_DAYS + 30))
        .unwrap_err();
    assert!(matches!(err, PipelineError::Window(_)), "got {:?}", err);
    assert!(db.get_predictions(day(SPAN_DAYS + 30)).unwrap().is_empty());
}

#[test]
fn test_schedule_continues_after_failed_run() {
    let calls = synthetic_calls();
    let (_dir, path, db) = seeded_db(&calls);
    let options = ConnectOptions {
        database_path: path,
        username: "analyst".into(),
        password: "secret".into(),
    };

    // Runs as of day 20 (too little history) and day 300
    let schedule = Schedule::historical(day(34), 280, day(314), 14).unwrap();
    assert_eq!(schedule.dates(), &[day(20), day(300)]);

    let report = run_schedule(&options, &test_config(), &FeatureSchema::standard(), &schedule)
        .unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].as_of, day(20));
    assert!(matches!(report.failures[0].error, PipelineError::Training(_)));
    assert_eq!(report.runs.len(), 1);
    assert_eq!(report.runs[0].as_of, day(300));

    // Newest first: day 300 finished and started, day 20 failed and started
    let log = db.recent_log_entries(10).unwrap();
    assert_eq!(log.len(), 4);
    assert!(log[0].description.contains(&report.runs[0].run_id));
    assert!(log[1].description.contains(&report.runs[0].run_id));
    assert!(log[1].description.contains("started and connected to database OK"));
    assert!(log[2].description.starts_with("TrainingError"));
    assert!(log[3].description.contains("started"));
}

#[test]
fn test_unreadable_attend_time_fails_run_as_data_integrity() {
    let calls = synthetic_calls();
    let (_dir, path, db) = seeded_db(&calls);
    // Written by another tool, bypassing the canonical form imports use
    let mut conn = SqliteConnection::establish(&path.to_string_lossy()).unwrap();
    diesel::sql_query(
        "INSERT INTO call_analysis (incident, attend_date_time) VALUES (99999, '2023-10-30 9:00')",
    )
    .execute(&mut conn)
    .unwrap();

    let options = ConnectOptions {
        database_path: path,
        username: "analyst".into(),
        password: "secret".into(),
    };
    let schedule = Schedule::live(day(314), 14);
    let report = run_schedule(&options, &test_config(), &FeatureSchema::standard(), &schedule)
        .unwrap();

    assert!(report.runs.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].error, PipelineError::DataIntegrity(_)));
    assert!(db.get_predictions(day(300)).unwrap().is_empty());

    let log = db.recent_log_entries(1).unwrap();
    assert!(log[0].description.starts_with("DataIntegrityError: "), "{}", log[0].description);
    assert!(log[0].description.contains("99999"));
}

#[test]
fn test_unreachable_store_is_fatal() {
    let dir = TempDir::new().unwrap();
    let options = ConnectOptions {
        database_path: dir.path().join("nowhere").join("calls.db"),
        username: "analyst".into(),
        password: String::new(),
    };
    let schedule = Schedule::live(day(314), 14);
    let failure = run_schedule(&options, &test_config(), &FeatureSchema::standard(), &schedule)
        .unwrap_err();
    assert!(failure.is_fatal());
    assert_eq!(failure.as_of, day(300));
}

#[test]
fn test_store_trait_object() {
    let calls = synthetic_calls();
    let (_dir, _path, db) = seeded_db(&calls);
    let store: &dyn RecordStore = &db;
    assert_eq!(store.fetch_min_identifier(first_day()).unwrap(), Some(FIRST_INCIDENT));
    let report = execute_run(store, &test_config(), &FeatureSchema::standard(), day(300)).unwrap();
    assert_eq!(report.state, RunState::Done);
}
