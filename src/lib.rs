//! repeat-predictor - early warning for repeat service calls
//!
//! Learns from attended service calls whether a call will be followed by a
//! repeat visit within the repeat window, and writes a prediction for every
//! call whose outcome is not yet settled.
//!
//! # Overview
//!
//! Each run works as of one date. Calls attended before that date have known
//! outcomes and form the model region; calls on or after it form the
//! prediction region. A run moves through fixed stages:
//!
//! | Stage | What happens |
//! |-------|--------------|
//! | `connected` | A store session is open |
//! | `data_loaded` | The call window is fetched and encoded |
//! | `trained` | A classifier is fitted on the model region |
//! | `threshold_set` | A decision threshold is picked on the calibration slice |
//! | `predicted` | Predictions for the run date replace any earlier ones |
//! | `reconciled` | Known outcomes and verdicts are filled in |
//! | `done` | The run is recorded in the analysis log |
//!
//! # Quick Start
//!
//! ```no_run
//! use repeat_predictor::{execute_run, Config, Database, FeatureSchema};
//! use chrono::NaiveDate;
//!
//! let db = Database::new("calls.db").unwrap();
//! let as_of = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
//! let report = execute_run(&db, &Config::default(), &FeatureSchema::standard(), as_of).unwrap();
//! println!("{} predictions at threshold {:.2}", report.predictions_written, report.calibration.threshold);
//! ```

pub mod calibrate;
pub mod config;
pub mod dates;
pub mod db;
pub mod encoder;
pub mod error;
pub mod export;
pub mod gateway;
pub mod import;
pub mod init;
pub mod logging;
pub mod network;
pub mod pipeline;
pub mod predict;
pub mod record;
pub mod schema;
pub mod trainer;
pub mod window;

pub use calibrate::{Calibration, SelectionRule, ThresholdPolicy};
pub use config::Config;
pub use db::{ConnectOptions, Database};
pub use encoder::{encode, EncodedWindow};
pub use error::{PipelineError, RunFailure, StoreError};
pub use gateway::{Connector, RecordStore};
pub use pipeline::{execute_run, run_schedule, RunReport, RunState, Schedule, ScheduleReport};
pub use record::{CallRecord, FeatureSchema, PredictionRecord, ReconcileSummary, Verdict};
pub use trainer::TrainerConfig;
