//! Run orchestration
//!
//! One run loads the window around its as-of date, trains a throw-away
//! classifier on the settled part, calibrates a threshold on the reserved
//! slice, writes predictions for the unsettled part and reconciles them.
//! A [`Schedule`] drives one or many runs, each against its own store
//! session.

use chrono::{Days, NaiveDate};
use ndarray::s;
use serde::Serialize;
use uuid::Uuid;

use crate::calibrate::{calibrate, Calibration};
use crate::config::Config;
use crate::dates::{format_dmy, start_of_day};
use crate::encoder::encode;
use crate::error::{PipelineError, Result, RunFailure, StoreError};
use crate::gateway::{Connector, RecordStore};
use crate::predict::{predict, reconcile, write_predictions};
use crate::record::{FeatureSchema, ReconcileSummary};
use crate::trainer::train;
use crate::window::{reserve_calibration, split_at_cutoff};

/// Window start used when no history limit is configured.
fn earliest_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Stages of a single run, in the only order they may be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Connected,
    DataLoaded,
    Trained,
    ThresholdSet,
    Predicted,
    Reconciled,
    Done,
}

impl RunState {
    pub fn next(self) -> Option<RunState> {
        match self {
            RunState::Connected => Some(RunState::DataLoaded),
            RunState::DataLoaded => Some(RunState::Trained),
            RunState::Trained => Some(RunState::ThresholdSet),
            RunState::ThresholdSet => Some(RunState::Predicted),
            RunState::Predicted => Some(RunState::Reconciled),
            RunState::Reconciled => Some(RunState::Done),
            RunState::Done => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Connected => "connected",
            RunState::DataLoaded => "data_loaded",
            RunState::Trained => "trained",
            RunState::ThresholdSet => "threshold_set",
            RunState::Predicted => "predicted",
            RunState::Reconciled => "reconciled",
            RunState::Done => "done",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tracks the state of one run and refuses skipped or repeated stages.
#[derive(Debug)]
pub struct RunProgress {
    state: RunState,
}

impl RunProgress {
    pub fn connected() -> Self {
        Self {
            state: RunState::Connected,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, to: RunState) -> Result<()> {
        if self.state.next() != Some(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(from = %self.state, to = %to, "run state");
        self.state = to;
        Ok(())
    }
}

/// What a completed run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub as_of: NaiveDate,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub records_loaded: usize,
    pub repeats_loaded: usize,
    pub feature_columns: usize,
    pub model_rows: usize,
    pub training_rows: usize,
    pub validation_rows: usize,
    pub calibration_rows: usize,
    pub prediction_rows: usize,
    pub epochs: usize,
    pub stopped_early: bool,
    pub best_val_loss: Option<f64>,
    pub calibration: Calibration,
    pub predictions_written: usize,
    pub flagged: usize,
    pub reconciled: ReconcileSummary,
    pub state: RunState,
}

impl RunReport {
    /// One-line description written to the store's analysis log.
    pub fn log_line(&self) -> String {
        format!(
            "Run {} as of {}: {} calls loaded, {} predictions ({} flagged) at threshold {:.2} ({})",
            self.run_id,
            format_dmy(self.as_of),
            self.records_loaded,
            self.predictions_written,
            self.flagged,
            self.calibration.threshold,
            self.calibration.rule
        )
    }
}

/// A window with rows the store cannot read is a data integrity failure.
fn window_load_error(e: StoreError) -> PipelineError {
    match e {
        StoreError::Validation(msg) => PipelineError::DataIntegrity(msg),
        other => other.into(),
    }
}

/// First and last day loaded for a run as of `as_of`.
pub fn load_window(config: &Config, as_of: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = config
        .pipeline
        .history_days
        .and_then(|days| as_of.checked_sub_days(Days::new(u64::from(days))))
        .unwrap_or_else(earliest_date);
    let end = as_of
        .checked_add_days(Days::new(u64::from(config.pipeline.repeat_days)))
        .unwrap_or(NaiveDate::MAX);
    (start, end)
}

/// Execute one run against an open store.
pub fn execute_run<S: RecordStore + ?Sized>(
    store: &S,
    config: &Config,
    schema: &FeatureSchema,
    as_of: NaiveDate,
) -> Result<RunReport> {
    let run_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("run", id = %run_id, as_of = %format_dmy(as_of));
    let _enter = span.enter();

    let mut progress = RunProgress::connected();
    store.append_log_entry(&format!(
        "Run {} as of {} started and connected to database OK",
        run_id,
        format_dmy(as_of)
    ))?;

    let (window_start, window_end) = load_window(config, as_of);
    tracing::info!(
        start = %format_dmy(window_start),
        end = %format_dmy(window_end),
        "loading call window"
    );

    let records = store
        .fetch_records(window_start, window_end)
        .map_err(window_load_error)?;
    let window = encode(&records, schema)?;
    drop(records);
    let flags = window.repeat_flags();
    let repeats_loaded = flags.iter().filter(|&&r| r).count();
    progress.advance(RunState::DataLoaded)?;
    tracing::info!(
        rows = window.len(),
        columns = window.width(),
        repeats = repeats_loaded,
        "data loaded"
    );

    let min_incident = store.fetch_min_identifier(as_of)?;
    let split = split_at_cutoff(
        &window.incidents,
        &window.attended,
        min_incident,
        start_of_day(as_of),
    )?;
    let partition = reserve_calibration(
        split.model.clone(),
        config.pipeline.calibration_rows,
        config.pipeline.min_training_rows,
    )?;
    tracing::info!(
        model = split.model.len(),
        calibration = partition.calibration.len(),
        prediction = split.prediction.len(),
        "window split"
    );

    let training = partition.training.clone();
    let model = train(
        window.features.slice(s![training.clone(), ..]),
        window.labels.slice(s![training, ..]),
        &config.trainer,
    )?;
    progress.advance(RunState::Trained)?;

    let calibration_rows = partition.calibration.clone();
    let calibration = calibrate(
        &model.network,
        window.features.slice(s![calibration_rows.clone(), ..]),
        &flags[calibration_rows],
        &config.pipeline.threshold_policy(),
    );
    progress.advance(RunState::ThresholdSet)?;

    let prediction = split.prediction.clone();
    let predictions = predict(
        &model.network,
        as_of,
        window.features.slice(s![prediction.clone(), ..]),
        &window.incidents[prediction],
        calibration.threshold,
    );
    let predictions_written = write_predictions(store, as_of, &predictions)?;
    let flagged = predictions.iter().filter(|p| p.predicted).count();
    progress.advance(RunState::Predicted)?;

    let reconciled = reconcile(store, as_of)?;
    progress.advance(RunState::Reconciled)?;

    let mut report = RunReport {
        run_id,
        as_of,
        window_start,
        window_end,
        records_loaded: window.len(),
        repeats_loaded,
        feature_columns: window.width(),
        model_rows: split.model.len(),
        training_rows: model.history.training_rows,
        validation_rows: model.history.validation_rows,
        calibration_rows: partition.calibration.len(),
        prediction_rows: split.prediction.len(),
        epochs: model.history.epochs.len(),
        stopped_early: model.history.stopped_early,
        best_val_loss: model.history.best_val_loss(),
        calibration,
        predictions_written,
        flagged,
        reconciled,
        state: progress.state(),
    };
    store.append_log_entry(&report.log_line())?;
    progress.advance(RunState::Done)?;
    report.state = progress.state();

    tracing::info!(predictions = report.predictions_written, "run complete");
    Ok(report)
}

/// The as-of dates a `run` invocation processes, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    dates: Vec<NaiveDate>,
}

impl Schedule {
    /// A single run for `today - repeat_days`.
    pub fn live(today: NaiveDate, repeat_days: u32) -> Self {
        Self {
            dates: vec![settled_boundary(today, repeat_days)],
        }
    }

    /// Runs from `start - repeat_days` every `interval_days` up to and
    /// including `today - repeat_days`.
    pub fn historical(
        start: NaiveDate,
        interval_days: u32,
        today: NaiveDate,
        repeat_days: u32,
    ) -> Result<Self> {
        if interval_days == 0 {
            return Err(PipelineError::Window("interval must be at least one day".into()));
        }
        let first = settled_boundary(start, repeat_days);
        let last = settled_boundary(today, repeat_days);
        if first > last {
            return Err(PipelineError::Window(format!(
                "start date {} is after today {}",
                format_dmy(start),
                format_dmy(today)
            )));
        }

        let mut dates = Vec::new();
        let mut date = first;
        while date <= last {
            dates.push(date);
            match date.checked_add_days(Days::new(u64::from(interval_days))) {
                Some(next) => date = next,
                None => break,
            }
        }
        Ok(Self { dates })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

fn settled_boundary(date: NaiveDate, repeat_days: u32) -> NaiveDate {
    date.checked_sub_days(Days::new(u64::from(repeat_days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Outcome of a whole schedule: completed runs and runs that failed without
/// stopping the schedule.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub runs: Vec<RunReport>,
    pub failures: Vec<RunFailure>,
}

impl ScheduleReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every date of `schedule`, each in its own store session.
///
/// A run that fails is logged to the store and skipped. Connection
/// failures end the schedule and are returned as the error.
pub fn run_schedule<C: Connector>(
    connector: &C,
    config: &Config,
    schema: &FeatureSchema,
    schedule: &Schedule,
) -> std::result::Result<ScheduleReport, RunFailure> {
    let mut report = ScheduleReport::default();

    for &as_of in schedule.dates() {
        let store = connector
            .connect()
            .map_err(|e| RunFailure::new(as_of, PipelineError::Connection(e.to_string())))?;

        match execute_run(&store, config, schema, as_of) {
            Ok(run) => report.runs.push(run),
            Err(error) if error.is_fatal() => return Err(RunFailure::new(as_of, error)),
            Err(error) => {
                let failure = RunFailure::new(as_of, error);
                tracing::error!(kind = failure.error.kind(), "{}", failure);
                let entry = format!("{}: {}", failure.error.kind(), failure);
                if let Err(log_error) = store.append_log_entry(&entry) {
                    let log_error = PipelineError::from(log_error);
                    if log_error.is_fatal() {
                        return Err(RunFailure::new(as_of, log_error));
                    }
                    tracing::warn!(error = %log_error, "could not record run failure");
                }
                report.failures.push(failure);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use crate::record::{CallRecord, PredictionRecord};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_state_machine_order() {
        let mut progress = RunProgress::connected();
        for state in [
            RunState::DataLoaded,
            RunState::Trained,
            RunState::ThresholdSet,
            RunState::Predicted,
            RunState::Reconciled,
            RunState::Done,
        ] {
            progress.advance(state).unwrap();
        }
        assert_eq!(progress.state(), RunState::Done);
        assert_eq!(RunState::Done.next(), None);
    }

    #[test]
    fn test_state_machine_rejects_skips() {
        let mut progress = RunProgress::connected();
        let err = progress.advance(RunState::Trained).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: RunState::Connected,
                to: RunState::Trained
            }
        ));
        assert_eq!(progress.state(), RunState::Connected);

        progress.advance(RunState::DataLoaded).unwrap();
        assert!(progress.advance(RunState::DataLoaded).is_err());
    }

    #[test]
    fn test_live_schedule_is_one_settled_date() {
        let s = Schedule::live(date(2024, 6, 15), 14);
        assert_eq!(s.dates(), &[date(2024, 6, 1)]);
    }

    #[test]
    fn test_historical_schedule_steps_to_boundary() {
        let s = Schedule::historical(date(2024, 1, 15), 7, date(2024, 2, 12), 14).unwrap();
        assert_eq!(
            s.dates(),
            &[date(2024, 1, 1), date(2024, 1, 8), date(2024, 1, 15), date(2024, 1, 22), date(2024, 1, 29)]
        );
    }

    #[test]
    fn test_historical_schedule_validation() {
        assert!(Schedule::historical(date(2024, 1, 15), 0, date(2024, 2, 12), 14).is_err());
        assert!(Schedule::historical(date(2024, 3, 1), 7, date(2024, 2, 12), 14).is_err());
        let same = Schedule::historical(date(2024, 2, 12), 7, date(2024, 2, 12), 14).unwrap();
        assert_eq!(same.len(), 1);
    }

    #[test]
    fn test_load_window() {
        let mut config = Config::default();
        let as_of = date(2024, 3, 1);
        assert_eq!(load_window(&config, as_of), (earliest_date(), date(2024, 3, 15)));
        config.pipeline.history_days = Some(29);
        assert_eq!(load_window(&config, as_of).0, date(2024, 1, 31));
    }

    /// Store with a fixed set of calls that records what the pipeline logs.
    struct MemoryStore {
        calls: Vec<CallRecord>,
        unreadable: bool,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl RecordStore for MemoryStore {
        fn fetch_records(&self, _start: NaiveDate, _end: NaiveDate) -> StoreResult<Vec<CallRecord>> {
            if self.unreadable {
                return Err(StoreError::Validation("incident 7: Invalid timestamp '2024-01-01 9:00'".into()));
            }
            Ok(self.calls.clone())
        }
        fn fetch_min_identifier(&self, _since: NaiveDate) -> StoreResult<Option<i64>> {
            Ok(None)
        }
        fn purge_predictions(&self, _run_date: NaiveDate) -> StoreResult<usize> {
            Ok(0)
        }
        fn insert_prediction(&self, _record: &PredictionRecord) -> StoreResult<()> {
            Ok(())
        }
        fn update_actual_and_correctness(&self, _run_date: NaiveDate) -> StoreResult<ReconcileSummary> {
            Ok(ReconcileSummary::default())
        }
        fn append_log_entry(&self, message: &str) -> StoreResult<()> {
            self.log.borrow_mut().push(message.to_string());
            Ok(())
        }
    }

    struct MemoryConnector {
        reachable: bool,
        unreadable: bool,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Connector for MemoryConnector {
        type Store = MemoryStore;

        fn connect(&self) -> StoreResult<MemoryStore> {
            if !self.reachable {
                return Err(StoreError::Connection("refused".into()));
            }
            Ok(MemoryStore {
                calls: Vec::new(),
                unreadable: self.unreadable,
                log: Rc::clone(&self.log),
            })
        }
    }

    #[test]
    fn test_per_run_failures_are_logged_and_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let connector = MemoryConnector {
            reachable: true,
            unreadable: false,
            log: Rc::clone(&log),
        };
        let schedule = Schedule::historical(date(2024, 1, 15), 7, date(2024, 1, 29), 14).unwrap();
        let report = run_schedule(&connector, &Config::default(), &FeatureSchema::standard(), &schedule)
            .unwrap();

        assert!(report.runs.is_empty());
        assert_eq!(report.failures.len(), 3);
        assert!(!report.all_succeeded());
        // An empty window is a data integrity failure
        assert!(matches!(report.failures[0].error, PipelineError::DataIntegrity(_)));
        assert_eq!(report.failures[0].as_of, date(2024, 1, 1));

        // Each run logs its start, then its failure
        let log = log.borrow();
        assert_eq!(log.len(), 6);
        assert!(log[0].contains("started and connected to database OK"));
        assert!(log[0].contains("01/01/2024"));
        assert!(log[1].starts_with("DataIntegrityError"));
        assert!(log[1].contains("01/01/2024"));
    }

    #[test]
    fn test_unreadable_rows_are_a_data_integrity_failure() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let connector = MemoryConnector {
            reachable: true,
            unreadable: true,
            log: Rc::clone(&log),
        };
        let schedule = Schedule::live(date(2024, 1, 15), 14);
        let report = run_schedule(&connector, &Config::default(), &FeatureSchema::standard(), &schedule)
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        let error = &report.failures[0].error;
        assert!(matches!(error, PipelineError::DataIntegrity(_)), "got {:?}", error);
        assert!(!error.is_fatal());
        assert!(log.borrow()[1].starts_with("DataIntegrityError: "));
    }

    #[test]
    fn test_connection_failure_aborts_schedule() {
        let connector = MemoryConnector {
            reachable: false,
            unreadable: false,
            log: Rc::new(RefCell::new(Vec::new())),
        };
        let schedule = Schedule::historical(date(2024, 1, 15), 7, date(2024, 1, 29), 14).unwrap();
        let failure = run_schedule(&connector, &Config::default(), &FeatureSchema::standard(), &schedule)
            .unwrap_err();
        assert!(failure.is_fatal());
        assert_eq!(failure.as_of, date(2024, 1, 1));
    }
}
