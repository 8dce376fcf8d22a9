//! Record store interface
//!
//! The pipeline talks to storage only through [`RecordStore`]. A
//! [`Connector`] opens one store per run so that a run's session is scoped to
//! the run.

use chrono::NaiveDate;

use crate::error::StoreResult;
use crate::record::{CallRecord, PredictionRecord, ReconcileSummary};

pub trait RecordStore {
    /// Calls attended from the start of `start` up to the end of `end`, in identifier order.
    fn fetch_records(&self, start: NaiveDate, end: NaiveDate) -> StoreResult<Vec<CallRecord>>;

    /// Smallest identifier attended on or after `since`, if any.
    fn fetch_min_identifier(&self, since: NaiveDate) -> StoreResult<Option<i64>>;

    /// Delete every prediction stored for `run_date`. Returns the number removed.
    fn purge_predictions(&self, run_date: NaiveDate) -> StoreResult<usize>;

    fn insert_prediction(&self, record: &PredictionRecord) -> StoreResult<()>;

    fn insert_predictions(&self, records: &[PredictionRecord]) -> StoreResult<usize> {
        for record in records {
            self.insert_prediction(record)?;
        }
        Ok(records.len())
    }

    /// Fill in actual outcome and verdict for every prediction of `run_date`.
    fn update_actual_and_correctness(&self, run_date: NaiveDate) -> StoreResult<ReconcileSummary>;

    fn append_log_entry(&self, message: &str) -> StoreResult<()>;
}

/// Opens record store sessions.
pub trait Connector {
    type Store: RecordStore;

    fn connect(&self) -> StoreResult<Self::Store>;
}
