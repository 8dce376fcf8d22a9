//! Prediction writing and outcome reconciliation

use chrono::NaiveDate;
use ndarray::ArrayView2;

use crate::error::Result;
use crate::gateway::RecordStore;
use crate::network::Classifier;
use crate::record::{PredictionRecord, ReconcileSummary};

/// One prediction per row of the prediction region, in row order.
pub fn build_predictions(
    run_date: NaiveDate,
    incidents: &[i64],
    scores: &[f64],
    threshold: f64,
) -> Vec<PredictionRecord> {
    incidents
        .iter()
        .zip(scores)
        .map(|(&incident, &score)| PredictionRecord {
            run_date,
            incident,
            threshold,
            predicted: score >= threshold,
            confidence: score,
            actual: None,
            verdict: None,
        })
        .collect()
}

/// Score the prediction region and build its records.
pub fn predict<C: Classifier + ?Sized>(
    model: &C,
    run_date: NaiveDate,
    features: ArrayView2<f64>,
    incidents: &[i64],
    threshold: f64,
) -> Vec<PredictionRecord> {
    let scores = model.positive_scores(features).to_vec();
    build_predictions(run_date, incidents, &scores, threshold)
}

/// Replace whatever is stored for `run_date` with `records`.
pub fn write_predictions<S: RecordStore + ?Sized>(
    store: &S,
    run_date: NaiveDate,
    records: &[PredictionRecord],
) -> Result<usize> {
    let purged = store.purge_predictions(run_date)?;
    if purged > 0 {
        tracing::info!(purged, %run_date, "replaced earlier predictions");
    }
    let written = store.insert_predictions(records)?;
    let flagged = records.iter().filter(|r| r.predicted).count();
    tracing::info!(written, flagged, %run_date, "predictions written");
    Ok(written)
}

/// Set actual outcomes and verdicts for the predictions of `run_date`.
pub fn reconcile<S: RecordStore + ?Sized>(store: &S, run_date: NaiveDate) -> Result<ReconcileSummary> {
    let summary = store.update_actual_and_correctness(run_date)?;
    tracing::info!(
        correct = summary.correct,
        incorrect = summary.incorrect,
        pending = summary.pending,
        %run_date,
        "reconciled predictions"
    );
    Ok(summary)
}
