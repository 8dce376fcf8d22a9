//! Export utilities for stored predictions
//!
//! Renders the predictions of one run date as a text table, JSON or CSV, and
//! summarises how the reconciled ones performed.

use crate::calibrate::fraction;
use crate::dates::format_dmy;
use crate::record::{PredictionRecord, Verdict};
use serde::Serialize;
use std::fmt::Write;

/// Output format for `predictions`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Table,
    Json,
    Csv,
}

/// How a run's reconciled predictions performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Performance {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
    pub pending: usize,
}

impl Performance {
    pub fn from_records(records: &[PredictionRecord]) -> Self {
        let mut perf = Self::default();
        for record in records {
            match (record.predicted, record.actual) {
                (true, Some(true)) => perf.true_positives += 1,
                (true, Some(false)) => perf.false_positives += 1,
                (false, Some(false)) => perf.true_negatives += 1,
                (false, Some(true)) => perf.false_negatives += 1,
                (_, None) => perf.pending += 1,
            }
        }
        perf
    }

    pub fn resolved(&self) -> usize {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    pub fn precision(&self) -> Option<f64> {
        fraction(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> Option<f64> {
        fraction(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn accuracy(&self) -> Option<f64> {
        fraction(self.true_positives + self.true_negatives, self.resolved())
    }
}

fn percent(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}%", v * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

fn flag(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "yes",
        Some(false) => "no",
        None => "-",
    }
}

fn verdict_text(verdict: Option<Verdict>) -> &'static str {
    verdict.map(|v| v.as_str()).unwrap_or("-")
}

/// Aligned text table, one row per prediction
pub fn predictions_table(records: &[PredictionRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>10}  {:>10}  {:>9}  {:>9}  {:>6}  {:>9}",
        "INCIDENT", "CONFIDENCE", "THRESHOLD", "PREDICTED", "ACTUAL", "VERDICT"
    );
    for r in records {
        let _ = writeln!(
            out,
            "{:>10}  {:>10.4}  {:>9.2}  {:>9}  {:>6}  {:>9}",
            r.incident,
            r.confidence,
            r.threshold,
            if r.predicted { "REPEAT" } else { "-" },
            flag(r.actual),
            verdict_text(r.verdict)
        );
    }
    out
}

/// CSV with a header row
pub fn predictions_csv(records: &[PredictionRecord]) -> String {
    let mut out = String::from("prediction_date,incident,threshold,predicted,confidence,actual,correct\n");
    for r in records {
        let actual = r.actual.map(|a| a.to_string()).unwrap_or_default();
        let verdict = r.verdict.map(|v| v.as_str()).unwrap_or_default();
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{}",
            format_dmy(r.run_date),
            r.incident,
            r.threshold,
            r.predicted,
            r.confidence,
            actual,
            verdict
        );
    }
    out
}

#[derive(Serialize)]
struct PredictionExport<'a> {
    prediction_date: String,
    performance: Performance,
    predictions: &'a [PredictionRecord],
}

/// Pretty JSON with the performance summary alongside the rows
pub fn predictions_json(
    run_date: chrono::NaiveDate,
    records: &[PredictionRecord],
) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&PredictionExport {
        prediction_date: format_dmy(run_date),
        performance: Performance::from_records(records),
        predictions: records,
    })
}

/// Human summary printed under the table
pub fn performance_summary(perf: &Performance) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Resolved: {}  Pending: {}  TP: {}  FP: {}  TN: {}  FN: {}",
        perf.resolved(),
        perf.pending,
        perf.true_positives,
        perf.false_positives,
        perf.true_negatives,
        perf.false_negatives
    );
    let _ = writeln!(
        out,
        "Precision: {}  Recall: {}  Accuracy: {}",
        percent(perf.precision()),
        percent(perf.recall()),
        percent(perf.accuracy())
    );
    out
}
