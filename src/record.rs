//! Call and prediction records
//!
//! A `CallRecord` carries its categorical and numeric values positionally,
//! aligned with the `FeatureSchema` that loaded it.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Categorical descriptors of a call, in store column order.
pub const CATEGORICAL_FIELDS: &[&str] = &[
    "BusinessType",
    "Manufacturer",
    "ProductId",
    "DeviceType",
    "LastOtherCallType",
    "CreatedBy",
    "CreatedDay",
    "AttendDay",
    "PostCodeArea",
    "FirstEngineer",
    "SymptomCodeId",
];

/// Continuous fields of a call, in store column order.
pub const NUMERIC_FIELDS: &[&str] = &[
    "DeviceAgeDays",
    "DaysSinceInstall",
    "DaysSinceLastBreak",
    "DaysSinceLastOtherCall",
    "MeterTotal",
    "MeterSinceLastCall",
];

/// Names of the feature-bearing fields of a record set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    pub categoricals: Vec<String>,
    pub numerics: Vec<String>,
}

impl FeatureSchema {
    pub fn new<C, N>(categoricals: C, numerics: N) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            categoricals: categoricals.into_iter().map(Into::into).collect(),
            numerics: numerics.into_iter().map(Into::into).collect(),
        }
    }

    /// The schema of the `call_analysis` table.
    pub fn standard() -> Self {
        Self::new(CATEGORICAL_FIELDS.iter().copied(), NUMERIC_FIELDS.iter().copied())
    }
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self::standard()
    }
}

/// One attended service call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub incident: i64,
    pub attend_at: NaiveDateTime,
    pub categoricals: Vec<Option<String>>,
    pub numerics: Vec<Option<f64>>,
    /// Ground truth. `None` while the repeat window is still open.
    pub repeated: Option<bool>,
}

/// Correctness of a prediction once its outcome is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Correct,
    Incorrect,
    Pending,
}

impl Verdict {
    pub fn judge(predicted: bool, actual: Option<bool>) -> Self {
        match actual {
            Some(a) if a == predicted => Verdict::Correct,
            Some(_) => Verdict::Incorrect,
            None => Verdict::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Correct => "CORRECT",
            Verdict::Incorrect => "INCORRECT",
            Verdict::Pending => "PENDING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CORRECT" => Some(Verdict::Correct),
            "INCORRECT" => Some(Verdict::Incorrect),
            "PENDING" => Some(Verdict::Pending),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted per-call prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub run_date: NaiveDate,
    pub incident: i64,
    pub threshold: f64,
    pub predicted: bool,
    pub confidence: f64,
    pub actual: Option<bool>,
    pub verdict: Option<Verdict>,
}

/// Counts produced by reconciling one run date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub correct: usize,
    pub incorrect: usize,
    pub pending: usize,
}

impl ReconcileSummary {
    pub fn add(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Correct => self.correct += 1,
            Verdict::Incorrect => self.incorrect += 1,
            Verdict::Pending => self.pending += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.correct + self.incorrect + self.pending
    }
}
