//! Feature encoding
//!
//! Turns a loaded window of call records into a numeric feature matrix and a
//! two-class label matrix. Categorical values are prefixed with their field
//! name and one-hot expanded; numeric values are imputed and standardised.
//!
//! The column set and the scaler are derived once from the whole window and
//! frozen for the run. Fitting the scaler over every row (including the rows
//! that are later predicted) mirrors how the model has always been built.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;
use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewMut2, Axis};

use crate::error::{PipelineError, Result};
use crate::record::{CallRecord, FeatureSchema};

/// Value substituted for a missing numeric field.
pub const MISSING_NUMERIC: f64 = -1.0;

/// Zero-mean / unit-variance scaler fit column by column.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    means: Array1<f64>,
    scales: Array1<f64>,
}

impl StandardScaler {
    /// Fit on every row of `x`. Constant columns get a scale of 1.
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let cols = x.ncols();
        if x.nrows() == 0 {
            return Self {
                means: Array1::zeros(cols),
                scales: Array1::ones(cols),
            };
        }
        let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(cols));
        let scales = x.std_axis(Axis(0), 0.0).mapv(|sd| if sd > f64::EPSILON { sd } else { 1.0 });
        Self { means, scales }
    }

    pub fn transform(&self, mut x: ArrayViewMut2<f64>) {
        for mut row in x.rows_mut() {
            row -= &self.means;
            row /= &self.scales;
        }
    }

    pub fn means(&self) -> &Array1<f64> {
        &self.means
    }

    pub fn scales(&self) -> &Array1<f64> {
        &self.scales
    }
}

/// An encoded window: features, labels and the identifiers they belong to, in record order.
#[derive(Debug, Clone)]
pub struct EncodedWindow {
    pub features: Array2<f64>,
    pub labels: Array2<f64>,
    pub incidents: Vec<i64>,
    pub attended: Vec<NaiveDateTime>,
    /// Column names: numeric fields first, then `field-value` indicator columns.
    pub columns: Vec<String>,
    pub numeric_columns: usize,
    pub scaler: StandardScaler,
}

impl EncodedWindow {
    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Ground truth of each row as a flag.
    pub fn repeat_flags(&self) -> Vec<bool> {
        self.labels.column(1).iter().map(|&v| v > 0.5).collect()
    }
}

/// Token written into the one-hot column name for one categorical value.
pub fn category_token(field: &str, value: Option<&str>) -> String {
    format!("{}-{}", field, value.unwrap_or("None"))
}

/// Encode `records` (already in identifier order) against `schema`.
pub fn encode(records: &[CallRecord], schema: &FeatureSchema) -> Result<EncodedWindow> {
    if records.is_empty() {
        return Err(PipelineError::DataIntegrity(
            "no call records in the loaded window".to_string(),
        ));
    }

    for r in records {
        if r.categoricals.len() != schema.categoricals.len()
            || r.numerics.len() != schema.numerics.len()
        {
            return Err(PipelineError::DataIntegrity(format!(
                "incident {} has {} categorical and {} numeric values, schema expects {} and {}",
                r.incident,
                r.categoricals.len(),
                r.numerics.len(),
                schema.categoricals.len(),
                schema.numerics.len()
            )));
        }
    }

    // Distinct tokens per categorical field, sorted for a stable column order
    let mut vocabularies: Vec<BTreeSet<String>> = Vec::with_capacity(schema.categoricals.len());
    for (f, field) in schema.categoricals.iter().enumerate() {
        if records.iter().all(|r| r.categoricals[f].is_none()) {
            return Err(PipelineError::DataIntegrity(format!(
                "categorical field {} has only null values",
                field
            )));
        }
        let vocab = records
            .iter()
            .map(|r| category_token(field, r.categoricals[f].as_deref()))
            .collect();
        vocabularies.push(vocab);
    }

    let numeric_columns = schema.numerics.len();
    let mut columns: Vec<String> = schema.numerics.clone();
    let mut offsets: Vec<HashMap<String, usize>> = Vec::with_capacity(vocabularies.len());
    for vocab in &vocabularies {
        let mut index = HashMap::with_capacity(vocab.len());
        for token in vocab {
            index.insert(token.clone(), columns.len());
            columns.push(token.clone());
        }
        offsets.push(index);
    }

    let n = records.len();
    let mut features = Array2::<f64>::zeros((n, columns.len()));
    let mut labels = Array2::<f64>::zeros((n, 2));

    for (i, r) in records.iter().enumerate() {
        for (j, value) in r.numerics.iter().enumerate() {
            features[(i, j)] = match value {
                Some(v) if v.is_finite() => *v,
                _ => MISSING_NUMERIC,
            };
        }
        for (f, field) in schema.categoricals.iter().enumerate() {
            let token = category_token(field, r.categoricals[f].as_deref());
            let col = offsets[f].get(&token).copied().ok_or_else(|| {
                PipelineError::DataIntegrity(format!("unindexed category {}", token))
            })?;
            features[(i, col)] = 1.0;
        }
        let class = usize::from(r.repeated == Some(true));
        labels[(i, class)] = 1.0;
    }

    let scaler = StandardScaler::fit(features.slice(s![.., ..numeric_columns]));
    scaler.transform(features.slice_mut(s![.., ..numeric_columns]));

    tracing::debug!(
        rows = n,
        columns = columns.len(),
        numeric = numeric_columns,
        "encoded call window"
    );

    Ok(EncodedWindow {
        features,
        labels,
        incidents: records.iter().map(|r| r.incident).collect(),
        attended: records.iter().map(|r| r.attend_at).collect(),
        columns,
        numeric_columns,
        scaler,
    })
}
