//! Window splitting
//!
//! Splits an encoded window at the prediction cutoff, and carves the
//! calibration slice off the tail of the model region.

use std::ops::Range;

use chrono::NaiveDateTime;

use crate::error::{PipelineError, Result};

/// Row ranges of an encoded window on either side of the prediction cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSplit {
    /// Rows whose outcome is settled.
    pub model: Range<usize>,
    /// Rows attended on or after the prediction date.
    pub prediction: Range<usize>,
}

/// Reject windows whose identifiers are not strictly increasing or whose
/// attend times go backwards along identifier order.
pub fn check_ordering(incidents: &[i64], attended: &[NaiveDateTime]) -> Result<()> {
    if incidents.len() != attended.len() {
        return Err(PipelineError::Window(format!(
            "{} identifiers but {} attend times",
            incidents.len(),
            attended.len()
        )));
    }
    for i in 1..incidents.len() {
        if incidents[i] <= incidents[i - 1] {
            return Err(PipelineError::Window(format!(
                "incident {} at row {} does not follow incident {}",
                incidents[i],
                i,
                incidents[i - 1]
            )));
        }
        if attended[i] < attended[i - 1] {
            return Err(PipelineError::Window(format!(
                "incident {} attended {} before preceding incident {} ({})",
                incidents[i],
                attended[i],
                incidents[i - 1],
                attended[i - 1]
            )));
        }
    }
    Ok(())
}

/// Split at the first row whose identifier is at least `min_incident`.
///
/// `predict_from` is the start of the prediction date; the identifier
/// boundary must agree with the attend-time boundary.
pub fn split_at_cutoff(
    incidents: &[i64],
    attended: &[NaiveDateTime],
    min_incident: Option<i64>,
    predict_from: NaiveDateTime,
) -> Result<WindowSplit> {
    let min_incident = min_incident.ok_or_else(|| {
        PipelineError::Window(format!("no calls attended on or after {}", predict_from))
    })?;

    check_ordering(incidents, attended)?;

    let cutoff = incidents.partition_point(|&id| id < min_incident);
    if cutoff == incidents.len() {
        return Err(PipelineError::Window(format!(
            "minimum prediction incident {} lies beyond the loaded window",
            min_incident
        )));
    }

    let by_time = attended.partition_point(|&t| t < predict_from);
    if by_time != cutoff {
        return Err(PipelineError::Window(format!(
            "incident cutoff at row {} disagrees with attend-time cutoff at row {}",
            cutoff, by_time
        )));
    }

    Ok(WindowSplit {
        model: 0..cutoff,
        prediction: cutoff..incidents.len(),
    })
}

/// The model region divided into what the trainer sees and the calibration slice it never sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPartition {
    pub training: Range<usize>,
    pub calibration: Range<usize>,
}

/// Reserve the most recent `calibration_rows` of `model` for threshold calibration.
pub fn reserve_calibration(
    model: Range<usize>,
    calibration_rows: usize,
    min_training_rows: usize,
) -> Result<ModelPartition> {
    let needed = calibration_rows + min_training_rows;
    if model.len() < needed {
        return Err(PipelineError::Training(format!(
            "model region has {} rows, need at least {} ({} calibration + {} training)",
            model.len(),
            needed,
            calibration_rows,
            min_training_rows
        )));
    }
    let split = model.end - calibration_rows;
    Ok(ModelPartition {
        training: model.start..split,
        calibration: split..model.end,
    })
}
