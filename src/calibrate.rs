//! Decision threshold calibration
//!
//! Scores the reserved calibration slice and walks thresholds 0.01..=0.99 in
//! ascending order. The first rule to fire picks the threshold:
//!
//! 1. no true positives at this threshold: return 1.0 (never predict repeat)
//! 2. no false positives at this threshold: return it
//! 3. TP/FP ratio has reached the target: return it
//!
//! If none fires the threshold with the best ratio seen is used.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::network::Classifier;

/// Threshold returned when no positive threshold carries signal.
pub const NEVER_PREDICT: f64 = 1.0;

/// Threshold used when the scan saw no ratio at all.
pub const FALLBACK_THRESHOLD: f64 = 0.99;

const STEPS: u32 = 99;

/// Which rule selected the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    NoTruePositives,
    NoFalsePositives,
    TargetRatio,
    BestRatio,
    Fallback,
}

impl std::fmt::Display for SelectionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SelectionRule::NoTruePositives => "no true positives",
            SelectionRule::NoFalsePositives => "no false positives",
            SelectionRule::TargetRatio => "target TP/FP ratio",
            SelectionRule::BestRatio => "best TP/FP ratio",
            SelectionRule::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

/// Confusion counts at one threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Confusion {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

/// `numerator / denominator`, or `None` for an empty denominator.
pub(crate) fn fraction(numerator: usize, denominator: usize) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

impl Confusion {
    pub fn tally(scores: &[f64], actual: &[bool], threshold: f64) -> Self {
        let mut c = Confusion::default();
        for (&score, &repeat) in scores.iter().zip(actual) {
            match (score >= threshold, repeat) {
                (true, true) => c.true_positives += 1,
                (true, false) => c.false_positives += 1,
                (false, false) => c.true_negatives += 1,
                (false, true) => c.false_negatives += 1,
            }
        }
        c
    }

    /// TP/FP. Only meaningful when there is at least one false positive.
    pub fn ratio(&self) -> Option<f64> {
        fraction(self.true_positives, self.false_positives)
    }

    pub fn precision(&self) -> Option<f64> {
        fraction(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> Option<f64> {
        fraction(self.true_positives, self.true_positives + self.false_negatives)
    }
}

/// Calibrator settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    /// TP/FP ratio that is good enough to stop the scan.
    pub target_ratio: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self { target_ratio: 2.0 }
    }
}

/// Outcome of calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Calibration {
    pub threshold: f64,
    pub rule: SelectionRule,
    /// Counts at the selected threshold over the calibration slice.
    pub confusion: Confusion,
}

fn candidate(step: u32) -> f64 {
    f64::from(step) / 100.0
}

/// Choose a threshold from calibration-slice scores and their ground truth.
pub fn select_threshold(scores: &[f64], actual: &[bool], policy: &ThresholdPolicy) -> Calibration {
    let mut best: Option<(f64, f64)> = None;

    for step in 1..=STEPS {
        let t = candidate(step);
        let c = Confusion::tally(scores, actual, t);

        if c.true_positives == 0 {
            return Calibration {
                threshold: NEVER_PREDICT,
                rule: SelectionRule::NoTruePositives,
                confusion: Confusion::tally(scores, actual, NEVER_PREDICT),
            };
        }
        if c.false_positives == 0 {
            return Calibration {
                threshold: t,
                rule: SelectionRule::NoFalsePositives,
                confusion: c,
            };
        }
        if let Some(ratio) = c.ratio() {
            if best.map_or(true, |(_, r)| ratio > r) {
                best = Some((t, ratio));
            }
            if ratio >= policy.target_ratio {
                return Calibration {
                    threshold: t,
                    rule: SelectionRule::TargetRatio,
                    confusion: c,
                };
            }
        }
    }

    let (threshold, rule) = match best {
        Some((t, _)) => (t, SelectionRule::BestRatio),
        None => (FALLBACK_THRESHOLD, SelectionRule::Fallback),
    };
    Calibration {
        threshold,
        rule,
        confusion: Confusion::tally(scores, actual, threshold),
    }
}

/// Score the calibration slice with `model` and select a threshold.
pub fn calibrate<C: Classifier + ?Sized>(
    model: &C,
    features: ArrayView2<f64>,
    actual: &[bool],
    policy: &ThresholdPolicy,
) -> Calibration {
    let scores = model.positive_scores(features).to_vec();
    let calibration = select_threshold(&scores, actual, policy);
    tracing::info!(
        threshold = calibration.threshold,
        rule = %calibration.rule,
        tp = calibration.confusion.true_positives,
        fp = calibration.confusion.false_positives,
        "calibrated decision threshold"
    );
    calibration
}
