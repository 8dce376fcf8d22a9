//! Model training
//!
//! One parameterised trainer for every run type. The rows handed to
//! [`train`] must already exclude the calibration slice; they are shuffled
//! into training and validation partitions with a seeded generator so a run
//! is reproducible.

use ndarray::{Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::network::{Adam, Network};

/// Network shape and optimisation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Prepend a hidden layer as wide as the feature matrix.
    pub mirror_input_layer: bool,
    pub hidden_layers: Vec<usize>,
    /// Dropout rate after the first hidden layer.
    pub dropout: f64,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Epochs without validation improvement before stopping.
    pub patience: usize,
    /// Smallest drop in validation loss that counts as an improvement.
    pub min_delta: f64,
    pub train_fraction: f64,
    pub seed: u64,
    pub restore_best_weights: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            mirror_input_layer: true,
            hidden_layers: vec![1000, 200, 100, 50, 10],
            dropout: 0.5,
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            batch_size: 32,
            max_epochs: 50,
            patience: 5,
            min_delta: 0.0,
            train_fraction: 0.8,
            seed: 42,
            restore_best_weights: false,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(format!(
                "train_fraction must be in (0, 1), got {}",
                self.train_fraction
            ));
        }
        if self.batch_size == 0 || self.max_epochs == 0 {
            return Err("batch_size and max_epochs must be positive".to_string());
        }
        if self.hidden_layers.iter().any(|&w| w == 0) {
            return Err("hidden layer widths must be positive".to_string());
        }
        if self.learning_rate <= 0.0 {
            return Err("learning_rate must be positive".to_string());
        }
        Ok(())
    }

    /// Layer widths from input to the two-class output.
    pub fn layer_widths(&self, inputs: usize) -> Vec<usize> {
        let mut widths = vec![inputs];
        if self.mirror_input_layer {
            widths.push(inputs);
        }
        widths.extend(self.hidden_layers.iter().copied());
        widths.push(2);
        widths
    }
}

/// Tracks validation loss and decides when to stop.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: f64::INFINITY,
            best_epoch: 0,
            wait: 0,
        }
    }

    /// Record the loss of `epoch`. Returns true once training should stop.
    pub fn observe(&mut self, epoch: usize, loss: f64) -> bool {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.best_epoch = epoch;
            self.wait = 0;
            false
        } else {
            self.wait += 1;
            self.wait >= self.patience
        }
    }

    pub fn improved_at(&self, epoch: usize) -> bool {
        self.best_epoch == epoch && self.wait == 0
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochStats>,
    pub stopped_early: bool,
    pub training_rows: usize,
    pub validation_rows: usize,
}

impl TrainingHistory {
    pub fn best_val_loss(&self) -> Option<f64> {
        self.epochs.iter().map(|e| e.val_loss).reduce(f64::min)
    }
}

/// A fitted network plus the trace that produced it.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub network: Network,
    pub history: TrainingHistory,
}

/// Smallest number of rows that still leaves one row in each partition.
const MIN_ROWS: usize = 2;

/// Fit a classifier on `features` / one-hot `labels`.
pub fn train(
    features: ArrayView2<f64>,
    labels: ArrayView2<f64>,
    config: &TrainerConfig,
) -> Result<TrainedModel> {
    config.validate().map_err(PipelineError::Training)?;

    let n = features.nrows();
    if n != labels.nrows() {
        return Err(PipelineError::Training(format!(
            "{} feature rows but {} label rows",
            n,
            labels.nrows()
        )));
    }
    if n < MIN_ROWS {
        return Err(PipelineError::Training(format!(
            "need at least {} rows to train, got {}",
            MIN_ROWS, n
        )));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);
    let train_rows = ((n as f64 * config.train_fraction).round() as usize).clamp(1, n - 1);
    let (train_idx, val_idx) = order.split_at(train_rows);

    let x_train = features.select(Axis(0), train_idx);
    let y_train = labels.select(Axis(0), train_idx);
    let x_val = features.select(Axis(0), val_idx);
    let y_val = labels.select(Axis(0), val_idx);

    let widths = config.layer_widths(features.ncols());
    let mut network = Network::new(&widths, config.dropout, &mut rng);
    let mut optimiser = Adam::new(
        &network,
        config.learning_rate,
        config.beta1,
        config.beta2,
        config.epsilon,
    );

    tracing::info!(
        layers = ?network.widths(),
        parameters = network.parameter_count(),
        training = x_train.nrows(),
        validation = x_val.nrows(),
        "training classifier"
    );

    let mut history = TrainingHistory {
        training_rows: x_train.nrows(),
        validation_rows: x_val.nrows(),
        ..TrainingHistory::default()
    };
    let mut stopper = EarlyStopping::new(config.patience, config.min_delta);
    let mut best_network: Option<Network> = None;
    let mut batch_order: Vec<usize> = (0..x_train.nrows()).collect();

    for epoch in 1..=config.max_epochs {
        batch_order.shuffle(&mut rng);
        let mut loss_sum = 0.0;
        for chunk in batch_order.chunks(config.batch_size) {
            let xb: Array2<f64> = x_train.select(Axis(0), chunk);
            let yb: Array2<f64> = y_train.select(Axis(0), chunk);
            let (loss, grads) = network.backprop(xb.view(), yb.view(), &mut rng);
            optimiser.apply(&mut network, &grads);
            loss_sum += loss * chunk.len() as f64;
        }

        let (val_loss, val_accuracy) = network.evaluate(x_val.view(), y_val.view());
        let stats = EpochStats {
            epoch,
            train_loss: loss_sum / x_train.nrows() as f64,
            val_loss,
            val_accuracy,
        };
        tracing::debug!(
            epoch,
            train_loss = stats.train_loss,
            val_loss,
            val_accuracy,
            "epoch complete"
        );
        history.epochs.push(stats);

        let stop = stopper.observe(epoch, val_loss);
        if config.restore_best_weights && stopper.improved_at(epoch) {
            best_network = Some(network.clone());
        }
        if stop {
            history.stopped_early = true;
            tracing::info!(
                epoch,
                best_epoch = stopper.best_epoch(),
                best_val_loss = stopper.best(),
                "early stopping"
            );
            break;
        }
    }

    if let Some(best) = best_network {
        network = best;
    }

    Ok(TrainedModel { network, history })
}
