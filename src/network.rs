//! Feed-forward classifier
//!
//! A fully connected network with ReLU hidden layers, optional dropout after
//! the first hidden layer, and a two-way softmax output trained against
//! categorical cross-entropy with Adam.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::Rng;

/// Anything that can score rows of a feature matrix.
pub trait Classifier {
    /// Probability of the positive ("repeat") class for every row.
    fn positive_scores(&self, features: ArrayView2<f64>) -> Array1<f64>;
}

/// Clamp applied to probabilities before taking logs.
const PROB_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone)]
pub struct Dense {
    pub(crate) weights: Array2<f64>,
    pub(crate) bias: Array1<f64>,
}

impl Dense {
    /// Glorot-uniform weights, zero bias.
    fn new<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
        let weights = Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..limit));
        Self {
            weights,
            bias: Array1::zeros(fan_out),
        }
    }

    fn apply(&self, input: ArrayView2<f64>) -> Array2<f64> {
        input.dot(&self.weights) + &self.bias
    }
}

/// Gradient of the loss with respect to one dense layer.
#[derive(Debug, Clone)]
pub struct Gradient {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct Network {
    pub(crate) layers: Vec<Dense>,
    dropout: f64,
}

/// Intermediate values of a training forward pass.
struct Trace {
    /// `inputs[l]` is what layer `l` consumed; `inputs[0]` is the batch itself.
    inputs: Vec<Array2<f64>>,
    /// ReLU output of each hidden layer, before dropout.
    activated: Vec<Array2<f64>>,
    /// Scaled keep-mask of each hidden layer that had dropout applied.
    masks: Vec<Option<Array2<f64>>>,
    probs: Array2<f64>,
}

impl Network {
    /// Build a network with the given layer widths, input first and output last.
    pub fn new<R: Rng + ?Sized>(widths: &[usize], dropout: f64, rng: &mut R) -> Self {
        let layers = widths
            .windows(2)
            .map(|w| Dense::new(w[0], w[1], rng))
            .collect();
        Self { layers, dropout }
    }

    pub fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.layers.iter().map(|l| l.weights.nrows()).collect();
        if let Some(last) = self.layers.last() {
            widths.push(last.weights.ncols());
        }
        widths
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    /// Class probabilities, one row per input row. Dropout is not applied.
    pub fn predict_proba(&self, features: ArrayView2<f64>) -> Array2<f64> {
        let last = self.layers.len().saturating_sub(1);
        let mut current = features.to_owned();
        for (l, layer) in self.layers.iter().enumerate() {
            let z = layer.apply(current.view());
            current = if l == last { softmax(z) } else { relu(z) };
        }
        current
    }

    /// Mean categorical cross-entropy and accuracy against one-hot `labels`.
    pub fn evaluate(&self, features: ArrayView2<f64>, labels: ArrayView2<f64>) -> (f64, f64) {
        let probs = self.predict_proba(features);
        let loss = cross_entropy(probs.view(), labels);
        let hits = probs
            .rows()
            .into_iter()
            .zip(labels.rows())
            .filter(|(p, y)| argmax(p.iter()) == argmax(y.iter()))
            .count();
        let accuracy = if labels.nrows() == 0 {
            0.0
        } else {
            hits as f64 / labels.nrows() as f64
        };
        (loss, accuracy)
    }

    fn forward_train<R: Rng + ?Sized>(&self, batch: ArrayView2<f64>, rng: &mut R) -> Trace {
        let last = self.layers.len() - 1;
        let mut inputs = vec![batch.to_owned()];
        let mut activated = Vec::with_capacity(last);
        let mut masks = Vec::with_capacity(last);
        let mut probs = Array2::zeros((0, 0));

        for (l, layer) in self.layers.iter().enumerate() {
            let z = layer.apply(inputs[l].view());
            if l == last {
                probs = softmax(z);
                break;
            }
            let a = relu(z);
            let mask = if l == 0 && self.dropout > 0.0 {
                let keep = 1.0 - self.dropout;
                Some(a.mapv(|_| if rng.gen::<f64>() < keep { 1.0 / keep } else { 0.0 }))
            } else {
                None
            };
            let out = match &mask {
                Some(m) => &a * m,
                None => a.clone(),
            };
            activated.push(a);
            masks.push(mask);
            inputs.push(out);
        }

        Trace {
            inputs,
            activated,
            masks,
            probs,
        }
    }

    /// Loss of one minibatch and the gradient for every layer.
    pub fn backprop<R: Rng + ?Sized>(
        &self,
        batch: ArrayView2<f64>,
        labels: ArrayView2<f64>,
        rng: &mut R,
    ) -> (f64, Vec<Gradient>) {
        let trace = self.forward_train(batch, rng);
        let loss = cross_entropy(trace.probs.view(), labels);
        let n = batch.nrows().max(1) as f64;

        // Softmax + cross-entropy collapse to (p - y) / n at the logits
        let mut delta = (&trace.probs - &labels) / n;
        let mut grads: Vec<Gradient> = Vec::with_capacity(self.layers.len());

        for l in (0..self.layers.len()).rev() {
            let input = &trace.inputs[l];
            grads.push(Gradient {
                weights: input.t().dot(&delta),
                bias: delta.sum_axis(Axis(0)),
            });
            if l == 0 {
                break;
            }
            let mut upstream = delta.dot(&self.layers[l].weights.t());
            if let Some(mask) = &trace.masks[l - 1] {
                upstream *= mask;
            }
            Zip::from(&mut upstream)
                .and(&trace.activated[l - 1])
                .for_each(|g, &a| {
                    if a <= 0.0 {
                        *g = 0.0;
                    }
                });
            delta = upstream;
        }

        grads.reverse();
        (loss, grads)
    }
}

impl Classifier for Network {
    fn positive_scores(&self, features: ArrayView2<f64>) -> Array1<f64> {
        self.predict_proba(features).column(1).to_owned()
    }
}

/// Adam optimiser state for a `Network`.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: i32,
    first: Vec<Gradient>,
    second: Vec<Gradient>,
}

impl Adam {
    pub fn new(network: &Network, learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        let zeros: Vec<Gradient> = network
            .layers
            .iter()
            .map(|l| Gradient {
                weights: Array2::zeros(l.weights.raw_dim()),
                bias: Array1::zeros(l.bias.raw_dim()),
            })
            .collect();
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step: 0,
            first: zeros.clone(),
            second: zeros,
        }
    }

    pub fn apply(&mut self, network: &mut Network, grads: &[Gradient]) {
        self.step += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr_t = self.learning_rate * (1.0 - b2.powi(self.step)).sqrt()
            / (1.0 - b1.powi(self.step));

        for (((layer, g), m), v) in network
            .layers
            .iter_mut()
            .zip(grads)
            .zip(self.first.iter_mut())
            .zip(self.second.iter_mut())
        {
            Zip::from(&mut layer.weights)
                .and(&g.weights)
                .and(&mut m.weights)
                .and(&mut v.weights)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + eps);
                });
            Zip::from(&mut layer.bias)
                .and(&g.bias)
                .and(&mut m.bias)
                .and(&mut v.bias)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + eps);
                });
        }
    }
}

fn relu(mut z: Array2<f64>) -> Array2<f64> {
    z.mapv_inplace(|v| v.max(0.0));
    z
}

fn softmax(mut z: Array2<f64>) -> Array2<f64> {
    for mut row in z.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    z
}

fn cross_entropy(probs: ArrayView2<f64>, labels: ArrayView2<f64>) -> f64 {
    if labels.nrows() == 0 {
        return 0.0;
    }
    let total: f64 = Zip::from(&probs)
        .and(&labels)
        .fold(0.0, |acc, &p, &y| {
            acc - y * p.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON).ln()
        });
    total / labels.nrows() as f64
}

fn argmax<'a>(values: impl Iterator<Item = &'a f64>) -> usize {
    values
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}
