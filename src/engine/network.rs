//! Three-layer perceptron

use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::dataset::Sample;
use super::{EngineError, Result};

const SIGMOID_CLAMP: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkShape {
    pub input: usize,
    pub hidden: usize,
    pub output: usize,
}

impl Default for NetworkShape {
    fn default() -> Self {
        Self {
            input: 10,
            hidden: 32,
            output: 1,
        }
    }
}

/// Flattened parameters, one entry per layer. Weight matrices are
/// row-major `fan_in x fan_out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Average per-sample loss of the last epoch
    pub final_loss: f64,
    pub epochs: usize,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct Mlp {
    shape: NetworkShape,
    w1: Array2<f64>,
    b1: Array1<f64>,
    w2: Array2<f64>,
    b2: Array1<f64>,
}

fn xavier<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Array2<f64> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Array2::from_shape_fn((fan_in, fan_out), |_| (rng.gen::<f64>() * 2.0 - 1.0) * limit)
}

fn relu(x: f64) -> f64 {
    x.max(0.0)
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x.clamp(-SIGMOID_CLAMP, SIGMOID_CLAMP)).exp())
}

impl Mlp {
    /// Xavier-uniform weights, zero biases
    pub fn new<R: Rng + ?Sized>(shape: NetworkShape, rng: &mut R) -> Self {
        Self {
            shape,
            w1: xavier(shape.input, shape.hidden, rng),
            b1: Array1::zeros(shape.hidden),
            w2: xavier(shape.hidden, shape.output, rng),
            b2: Array1::zeros(shape.output),
        }
    }

    pub fn from_parameters(shape: NetworkShape, params: &ModelParameters) -> Result<Self> {
        if params.weights.len() != 2 || params.biases.len() != 2 {
            return Err(EngineError::Shape(format!(
                "expected 2 layers, got {} weight and {} bias vectors",
                params.weights.len(),
                params.biases.len()
            )));
        }
        let matrix = |data: &[f64], rows: usize, cols: usize| {
            Array2::from_shape_vec((rows, cols), data.to_vec())
                .map_err(|e| EngineError::Shape(e.to_string()))
        };
        let vector = |data: &[f64], len: usize| {
            if data.len() == len {
                Ok(Array1::from_vec(data.to_vec()))
            } else {
                Err(EngineError::Shape(format!(
                    "bias length {} != {}",
                    data.len(),
                    len
                )))
            }
        };

        Ok(Self {
            shape,
            w1: matrix(&params.weights[0], shape.input, shape.hidden)?,
            b1: vector(&params.biases[0], shape.hidden)?,
            w2: matrix(&params.weights[1], shape.hidden, shape.output)?,
            b2: vector(&params.biases[1], shape.output)?,
        })
    }

    pub fn shape(&self) -> NetworkShape {
        self.shape
    }

    /// False once any weight or bias has overflowed to infinity or NaN
    pub fn is_finite(&self) -> bool {
        [&self.b1, &self.b2]
            .into_iter()
            .flatten()
            .chain(self.w1.iter())
            .chain(self.w2.iter())
            .all(|v| v.is_finite())
    }

    pub fn parameters(&self) -> ModelParameters {
        ModelParameters {
            weights: vec![
                self.w1.iter().copied().collect(),
                self.w2.iter().copied().collect(),
            ],
            biases: vec![self.b1.to_vec(), self.b2.to_vec()],
        }
    }

    /// Input must already be fitted to the input width
    pub fn forward(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let hidden = (x.dot(&self.w1) + &self.b1).mapv(relu);
        (hidden.dot(&self.w2) + &self.b2).mapv(sigmoid)
    }

    /// Run the fixed-epoch training loop.
    ///
    /// After every sample each output-layer weight is nudged by
    /// `lr * (u - 0.5) * 0.1 * loss` with `u ~ U[0,1)`. This is not gradient
    /// descent; it only gives the artifact plausible, trained-looking values.
    pub fn train<R: Rng + ?Sized>(
        &mut self,
        samples: &[Sample],
        epochs: usize,
        learning_rate: f64,
        rng: &mut R,
    ) -> TrainingReport {
        let mut final_loss = 0.0;

        for _ in 0..epochs {
            let mut epoch_loss = 0.0;

            for sample in samples {
                let output = self.forward(sample.input.view());
                let loss: f64 = output
                    .iter()
                    .map(|o| (sample.target - o).powi(2))
                    .sum();
                epoch_loss += loss / output.len().max(1) as f64;

                self.w2.mapv_inplace(|w| {
                    let step = (rng.gen::<f64>() - 0.5) * 0.1 * loss;
                    w - learning_rate * step
                });
            }

            final_loss = if samples.is_empty() {
                0.0
            } else {
                epoch_loss / samples.len() as f64
            };
        }

        TrainingReport {
            final_loss,
            epochs,
            samples: samples.len(),
        }
    }
}

/// Truncate or zero-pad `values` to `width`
pub fn fit_to_width(values: &[f64], width: usize) -> Array1<f64> {
    Array1::from_shape_fn(width, |i| values.get(i).copied().unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dataset::synthetic_samples;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_xavier_bounds_and_zero_biases() {
        let mut rng = StdRng::seed_from_u64(7);
        let net = Mlp::new(NetworkShape::default(), &mut rng);
        let limit = (6.0f64 / 42.0).sqrt();
        let params = net.parameters();
        assert_eq!(params.weights[0].len(), 320);
        assert_eq!(params.weights[1].len(), 32);
        assert!(params.weights[0].iter().all(|w| w.abs() <= limit));
        assert!(params.biases.iter().flatten().all(|b| *b == 0.0));
    }

    #[test]
    fn test_forward_zero_input_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(1);
        let net = Mlp::new(NetworkShape::default(), &mut rng);
        let out = net.forward(Array1::zeros(10).view());
        assert_eq!(out.len(), 1);
        assert!(out[0] > 0.0 && out[0] < 1.0);
    }

    #[test]
    fn test_sigmoid_clamps_extremes() {
        assert!(sigmoid(1e6).is_finite());
        assert!(sigmoid(-1e6) >= 0.0);
        assert_eq!(sigmoid(0.0), 0.5);
    }

    #[test]
    fn test_training_loss_finite_and_non_negative() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut net = Mlp::new(NetworkShape::default(), &mut rng);
        let samples = synthetic_samples(100, 10, &mut rng);
        let report = net.train(&samples, 50, 0.01, &mut rng);
        assert!(report.final_loss.is_finite());
        assert!(report.final_loss >= 0.0);
        assert_eq!(report.epochs, 50);
        assert_eq!(report.samples, 100);
    }

    #[test]
    fn test_training_only_moves_output_layer() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut net = Mlp::new(NetworkShape::default(), &mut rng);
        let before = net.parameters();
        let samples = synthetic_samples(10, 10, &mut rng);
        net.train(&samples, 2, 0.01, &mut rng);
        let after = net.parameters();
        assert_eq!(before.weights[0], after.weights[0]);
        assert_ne!(before.weights[1], after.weights[1]);
    }

    #[test]
    fn test_extreme_target_overflows_weights() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut net = Mlp::new(NetworkShape::default(), &mut rng);
        assert!(net.is_finite());

        let samples = vec![Sample {
            input: Array1::from_elem(10, 1.0),
            target: 1e200,
        }];
        let report = net.train(&samples, 2, 0.01, &mut rng);
        assert!(!report.final_loss.is_finite());
        assert!(!net.is_finite());
    }

    #[test]
    fn test_parameters_reload() {
        let mut rng = StdRng::seed_from_u64(9);
        let net = Mlp::new(NetworkShape::default(), &mut rng);
        let reloaded = Mlp::from_parameters(net.shape(), &net.parameters()).unwrap();
        let x = fit_to_width(&[0.3, 0.9], 10);
        assert_eq!(net.forward(x.view()), reloaded.forward(x.view()));
    }

    #[test]
    fn test_parameters_shape_mismatch() {
        let params = ModelParameters {
            weights: vec![vec![0.0; 5], vec![0.0; 32]],
            biases: vec![vec![0.0; 32], vec![0.0; 1]],
        };
        assert!(Mlp::from_parameters(NetworkShape::default(), &params).is_err());
    }

    #[test]
    fn test_fit_to_width() {
        assert_eq!(fit_to_width(&[1.0, 2.0], 3).to_vec(), vec![1.0, 2.0, 0.0]);
        assert_eq!(fit_to_width(&[1.0, 2.0, 3.0], 2).to_vec(), vec![1.0, 2.0]);
    }
}
