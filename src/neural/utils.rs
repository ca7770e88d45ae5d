// projeto: lstmsensorforecast
// file: src/neural/utils.rs
// Error taxonomy, activations, optimizer, learning-rate schedule and input checks

use ndarray::{Array1, Array2, ArrayD, ArrayViewD, ArrayViewMutD, ShapeError, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient data: need at least {required} rows, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("Insufficient history: need at least {required} rows, got {actual}")]
    InsufficientHistory { required: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Artifact mismatch: {0}")]
    ArtifactMismatch(String),

    #[error("Unsupported horizon: requested {requested} steps, model predicts {horizon}")]
    UnsupportedHorizon { requested: usize, horizon: usize },

    #[error("Irregular sampling: {0}")]
    IrregularSampling(String),

    #[error("Training diverged at epoch {epoch}: loss = {loss}")]
    TrainingDiverged { epoch: usize, loss: f64 },

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration file error: {0}")]
    Config(String),
}

impl From<ShapeError> for ForecastError {
    fn from(err: ShapeError) -> Self {
        ForecastError::Shape(err.to_string())
    }
}

impl From<serde_json::Error> for ForecastError {
    fn from(err: serde_json::Error) -> Self {
        ForecastError::Serialization(err.to_string())
    }
}

/// Adam over an ordered list of parameter tensors.
///
/// Moment buffers are created lazily on the first step and matched to
/// parameters by position, so the caller must always pass tensors in the
/// same order.
#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub t: usize,
    m: Vec<ArrayD<f64>>,
    v: Vec<ArrayD<f64>>,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        AdamOptimizer {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn set_learning_rate(&mut self, new_lr: f64) {
        self.learning_rate = new_lr;
    }

    pub fn step(
        &mut self,
        params: Vec<ArrayViewMutD<'_, f64>>,
        grads: Vec<ArrayViewD<'_, f64>>,
    ) -> Result<(), ForecastError> {
        if params.len() != grads.len() {
            return Err(ForecastError::Shape(format!(
                "optimizer got {} parameter tensors but {} gradients",
                params.len(),
                grads.len()
            )));
        }
        if self.m.is_empty() {
            self.m = grads.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
            self.v = grads.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
        }
        if self.m.len() != params.len() {
            return Err(ForecastError::Shape(format!(
                "optimizer state tracks {} tensors, got {}",
                self.m.len(),
                params.len()
            )));
        }

        self.t += 1;
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.learning_rate);
        let bias1 = 1.0 - beta1.powi(self.t as i32);
        let bias2 = 1.0 - beta2.powi(self.t as i32);

        for (((mut p, g), m), v) in params
            .into_iter()
            .zip(grads.iter())
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            if p.shape() != g.shape() || m.shape() != g.shape() {
                return Err(ForecastError::Shape(format!(
                    "parameter {:?} / gradient {:?} / moment {:?} disagree",
                    p.shape(),
                    g.shape(),
                    m.shape()
                )));
            }
            Zip::from(&mut p).and(g).and(m).and(v).for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }
        Ok(())
    }
}

/// Learning-rate policy applied at epoch boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LearningRateScheduler {
    Constant,
    StepDecay {
        decay_rate: f64,
        step_size: usize,
    },
    ReduceOnPlateau {
        factor: f64,
        patience: usize,
        min_rate: f64,
    },
}

impl LearningRateScheduler {
    /// Rate for the next epoch. `stalled` counts epochs without a validation
    /// improvement; the plateau policy resets it after each reduction.
    pub fn next_rate(&self, initial_rate: f64, current_rate: f64, epoch: usize, stalled: &mut usize) -> f64 {
        match self {
            LearningRateScheduler::Constant => current_rate,
            LearningRateScheduler::StepDecay { decay_rate, step_size } => {
                let step = (*step_size).max(1);
                initial_rate * decay_rate.powi((epoch / step) as i32)
            }
            LearningRateScheduler::ReduceOnPlateau { factor, patience, min_rate } => {
                if *stalled >= *patience {
                    *stalled = 0;
                    (current_rate * factor).max(*min_rate)
                } else {
                    current_rate
                }
            }
        }
    }
}

pub fn relu(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|val| val.max(0.0))
}

pub fn sigmoid_scalar(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Numerically stable softmax.
pub fn softmax(x: &Array1<f64>) -> Array1<f64> {
    let max_val = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp = x.mapv(|v| (v - max_val).exp());
    let sum = exp.sum();
    exp / sum
}

pub fn validate_input_data(data: &Array2<f64>, name: &str) -> Result<(), ForecastError> {
    if data.is_empty() {
        return Err(ForecastError::InvalidInput(format!("{} is empty", name)));
    }

    for ((i, j), &value) in data.indexed_iter() {
        if value.is_nan() {
            return Err(ForecastError::InvalidInput(format!(
                "{} contains NaN at position ({}, {})",
                name, i, j
            )));
        }
        if value.is_infinite() {
            return Err(ForecastError::InvalidInput(format!(
                "{} contains infinite value at position ({}, {})",
                name, i, j
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    #[test]
    fn test_adam_moves_against_gradient() {
        let mut optimizer = AdamOptimizer::new(0.1, 0.9, 0.999, 1e-8);
        let mut param = Array1::from_vec(vec![1.0, -1.0, 0.5]).into_dyn();
        let grad = Array1::from_vec(vec![0.2, -0.4, 0.0]).into_dyn();

        optimizer.step(vec![param.view_mut()], vec![grad.view()]).unwrap();

        assert!((param[[0]] - 0.9).abs() < 1e-6);
        assert!((param[[1]] + 0.9).abs() < 1e-6);
        assert_eq!(param[[2]], 0.5);
        assert_eq!(optimizer.t, 1);
    }

    #[test]
    fn test_adam_rejects_mismatched_lists() {
        let mut optimizer = AdamOptimizer::new(0.01, 0.9, 0.999, 1e-8);
        let mut param = Array1::<f64>::zeros(2).into_dyn();
        let result = optimizer.step(vec![param.view_mut()], vec![]);
        assert!(matches!(result, Err(ForecastError::Shape(_))));
    }

    #[test]
    fn test_activation_functions() {
        let x = Array1::from_vec(vec![-1.0, 0.0, 1.0]);
        assert!(sigmoid_scalar(-1.0) < 0.5);
        assert!((sigmoid_scalar(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid_scalar(1.0) > 0.5);
        assert!((sigmoid_scalar(-800.0)).abs() < 1e-300);
        assert!((sigmoid_scalar(800.0) - 1.0).abs() < 1e-12);

        let r = relu(&x);
        assert_eq!(r.to_vec(), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let x = Array1::from_vec(vec![1000.0, 1001.0, 999.0]);
        let s = softmax(&x);
        assert!((s.sum() - 1.0).abs() < 1e-12);
        assert!(s[1] > s[0] && s[0] > s[2]);
    }

    #[test]
    fn test_learning_rate_scheduler() {
        let step = LearningRateScheduler::StepDecay { decay_rate: 0.5, step_size: 10 };
        let mut stalled = 0;
        assert_eq!(step.next_rate(0.1, 0.1, 5, &mut stalled), 0.1);
        assert_eq!(step.next_rate(0.1, 0.1, 10, &mut stalled), 0.05);
        assert_eq!(step.next_rate(0.1, 0.05, 20, &mut stalled), 0.025);

        let plateau = LearningRateScheduler::ReduceOnPlateau { factor: 0.5, patience: 3, min_rate: 0.01 };
        let mut stalled = 2;
        assert_eq!(plateau.next_rate(0.1, 0.1, 4, &mut stalled), 0.1);
        stalled = 3;
        assert_eq!(plateau.next_rate(0.1, 0.1, 5, &mut stalled), 0.05);
        assert_eq!(stalled, 0);
        stalled = 3;
        assert_eq!(plateau.next_rate(0.1, 0.015, 9, &mut stalled), 0.01);
    }

    #[test]
    fn test_data_validation() {
        let valid = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(validate_input_data(&valid, "test").is_ok());
        let nan = Array2::from_shape_vec((2, 2), vec![1.0, f64::NAN, 3.0, 4.0]).unwrap();
        assert!(validate_input_data(&nan, "test").is_err());
        let inf = Array2::from_shape_vec((1, 2), vec![f64::INFINITY, 0.0]).unwrap();
        assert!(validate_input_data(&inf, "test").is_err());
        let empty = Array2::<f64>::zeros((0, 3));
        assert!(validate_input_data(&empty, "test").is_err());
    }
}
