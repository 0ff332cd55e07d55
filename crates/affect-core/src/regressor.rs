//! Auxiliary linear regressor used for hybrid decoding.
//!
//! Reads per-qubit features from single-qubit reduced densities and predicts
//! the three group values in [0, 1]. Starts out at the decoder's positional
//! weights so an untrained model already agrees with exact decoding.

use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::chain::ChainState;
use crate::codec::QubitLayout;
use crate::error::{CoreError, Result};

/// Features per qubit: population of `|1>`, `Re rho01`, `Im rho01`.
pub const FEATURES_PER_QUBIT: usize = 3;

const DEFAULT_LEARNING_RATE: f64 = 0.01;

/// Persisted form, `classical_network_state` in the engine document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegressorState {
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub trained_samples: u64,
    pub learning_rate: f64,
}

#[derive(Clone, Debug)]
pub struct AffectRegressor {
    state: RegressorState,
}

impl AffectRegressor {
    pub fn new(layout: &QubitLayout) -> Self {
        let width = layout.n_qubits() * FEATURES_PER_QUBIT;
        let weights = (0..3)
            .map(|g| {
                let mut row = vec![0.0; width];
                for k in layout.groups()[g].clone() {
                    row[k * FEATURES_PER_QUBIT] = layout.positional_weight(k);
                }
                row
            })
            .collect();
        Self {
            state: RegressorState {
                weights,
                bias: vec![0.0; 3],
                trained_samples: 0,
                learning_rate: DEFAULT_LEARNING_RATE,
            },
        }
    }

    pub fn from_state(layout: &QubitLayout, state: RegressorState) -> Result<Self> {
        let width = layout.n_qubits() * FEATURES_PER_QUBIT;
        if state.weights.len() != 3 || state.bias.len() != 3 {
            return Err(CoreError::DimensionMismatch {
                expected: 3,
                actual: state.weights.len().min(state.bias.len()),
            });
        }
        if let Some(bad) = state.weights.iter().find(|row| row.len() != width) {
            return Err(CoreError::DimensionMismatch {
                expected: width,
                actual: bad.len(),
            });
        }
        Ok(Self { state })
    }

    pub fn state(&self) -> &RegressorState {
        &self.state
    }

    pub fn features(state: &ChainState) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(state.n_qubits() * FEATURES_PER_QUBIT);
        for rho in state.reduced_densities()? {
            out.push(rho[1][1].re);
            out.push(rho[0][1].re);
            out.push(rho[0][1].im);
        }
        Ok(out)
    }

    fn raw(&self, features: &[f64]) -> [f64; 3] {
        std::array::from_fn(|g| {
            self.state.weights[g]
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>()
                + self.state.bias[g]
        })
    }

    pub fn predict_features(&self, features: &[f64]) -> AffectVector {
        let raw = self.raw(features);
        AffectVector::from_normalized(raw.map(|v| v.clamp(0.0, 1.0)))
    }

    pub fn predict(&self, state: &ChainState) -> Result<AffectVector> {
        let features = Self::features(state)?;
        if features.len() != self.state.weights[0].len() {
            return Err(CoreError::DimensionMismatch {
                expected: self.state.weights[0].len(),
                actual: features.len(),
            });
        }
        Ok(self.predict_features(&features))
    }

    /// SGD on mean squared error against normalized targets. Returns the MSE
    /// after the last epoch.
    pub fn train(&mut self, samples: &[(Vec<f64>, AffectVector)], epochs: usize) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let lr = self.state.learning_rate;
        for _ in 0..epochs {
            for (features, target) in samples {
                let prediction = self.raw(features);
                let target = target.normalized();
                for g in 0..3 {
                    let err = prediction[g] - target[g];
                    for (w, x) in self.state.weights[g].iter_mut().zip(features) {
                        *w -= lr * err * x;
                    }
                    self.state.bias[g] -= lr * err;
                }
            }
        }
        self.state.trained_samples += (samples.len() * epochs) as u64;
        self.mse(samples)
    }

    pub fn mse(&self, samples: &[(Vec<f64>, AffectVector)]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let total: f64 = samples
            .iter()
            .map(|(features, target)| {
                let p = self.raw(features);
                let t = target.normalized();
                (0..3).map(|g| (p[g] - t[g]).powi(2)).sum::<f64>() / 3.0
            })
            .sum();
        total / samples.len() as f64
    }
}
