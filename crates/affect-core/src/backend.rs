//! Sampling backends.
//!
//! A backend is constructed once by [`create`] and owned by the caller; its
//! lifecycle (`init` / `shutdown`) is explicit and there is no process-wide
//! state behind it.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::chain::ChainState;
use crate::constants::{DENSE_BACKEND_LIMIT, MAX_QUBITS};
use crate::error::{CoreError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Auto,
    Dense,
    Chain,
}

impl std::str::FromStr for BackendKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "dense" => Ok(Self::Dense),
            "chain" => Ok(Self::Chain),
            other => Err(CoreError::InvalidConfig(format!("unknown backend '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub max_qubits: usize,
    /// Whether the backend materializes every amplitude.
    pub exact_amplitudes: bool,
}

pub trait Backend: Send {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn init(&mut self) -> Result<()>;

    fn shutdown(&mut self);

    fn is_ready(&self) -> bool;

    /// Draw `shots` basis indices from the Born distribution of `state`.
    fn sample(&self, state: &ChainState, shots: usize, rng: &mut dyn RngCore) -> Result<Vec<u64>>;
}

fn check_ready(backend: &dyn Backend, state: &ChainState) -> Result<()> {
    if !backend.is_ready() {
        return Err(CoreError::BackendNotReady(backend.name()));
    }
    let limit = backend.capabilities().max_qubits;
    if state.n_qubits() > limit {
        return Err(CoreError::QubitBudget {
            requested: state.n_qubits(),
            limit,
        });
    }
    Ok(())
}

/// Materializes the probability vector and samples by inverse CDF.
#[derive(Debug, Default)]
pub struct DenseBackend {
    ready: bool,
}

impl Backend for DenseBackend {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_qubits: DENSE_BACKEND_LIMIT,
            exact_amplitudes: true,
        }
    }

    fn init(&mut self) -> Result<()> {
        self.ready = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.ready = false;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn sample(&self, state: &ChainState, shots: usize, rng: &mut dyn RngCore) -> Result<Vec<u64>> {
        check_ready(self, state)?;
        let mut cumulative = Vec::new();
        let mut total = 0.0;
        for amp in state.to_dense()? {
            total += amp.norm_sqr();
            cumulative.push(total);
        }
        if !total.is_finite() || total <= 0.0 {
            return Err(CoreError::DegenerateState(format!("total probability {total}")));
        }
        let last = cumulative.len() - 1;
        Ok((0..shots)
            .map(|_| {
                let target = rng.random::<f64>() * total;
                cumulative.partition_point(|&c| c <= target).min(last) as u64
            })
            .collect())
    }
}

/// Sequential conditional sampling straight from the chain factorization.
#[derive(Debug, Default)]
pub struct ChainBackend {
    ready: bool,
}

impl Backend for ChainBackend {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_qubits: MAX_QUBITS,
            exact_amplitudes: false,
        }
    }

    fn init(&mut self) -> Result<()> {
        self.ready = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.ready = false;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn sample(&self, state: &ChainState, shots: usize, mut rng: &mut dyn RngCore) -> Result<Vec<u64>> {
        check_ready(self, state)?;
        state.sample_indices(shots, &mut rng)
    }
}

/// Construct (uninitialized) the backend for `kind` at `n_qubits`.
pub fn create(kind: BackendKind, n_qubits: usize) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Auto if n_qubits <= DENSE_BACKEND_LIMIT => Ok(Box::new(DenseBackend::default())),
        BackendKind::Auto | BackendKind::Chain => Ok(Box::new(ChainBackend::default())),
        BackendKind::Dense if n_qubits > DENSE_BACKEND_LIMIT => Err(CoreError::QubitBudget {
            requested: n_qubits,
            limit: DENSE_BACKEND_LIMIT,
        }),
        BackendKind::Dense => Ok(Box::new(DenseBackend::default())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn biased(n: usize) -> ChainState {
        let a = Complex64::new(0.8f64.sqrt(), 0.0);
        let b = Complex64::new(0.2f64.sqrt(), 0.0);
        ChainState::product(&vec![[a, b]; n]).unwrap()
    }

    #[test]
    fn test_factory_selection() {
        assert_eq!(create(BackendKind::Auto, 12).unwrap().name(), "dense");
        assert_eq!(create(BackendKind::Auto, 27).unwrap().name(), "chain");
        assert_eq!(create(BackendKind::Chain, 4).unwrap().name(), "chain");
        assert!(matches!(
            create(BackendKind::Dense, 27),
            Err(CoreError::QubitBudget { .. })
        ));
    }

    #[test]
    fn test_sampling_requires_init() {
        let mut backend = create(BackendKind::Chain, 4).unwrap();
        let state = biased(4);
        assert!(matches!(
            backend.sample(&state, 10, &mut rng()),
            Err(CoreError::BackendNotReady("chain"))
        ));
        backend.init().unwrap();
        assert_eq!(backend.sample(&state, 10, &mut rng()).unwrap().len(), 10);
        backend.shutdown();
        assert!(!backend.is_ready());
    }

    #[test]
    fn test_backends_agree_on_distribution() {
        let state = biased(3);
        let mut dense = DenseBackend::default();
        let mut chain = ChainBackend::default();
        dense.init().unwrap();
        chain.init().unwrap();
        let shots = 8000;
        let ones = |samples: Vec<u64>| samples.iter().filter(|&&i| i & 1 == 1).count() as f64 / shots as f64;
        let d = ones(dense.sample(&state, shots, &mut rng()).unwrap());
        let c = ones(chain.sample(&state, shots, &mut rng()).unwrap());
        assert!((d - 0.2).abs() < 0.02, "dense {d}");
        assert!((c - 0.2).abs() < 0.02, "chain {c}");
    }
}
