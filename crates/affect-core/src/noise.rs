//! Simulated measurement noise.
//!
//! Each channel acts on the chain factorization directly and the state is
//! renormalized after every application.

use num_complex::Complex64;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::chain::ChainState;
use crate::error::{CoreError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseChannel {
    pub enabled: bool,
    pub rate: f64,
}

impl NoiseChannel {
    pub fn new(rate: f64) -> Self {
        Self { enabled: true, rate }
    }

    pub fn off() -> Self {
        Self {
            enabled: false,
            rate: 0.0,
        }
    }

    fn active(&self) -> bool {
        self.enabled && self.rate > 0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub depolarizing: NoiseChannel,
    pub dephasing: NoiseChannel,
    pub thermal: NoiseChannel,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            depolarizing: NoiseChannel::new(1e-3),
            dephasing: NoiseChannel::new(1e-3),
            thermal: NoiseChannel::new(5e-4),
        }
    }
}

impl NoiseConfig {
    /// Every channel disabled.
    pub fn ideal() -> Self {
        Self {
            depolarizing: NoiseChannel::off(),
            dephasing: NoiseChannel::off(),
            thermal: NoiseChannel::off(),
        }
    }

    pub fn is_ideal(&self) -> bool {
        !(self.depolarizing.active() || self.dephasing.active() || self.thermal.active())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, ch) in [
            ("depolarizing", self.depolarizing),
            ("dephasing", self.dephasing),
            ("thermal", self.thermal),
        ] {
            if !(0.0..=1.0).contains(&ch.rate) {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} rate {} outside [0, 1]",
                    ch.rate
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct NoiseModel {
    config: NoiseConfig,
}

impl NoiseModel {
    pub fn new(config: NoiseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &NoiseConfig {
        &self.config
    }

    /// Apply every enabled channel, then renormalize.
    pub fn apply(&self, state: &mut ChainState, rng: &mut impl Rng) -> Result<()> {
        if self.config.depolarizing.active() {
            *state = depolarize(state, self.config.depolarizing.rate)?;
        }
        if self.config.dephasing.active() {
            dephase(state, self.config.dephasing.rate, rng);
        }
        if self.config.thermal.active() {
            thermal(state, self.config.thermal.rate, rng);
        }
        state.normalize()?;
        Ok(())
    }
}

/// `sqrt(1 - p) |psi> + sqrt(p) |+>^n`, renormalized.
pub fn depolarize(state: &ChainState, p: f64) -> Result<ChainState> {
    let p = p.clamp(0.0, 1.0);
    let uniform = ChainState::uniform(state.n_qubits())?;
    let mut mixed = state.superpose(
        Complex64::new((1.0 - p).sqrt(), 0.0),
        &uniform,
        Complex64::new(p.sqrt(), 0.0),
    )?;
    mixed.normalize()?;
    Ok(mixed)
}

/// Random phase `exp(i * p * pi * z)`, `z ~ N(0, 1)`, on each qubit's `|1>` component.
pub fn dephase(state: &mut ChainState, p: f64, rng: &mut impl Rng) {
    for k in 0..state.n_qubits() {
        let z: f64 = StandardNormal.sample(rng);
        let phase = Complex64::from_polar(1.0, p * PI * z);
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        state.apply_local(k, &[[one, zero], [zero, phase]]);
    }
}

/// Additive real Gaussian noise of scale `p` on every tensor entry.
pub fn thermal(state: &mut ChainState, p: f64, rng: &mut impl Rng) {
    for k in 0..state.n_qubits() {
        for v in state.site_mut(k).values_mut() {
            let z: f64 = StandardNormal.sample(rng);
            v.re += p * z;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn basis_like(n: usize) -> ChainState {
        let a = Complex64::new(0.95f64.sqrt(), 0.0);
        let b = Complex64::new(0.05f64.sqrt(), 0.0);
        ChainState::product(&vec![[a, b]; n]).unwrap()
    }

    #[test]
    fn test_ideal_model_is_identity() {
        let model = NoiseModel::new(NoiseConfig::ideal()).unwrap();
        let original = basis_like(5);
        let mut state = original.clone();
        model.apply(&mut state, &mut rng()).unwrap();
        assert!((state.inner(&original).unwrap().norm_sqr() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_full_depolarizing_gives_uniform() {
        let state = depolarize(&basis_like(4), 1.0).unwrap();
        let uniform = ChainState::uniform(4).unwrap();
        assert!((state.inner(&uniform).unwrap().norm_sqr() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_dephasing_preserves_populations() {
        let original = basis_like(6);
        let mut state = original.clone();
        dephase(&mut state, 0.5, &mut rng());
        let before = original.marginals().unwrap();
        let after = state.marginals().unwrap();
        for (b, a) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_default_noise_is_small_and_normalized() {
        let model = NoiseModel::default();
        let original = basis_like(8);
        let mut state = original.clone();
        model.apply(&mut state, &mut rng()).unwrap();
        assert!(state.is_normalized(1e-10));
        let fidelity = state.inner(&original).unwrap().norm_sqr();
        assert!(fidelity > 0.95, "fidelity {fidelity}");
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let model = NoiseModel::new(NoiseConfig {
            thermal: NoiseChannel::new(0.05),
            ..NoiseConfig::default()
        })
        .unwrap();
        let mut a = basis_like(5);
        let mut b = basis_like(5);
        model.apply(&mut a, &mut rng()).unwrap();
        model.apply(&mut b, &mut rng()).unwrap();
        assert!((a.inner(&b).unwrap().norm_sqr() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rates_outside_unit_interval_rejected() {
        let config = NoiseConfig {
            dephasing: NoiseChannel::new(1.5),
            ..NoiseConfig::default()
        };
        assert!(NoiseModel::new(config).is_err());
    }
}
