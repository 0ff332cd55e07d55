//! Affect <-> chain-state codec.
//!
//! The qubit register is split into three contiguous groups, one per PAD
//! dimension. Each group holds its normalized value as a binary integer
//! `q = round(v * (2^G - 1))`: qubit `j` starts in `|+>` and is rotated toward
//! bit `j` of `q`, keeping `ENCODING_SPREAD` of superposition so sampled
//! histograms stay informative. On top of that come the graded z-rotation,
//! the sinusoidal phase shift, the entanglement couplings and the global
//! phase-encoding pass. Every step after the polar rotation is diagonal in
//! the computational basis, so decoding reads populations back exactly.

use std::f64::consts::PI;
use std::ops::Range;

use num_complex::Complex64;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::chain::{ChainState, Site};
use crate::constants::{
    COHERENCE_EXACT_LIMIT, COHERENCE_SAMPLES, COHERENCE_SEED, ENCODING_SPREAD, EPSILON,
    LINEAR_COUPLING, MAX_QUBITS, PHASE_SHIFT_SCALE, PHASE_WEIGHTS, STAR_COUPLING,
};
use crate::error::{CoreError, Result};

/// Topology of the pairwise couplings applied during encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntanglementPattern {
    /// Nearest neighbours `(k-1, k)` across the whole register.
    #[default]
    Linear,
    /// Qubit 0 coupled to every other qubit.
    Star,
}

impl EntanglementPattern {
    pub fn coupling(self) -> f64 {
        match self {
            Self::Linear => LINEAR_COUPLING,
            Self::Star => STAR_COUPLING,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Star => "star",
        }
    }
}

impl std::str::FromStr for EntanglementPattern {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "star" => Ok(Self::Star),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown entanglement pattern '{other}'"
            ))),
        }
    }
}

/// Partition of `n` qubits into pleasure, arousal and dominance groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QubitLayout {
    n_qubits: usize,
    groups: [Range<usize>; 3],
}

impl QubitLayout {
    pub fn new(n_qubits: usize) -> Result<Self> {
        if n_qubits < 3 {
            return Err(CoreError::InvalidConfig(format!(
                "need at least 3 qubits, got {n_qubits}"
            )));
        }
        if n_qubits > MAX_QUBITS {
            return Err(CoreError::QubitBudget {
                requested: n_qubits,
                limit: MAX_QUBITS,
            });
        }
        let base = n_qubits / 3;
        let rem = n_qubits % 3;
        let sizes = [base + usize::from(rem > 0), base + usize::from(rem > 1), base];
        let p = 0..sizes[0];
        let a = p.end..p.end + sizes[1];
        let d = a.end..a.end + sizes[2];
        Ok(Self {
            n_qubits,
            groups: [p, a, d],
        })
    }

    pub fn n_qubits(&self) -> usize {
        self.n_qubits
    }

    pub fn groups(&self) -> &[Range<usize>; 3] {
        &self.groups
    }

    pub fn group_size(&self, g: usize) -> usize {
        self.groups[g].len()
    }

    /// Largest integer a group can hold, `2^G - 1`.
    pub fn max_value(&self, g: usize) -> f64 {
        ((1u64 << self.group_size(g)) - 1) as f64
    }

    /// `(group, position)` of qubit `k`.
    pub fn locate(&self, k: usize) -> (usize, usize) {
        let g = self
            .groups
            .iter()
            .position(|r| r.contains(&k))
            .unwrap_or(2);
        (g, k - self.groups[g].start)
    }

    /// Integer held by group `g` in basis index `index`.
    pub fn group_value(&self, index: u64, g: usize) -> u64 {
        let range = &self.groups[g];
        (index >> range.start) & ((1u64 << range.len()) - 1)
    }

    /// Per-group values of a basis index, each scaled into [0, 1].
    pub fn normalized_values(&self, index: u64) -> [f64; 3] {
        std::array::from_fn(|g| self.group_value(index, g) as f64 / self.max_value(g))
    }

    /// Weight of qubit `k` in its group's normalized value, `2^j / (2^G - 1)`.
    pub fn positional_weight(&self, k: usize) -> f64 {
        let (g, j) = self.locate(k);
        (1u64 << j) as f64 / self.max_value(g)
    }
}

/// Result of an exact decode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedState {
    pub affect: AffectVector,
    /// Per-group expectation in [0, 1] before pleasure is mapped back.
    pub group_expectations: [f64; 3],
    /// Inverse participation ratio over the basis dimension, in [0, 1].
    pub entanglement_measure: f64,
    pub coherence: f64,
    pub purity: f64,
}

#[derive(Clone, Debug)]
pub struct StateCodec {
    layout: QubitLayout,
    pattern: EntanglementPattern,
}

impl StateCodec {
    pub fn new(n_qubits: usize, pattern: EntanglementPattern) -> Result<Self> {
        Ok(Self {
            layout: QubitLayout::new(n_qubits)?,
            pattern,
        })
    }

    pub fn layout(&self) -> &QubitLayout {
        &self.layout
    }

    pub fn pattern(&self) -> EntanglementPattern {
        self.pattern
    }

    pub fn n_qubits(&self) -> usize {
        self.layout.n_qubits
    }

    pub fn encode(&self, affect: AffectVector) -> Result<ChainState> {
        self.encode_with(affect, self.pattern)
    }

    pub fn encode_with(&self, affect: AffectVector, pattern: EntanglementPattern) -> Result<ChainState> {
        let values = affect.normalized();
        let locals = self.local_amplitudes(values);
        let n = self.layout.n_qubits;
        let coupling = pattern.coupling();

        let mut sites = Vec::with_capacity(n);
        for (k, amps) in locals.iter().enumerate() {
            let last = k == n - 1;
            let left = if k == 0 { 1 } else { 2 };
            let right = if last { 1 } else { 2 };
            let mut site = Site::zeros(left, right);
            for l in 0..left {
                for s in 0..2 {
                    let value = amps[s] * controlled_phase(k > 0 && l == 1, s, coupling);
                    // The bond carries the control bit for the next coupling:
                    // the previous qubit (linear) or the hub (star).
                    let r = match (last, pattern, k) {
                        (true, _, _) => 0,
                        (false, _, 0) => s,
                        (false, EntanglementPattern::Linear, _) => s,
                        (false, EntanglementPattern::Star, _) => l,
                    };
                    site.set(l, s, r, value);
                }
            }
            sites.push(site);
        }

        let mut state = ChainState::from_sites(sites)?;
        state.normalize()?;
        Ok(state)
    }

    /// Per-qubit `[a0, a1]` after rotation, graded z-rotation, phase shift and
    /// the qubit's share of the phase-encoding pass.
    fn local_amplitudes(&self, values: [f64; 3]) -> Vec<[Complex64; 2]> {
        let mut out = Vec::with_capacity(self.layout.n_qubits);
        for (g, range) in self.layout.groups.iter().enumerate() {
            let size = range.len();
            let max = self.layout.max_value(g);
            let v = values[g].clamp(0.0, 1.0);
            let q = (v * max).round() as u64;
            for j in 0..size {
                let bit = (q >> j) & 1;
                let polar = if bit == 1 { PI - ENCODING_SPREAD } else { ENCODING_SPREAD };
                let pos = j as f64 / size as f64;
                let theta = v * PI * (1.0 + pos) * (-pos).exp();
                let shift = PHASE_SHIFT_SCALE * (PI * (j + 1) as f64 / (size + 1) as f64).sin();
                let encoded = PHASE_WEIGHTS[g] * (1u64 << j) as f64 / max;

                let a0 = Complex64::from_polar((polar / 2.0).cos(), -theta / 2.0);
                let a1 = Complex64::from_polar((polar / 2.0).sin(), theta / 2.0 + shift + encoded);
                out.push([a0, a1]);
            }
        }
        out
    }

    /// Exact decode from marginals. Zero-norm or non-finite input is rejected.
    pub fn decode(&self, state: &ChainState) -> Result<DecodedState> {
        if state.n_qubits() != self.layout.n_qubits {
            return Err(CoreError::DimensionMismatch {
                expected: self.layout.n_qubits,
                actual: state.n_qubits(),
            });
        }
        let state = state.normalized()?;
        let marginals = state.marginals()?;

        let group_expectations: [f64; 3] = std::array::from_fn(|g| {
            let range = self.layout.groups[g].clone();
            range
                .map(|k| marginals[k] * self.layout.positional_weight(k))
                .sum::<f64>()
                .clamp(0.0, 1.0)
        });

        let purity = state.squared_moduli().norm_sqr().clamp(0.0, 1.0);
        let entanglement_measure = if purity > EPSILON {
            let dim = (self.layout.n_qubits as f64).exp2();
            ((1.0 / purity) / dim).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let coherence = coherence(&state)?;

        Ok(DecodedState {
            affect: AffectVector::from_normalized(group_expectations),
            group_expectations,
            entanglement_measure,
            coherence,
            purity,
        })
    }

    /// Affect read from a basis index.
    pub fn affect_of_index(&self, index: u64) -> AffectVector {
        AffectVector::from_normalized(self.layout.normalized_values(index))
    }
}

/// `CRZ(s)` phase on the target for control bit set.
fn controlled_phase(control: bool, target: usize, coupling: f64) -> Complex64 {
    if !control {
        return Complex64::new(1.0, 0.0);
    }
    let sign = if target == 1 { 1.0 } else { -1.0 };
    Complex64::from_polar(1.0, sign * coupling / 2.0)
}

/// `sum |psi_i| - 1`. Exact for small registers; above that an importance
/// sampled estimate `E_p[1 / |psi|] - 1` with a fixed seed.
fn coherence(state: &ChainState) -> Result<f64> {
    let n = state.n_qubits();
    if n <= COHERENCE_EXACT_LIMIT {
        let l1: f64 = state.to_dense()?.iter().map(|a| a.norm()).sum();
        return Ok((l1 - 1.0).max(0.0));
    }
    let mut rng = SmallRng::seed_from_u64(COHERENCE_SEED);
    let samples = state.sample_indices(COHERENCE_SAMPLES, &mut rng)?;
    let mut total = 0.0;
    for index in &samples {
        let magnitude = state.amplitude(*index).norm();
        if magnitude > EPSILON {
            total += 1.0 / magnitude;
        }
    }
    let estimate = total / samples.len() as f64;
    let ceiling = (n as f64 / 2.0).exp2();
    Ok((estimate - 1.0).clamp(0.0, ceiling - 1.0))
}
