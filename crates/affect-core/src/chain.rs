//! Chain-factorized (matrix-product) state.
//!
//! A `2^n` amplitude vector is held as one rank-3 tensor per qubit with shape
//! `[left bond, physical (2), right bond]`. Qubit `k` is bit `k` of the basis
//! index. Product states have bond dimension 1; the codec's couplings need 2;
//! superpositions add bond dimensions and `truncate` brings them back down.

use nalgebra::DMatrix;
use num_complex::Complex64;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{DENSE_LIMIT, EPSILON, MAX_QUBITS};
use crate::error::{CoreError, Result};

const ZERO: Complex64 = Complex64::new(0.0, 0.0);
const ONE: Complex64 = Complex64::new(1.0, 0.0);

/// Single-qubit operator, row-major `[out][in]`.
pub type Gate = [[Complex64; 2]; 2];

/// One chain tensor, stored row-major as `[(left * 2 + physical) * right + right_idx]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Site {
    left: usize,
    right: usize,
    data: Vec<Complex64>,
}

impl Site {
    pub fn zeros(left: usize, right: usize) -> Self {
        Self {
            left,
            right,
            data: vec![ZERO; left * 2 * right],
        }
    }

    pub fn left(&self) -> usize {
        self.left
    }

    pub fn right(&self) -> usize {
        self.right
    }

    #[inline]
    fn idx(&self, l: usize, s: usize, r: usize) -> usize {
        (l * 2 + s) * self.right + r
    }

    #[inline]
    pub fn get(&self, l: usize, s: usize, r: usize) -> Complex64 {
        self.data[self.idx(l, s, r)]
    }

    #[inline]
    pub fn set(&mut self, l: usize, s: usize, r: usize, value: Complex64) {
        let i = self.idx(l, s, r);
        self.data[i] = value;
    }

    pub fn scale(&mut self, factor: Complex64) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    pub fn values_mut(&mut self) -> &mut [Complex64] {
        &mut self.data
    }

    fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.re.is_finite() && v.im.is_finite())
    }

    /// `(left * 2) x right` matrix view.
    fn left_matrix(&self) -> DMatrix<Complex64> {
        DMatrix::from_fn(self.left * 2, self.right, |row, r| {
            self.get(row / 2, row % 2, r)
        })
    }

    /// `left x (2 * right)` matrix view.
    fn right_matrix(&self) -> DMatrix<Complex64> {
        DMatrix::from_fn(self.left, 2 * self.right, |l, col| {
            self.get(l, col / self.right, col % self.right)
        })
    }

    fn from_left_matrix(m: &DMatrix<Complex64>, left: usize) -> Self {
        let right = m.ncols();
        let mut site = Self::zeros(left, right);
        for l in 0..left {
            for s in 0..2 {
                for r in 0..right {
                    site.set(l, s, r, m[(l * 2 + s, r)]);
                }
            }
        }
        site
    }

    fn from_right_matrix(m: &DMatrix<Complex64>, right: usize) -> Self {
        let left = m.nrows();
        let mut site = Self::zeros(left, right);
        for l in 0..left {
            for s in 0..2 {
                for r in 0..right {
                    site.set(l, s, r, m[(l, s * right + r)]);
                }
            }
        }
        site
    }
}

/// Outcome of a truncating sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TruncationReport {
    pub parameters_before: usize,
    pub parameters_after: usize,
    /// Smallest fraction of squared singular weight kept at any bond.
    pub retained_variance: f64,
    pub max_bond: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawChain")]
pub struct ChainState {
    sites: Vec<Site>,
}

/// Wire shape of a chain; decoded chains go through `from_sites`.
#[derive(Deserialize)]
struct RawChain {
    sites: Vec<Site>,
}

impl TryFrom<RawChain> for ChainState {
    type Error = CoreError;

    fn try_from(raw: RawChain) -> Result<Self> {
        Self::from_sites(raw.sites)
    }
}

impl ChainState {
    /// Product state from per-qubit amplitudes `[a0, a1]`.
    pub fn product(locals: &[[Complex64; 2]]) -> Result<Self> {
        if locals.is_empty() {
            return Err(CoreError::InvalidConfig("chain needs at least one qubit".into()));
        }
        if locals.len() > MAX_QUBITS {
            return Err(CoreError::QubitBudget {
                requested: locals.len(),
                limit: MAX_QUBITS,
            });
        }
        let sites = locals
            .iter()
            .map(|amps| {
                let mut site = Site::zeros(1, 1);
                site.set(0, 0, 0, amps[0]);
                site.set(0, 1, 0, amps[1]);
                site
            })
            .collect();
        Ok(Self { sites })
    }

    /// Uniform superposition over all `2^n` basis states.
    pub fn uniform(n: usize) -> Result<Self> {
        let amp = Complex64::new(std::f64::consts::FRAC_1_SQRT_2, 0.0);
        Self::product(&vec![[amp, amp]; n])
    }

    /// Assemble from explicit site tensors, checking bond consistency.
    pub fn from_sites(sites: Vec<Site>) -> Result<Self> {
        let Some(first) = sites.first() else {
            return Err(CoreError::InvalidConfig("chain needs at least one qubit".into()));
        };
        if sites.len() > MAX_QUBITS {
            return Err(CoreError::QubitBudget {
                requested: sites.len(),
                limit: MAX_QUBITS,
            });
        }
        if first.left != 1 {
            return Err(CoreError::DimensionMismatch {
                expected: 1,
                actual: first.left,
            });
        }
        for pair in sites.windows(2) {
            if pair[0].right != pair[1].left {
                return Err(CoreError::DimensionMismatch {
                    expected: pair[0].right,
                    actual: pair[1].left,
                });
            }
        }
        let last = &sites[sites.len() - 1];
        if last.right != 1 {
            return Err(CoreError::DimensionMismatch {
                expected: 1,
                actual: last.right,
            });
        }
        for site in &sites {
            let expected = site
                .right
                .checked_mul(2)
                .and_then(|r| r.checked_mul(site.left))
                .unwrap_or(usize::MAX);
            if site.data.len() != expected {
                return Err(CoreError::DimensionMismatch {
                    expected,
                    actual: site.data.len(),
                });
            }
        }
        Ok(Self { sites })
    }

    pub fn n_qubits(&self) -> usize {
        self.sites.len()
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn site_mut(&mut self, k: usize) -> &mut Site {
        &mut self.sites[k]
    }

    /// Bond dimensions between neighbouring sites (length `n - 1`).
    pub fn bond_dims(&self) -> Vec<usize> {
        self.sites[..self.sites.len() - 1]
            .iter()
            .map(|s| s.right)
            .collect()
    }

    pub fn max_bond(&self) -> usize {
        self.bond_dims().into_iter().max().unwrap_or(1)
    }

    /// Number of complex parameters held by the factorization.
    pub fn parameter_count(&self) -> usize {
        self.sites.iter().map(|s| s.data.len()).sum()
    }

    fn check_same_size(&self, other: &Self) -> Result<()> {
        if self.n_qubits() != other.n_qubits() {
            return Err(CoreError::DimensionMismatch {
                expected: self.n_qubits(),
                actual: other.n_qubits(),
            });
        }
        Ok(())
    }

    /// `<self|other>`, conjugating self.
    pub fn inner(&self, other: &Self) -> Result<Complex64> {
        self.check_same_size(other)?;
        let mut env = vec![ONE];
        for (a, b) in self.sites.iter().zip(&other.sites) {
            let mut next = vec![ZERO; a.right * b.right];
            for la in 0..a.left {
                for lb in 0..b.left {
                    let e = env[la * b.left + lb];
                    if e == ZERO {
                        continue;
                    }
                    for s in 0..2 {
                        for ra in 0..a.right {
                            let ca = a.get(la, s, ra).conj() * e;
                            if ca == ZERO {
                                continue;
                            }
                            for rb in 0..b.right {
                                next[ra * b.right + rb] += ca * b.get(lb, s, rb);
                            }
                        }
                    }
                }
            }
            env = next;
        }
        Ok(env[0])
    }

    pub fn norm_sqr(&self) -> f64 {
        let env = self.right_environments();
        env[0][0].re
    }

    pub fn norm(&self) -> f64 {
        self.norm_sqr().max(0.0).sqrt()
    }

    pub fn is_normalized(&self, tolerance: f64) -> bool {
        (self.norm() - 1.0).abs() <= tolerance
    }

    /// Scale to unit norm, returning the norm before scaling.
    pub fn normalize(&mut self) -> Result<f64> {
        if !self.sites.iter().all(Site::is_finite) {
            return Err(CoreError::DegenerateState("non-finite amplitude".into()));
        }
        let norm = self.norm();
        if !norm.is_finite() || norm < EPSILON {
            return Err(CoreError::DegenerateState(format!("norm = {norm}")));
        }
        self.sites[0].scale(Complex64::new(1.0 / norm, 0.0));
        Ok(norm)
    }

    /// Unit-norm copy.
    pub fn normalized(&self) -> Result<Self> {
        let mut copy = self.clone();
        copy.normalize()?;
        Ok(copy)
    }

    /// Amplitude of a single basis index.
    pub fn amplitude(&self, index: u64) -> Complex64 {
        let mut v = vec![ONE];
        for (k, site) in self.sites.iter().enumerate() {
            let s = ((index >> k) & 1) as usize;
            let mut next = vec![ZERO; site.right];
            for (l, &vl) in v.iter().enumerate() {
                if vl == ZERO {
                    continue;
                }
                for (r, slot) in next.iter_mut().enumerate() {
                    *slot += vl * site.get(l, s, r);
                }
            }
            v = next;
        }
        v[0]
    }

    /// Apply a single-qubit operator to qubit `k`.
    pub fn apply_local(&mut self, k: usize, gate: &Gate) {
        let site = &mut self.sites[k];
        for l in 0..site.left {
            for r in 0..site.right {
                let a0 = site.get(l, 0, r);
                let a1 = site.get(l, 1, r);
                site.set(l, 0, r, gate[0][0] * a0 + gate[0][1] * a1);
                site.set(l, 1, r, gate[1][0] * a0 + gate[1][1] * a1);
            }
        }
    }

    /// Right environments `R[k]` (ket index first, bra second); `R[0][0]` is the norm squared.
    fn right_environments(&self) -> Vec<Vec<Complex64>> {
        let n = self.sites.len();
        let mut envs = vec![Vec::new(); n + 1];
        envs[n] = vec![ONE];
        for k in (0..n).rev() {
            envs[k] = absorb_right(&envs[k + 1], &self.sites[k]);
        }
        envs
    }

    /// Single-qubit reduced density matrices of the normalized state.
    pub fn reduced_densities(&self) -> Result<Vec<Gate>> {
        let rights = self.right_environments();
        let norm_sqr = rights[0][0].re;
        if !norm_sqr.is_finite() || norm_sqr < EPSILON * EPSILON {
            return Err(CoreError::DegenerateState(format!("norm^2 = {norm_sqr}")));
        }

        let mut out = Vec::with_capacity(self.sites.len());
        let mut left = vec![ONE];
        for (k, site) in self.sites.iter().enumerate() {
            let right = &rights[k + 1];
            let (dl, dr) = (site.left, site.right);
            let mut rho = [[ZERO; 2]; 2];
            for l in 0..dl {
                for lp in 0..dl {
                    let e = left[l * dl + lp];
                    if e == ZERO {
                        continue;
                    }
                    for r in 0..dr {
                        for rp in 0..dr {
                            let w = e * right[r * dr + rp];
                            if w == ZERO {
                                continue;
                            }
                            for s in 0..2 {
                                let a = site.get(l, s, r) * w;
                                for sp in 0..2 {
                                    rho[s][sp] += a * site.get(lp, sp, rp).conj();
                                }
                            }
                        }
                    }
                }
            }
            for row in &mut rho {
                for v in row.iter_mut() {
                    *v /= norm_sqr;
                }
            }
            out.push(rho);
            left = absorb_left(&left, site);
        }
        Ok(out)
    }

    /// `P(bit_k = 1)` for every qubit.
    pub fn marginals(&self) -> Result<Vec<f64>> {
        Ok(self
            .reduced_densities()?
            .iter()
            .map(|rho| rho[1][1].re.clamp(0.0, 1.0))
            .collect())
    }

    /// Draw `shots` basis indices from the Born distribution by sequential
    /// conditional sampling, one qubit at a time.
    pub fn sample_indices(&self, shots: usize, rng: &mut impl Rng) -> Result<Vec<u64>> {
        let rights = self.right_environments();
        let norm_sqr = rights[0][0].re;
        if !norm_sqr.is_finite() || norm_sqr < EPSILON * EPSILON {
            return Err(CoreError::DegenerateState(format!("norm^2 = {norm_sqr}")));
        }

        let mut out = Vec::with_capacity(shots);
        for _ in 0..shots {
            let mut v = vec![ONE];
            let mut index = 0u64;
            for (k, site) in self.sites.iter().enumerate() {
                let right = &rights[k + 1];
                let dr = site.right;
                let mut branches = [vec![ZERO; dr], vec![ZERO; dr]];
                let mut probs = [0.0f64; 2];
                for (s, branch) in branches.iter_mut().enumerate() {
                    for (l, &vl) in v.iter().enumerate() {
                        if vl == ZERO {
                            continue;
                        }
                        for (r, slot) in branch.iter_mut().enumerate() {
                            *slot += vl * site.get(l, s, r);
                        }
                    }
                    let mut p = ZERO;
                    for r in 0..dr {
                        for rp in 0..dr {
                            p += branch[r] * right[r * dr + rp] * branch[rp].conj();
                        }
                    }
                    probs[s] = p.re.max(0.0);
                }
                let total = probs[0] + probs[1];
                if total <= 0.0 || !total.is_finite() {
                    return Err(CoreError::DegenerateState(format!(
                        "no probability mass at qubit {k}"
                    )));
                }
                let s = if rng.random::<f64>() * total < probs[0] { 0 } else { 1 };
                index |= (s as u64) << k;
                let scale = Complex64::new(1.0 / probs[s].sqrt(), 0.0);
                let [b0, b1] = branches;
                v = if s == 0 { b0 } else { b1 };
                for x in &mut v {
                    *x *= scale;
                }
            }
            out.push(index);
        }
        Ok(out)
    }

    /// Materialize the full amplitude vector. Limited to `DENSE_LIMIT` qubits.
    pub fn to_dense(&self) -> Result<Vec<Complex64>> {
        let n = self.n_qubits();
        if n > DENSE_LIMIT {
            return Err(CoreError::QubitBudget {
                requested: n,
                limit: DENSE_LIMIT,
            });
        }
        let mut cur = vec![ONE];
        let mut count = 1usize;
        let mut dim = 1usize;
        for site in &self.sites {
            let dr = site.right;
            let mut next = vec![ZERO; count * 2 * dr];
            for i in 0..count {
                for l in 0..dim {
                    let c = cur[i * dim + l];
                    if c == ZERO {
                        continue;
                    }
                    for s in 0..2 {
                        let idx = i + s * count;
                        for r in 0..dr {
                            next[idx * dr + r] += c * site.get(l, s, r);
                        }
                    }
                }
            }
            cur = next;
            count *= 2;
            dim = dr;
        }
        Ok(cur)
    }

    /// `a * self + b * other` as a block-sum chain (bond dimensions add).
    pub fn superpose(&self, a: Complex64, other: &Self, b: Complex64) -> Result<Self> {
        self.check_same_size(other)?;
        let n = self.n_qubits();
        if n == 1 {
            let mut site = Site::zeros(1, 1);
            for s in 0..2 {
                site.set(
                    0,
                    s,
                    0,
                    a * self.sites[0].get(0, s, 0) + b * other.sites[0].get(0, s, 0),
                );
            }
            return Ok(Self { sites: vec![site] });
        }

        let mut sites = Vec::with_capacity(n);
        for k in 0..n {
            let x = &self.sites[k];
            let y = &other.sites[k];
            let first = k == 0;
            let last = k == n - 1;
            let left = if first { 1 } else { x.left + y.left };
            let right = if last { 1 } else { x.right + y.right };
            let mut site = Site::zeros(left, right);
            for s in 0..2 {
                for l in 0..x.left {
                    for r in 0..x.right {
                        let (tl, tr) = (l, r);
                        let v = if first { a * x.get(l, s, r) } else { x.get(l, s, r) };
                        site.set(tl, s, tr, v);
                    }
                }
                for l in 0..y.left {
                    for r in 0..y.right {
                        let tl = if first { l } else { x.left + l };
                        let tr = if last { r } else { x.right + r };
                        let v = if first { b * y.get(l, s, r) } else { y.get(l, s, r) };
                        site.set(tl, s, tr, v);
                    }
                }
            }
            sites.push(site);
        }
        Ok(Self { sites })
    }

    /// Chain whose amplitudes are `|psi_i|^2`. Its squared norm is `sum p_i^2`.
    pub fn squared_moduli(&self) -> Self {
        let sites = self
            .sites
            .iter()
            .map(|a| {
                let (dl, dr) = (a.left, a.right);
                let mut site = Site::zeros(dl * dl, dr * dr);
                for l in 0..dl {
                    for lp in 0..dl {
                        for s in 0..2 {
                            for r in 0..dr {
                                for rp in 0..dr {
                                    site.set(
                                        l * dl + lp,
                                        s,
                                        r * dr + rp,
                                        a.get(l, s, r) * a.get(lp, s, rp).conj(),
                                    );
                                }
                            }
                        }
                    }
                }
                site
            })
            .collect();
        Self { sites }
    }

    /// QR sweep leaving every site but the last left-orthonormal.
    pub fn left_canonicalize(&mut self) {
        let n = self.sites.len();
        for k in 0..n.saturating_sub(1) {
            let left = self.sites[k].left;
            let qr = self.sites[k].left_matrix().qr();
            let q = qr.q();
            let r = qr.r();
            self.sites[k] = Site::from_left_matrix(&q, left);
            let next_right = self.sites[k + 1].right;
            let carried = &r * self.sites[k + 1].right_matrix();
            self.sites[k + 1] = Site::from_right_matrix(&carried, next_right);
        }
    }

    /// Right-to-left truncating sweep.
    ///
    /// Adjacent sites are merged and split by SVD. At each bond the smallest
    /// rank whose cumulative squared singular values reach `variance_threshold`
    /// of the total is kept, capped at `max_bond`. The result is renormalized.
    pub fn truncate(&mut self, variance_threshold: f64, max_bond: usize) -> Result<TruncationReport> {
        let parameters_before = self.parameter_count();
        let threshold = variance_threshold.clamp(0.0, 1.0);
        let cap = max_bond.max(1);
        let mut retained_min = 1.0f64;

        self.left_canonicalize();

        for k in (1..self.sites.len()).rev() {
            let a = &self.sites[k - 1];
            let b = &self.sites[k];
            let (dl, dm, dr) = (a.left, a.right, b.right);
            let theta = DMatrix::from_fn(dl * 2, 2 * dr, |row, col| {
                let (l, s) = (row / 2, row % 2);
                let (t, r) = (col / dr, col % dr);
                (0..dm).fold(ZERO, |acc, m| acc + a.get(l, s, m) * b.get(m, t, r))
            });

            let svd = theta
                .try_svd(true, true, f64::EPSILON, 0)
                .ok_or_else(|| CoreError::Linalg(format!("SVD did not converge at bond {k}")))?;
            let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
                return Err(CoreError::Linalg("SVD factors missing".into()));
            };
            let values: Vec<f64> = svd.singular_values.iter().copied().collect();
            let mut order: Vec<usize> = (0..values.len()).collect();
            order.sort_by(|&i, &j| values[j].total_cmp(&values[i]));

            let total: f64 = values.iter().map(|v| v * v).sum();
            if !total.is_finite() || total < EPSILON * EPSILON {
                return Err(CoreError::DegenerateState(format!("bond {k} carries no weight")));
            }

            let mut keep = 0;
            let mut cumulative = 0.0;
            for &i in &order {
                keep += 1;
                cumulative += values[i] * values[i];
                if cumulative >= threshold * total - EPSILON {
                    break;
                }
            }
            let keep = keep.clamp(1, cap).min(order.len());
            let kept: f64 = order[..keep].iter().map(|&i| values[i] * values[i]).sum();
            retained_min = retained_min.min(kept / total);

            let mut new_b = Site::zeros(keep, dr);
            let mut new_a = Site::zeros(dl, keep);
            for (j, &i) in order[..keep].iter().enumerate() {
                for t in 0..2 {
                    for r in 0..dr {
                        new_b.set(j, t, r, v_t[(i, t * dr + r)]);
                    }
                }
                let sigma = Complex64::new(values[i], 0.0);
                for l in 0..dl {
                    for s in 0..2 {
                        new_a.set(l, s, j, u[(l * 2 + s, i)] * sigma);
                    }
                }
            }
            self.sites[k] = new_b;
            self.sites[k - 1] = new_a;
        }

        self.normalize()?;
        Ok(TruncationReport {
            parameters_before,
            parameters_after: self.parameter_count(),
            retained_variance: retained_min,
            max_bond: self.max_bond(),
        })
    }
}

fn absorb_left(env: &[Complex64], site: &Site) -> Vec<Complex64> {
    let (dl, dr) = (site.left, site.right);
    let mut next = vec![ZERO; dr * dr];
    for l in 0..dl {
        for lp in 0..dl {
            let e = env[l * dl + lp];
            if e == ZERO {
                continue;
            }
            for s in 0..2 {
                for r in 0..dr {
                    let a = site.get(l, s, r) * e;
                    if a == ZERO {
                        continue;
                    }
                    for rp in 0..dr {
                        next[r * dr + rp] += a * site.get(lp, s, rp).conj();
                    }
                }
            }
        }
    }
    next
}

fn absorb_right(env: &[Complex64], site: &Site) -> Vec<Complex64> {
    let (dl, dr) = (site.left, site.right);
    let mut next = vec![ZERO; dl * dl];
    for r in 0..dr {
        for rp in 0..dr {
            let e = env[r * dr + rp];
            if e == ZERO {
                continue;
            }
            for s in 0..2 {
                for l in 0..dl {
                    let a = site.get(l, s, r) * e;
                    if a == ZERO {
                        continue;
                    }
                    for lp in 0..dl {
                        next[l * dl + lp] += a * site.get(lp, s, rp).conj();
                    }
                }
            }
        }
    }
    next
}

/// Render a basis index as `n` bits, most significant qubit first.
pub fn format_bitstring(index: u64, n: usize) -> String {
    (0..n)
        .rev()
        .map(|k| if (index >> k) & 1 == 1 { '1' } else { '0' })
        .collect()
}

/// Inverse of [`format_bitstring`].
pub fn parse_bitstring(bits: &str) -> Option<u64> {
    if bits.is_empty() || bits.len() > 64 {
        return None;
    }
    bits.chars().try_fold(0u64, |acc, c| match c {
        '0' => Some(acc << 1),
        '1' => Some((acc << 1) | 1),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn random_chain(n: usize, bond: usize, rng: &mut SmallRng) -> ChainState {
        let sites = (0..n)
            .map(|k| {
                let left = if k == 0 { 1 } else { bond };
                let right = if k == n - 1 { 1 } else { bond };
                let mut site = Site::zeros(left, right);
                for v in site.values_mut() {
                    *v = c(rng.random::<f64>() - 0.5, rng.random::<f64>() - 0.5);
                }
                site
            })
            .collect();
        let mut chain = ChainState::from_sites(sites).unwrap();
        chain.normalize().unwrap();
        chain
    }

    fn dense_norm(v: &[Complex64]) -> f64 {
        v.iter().map(|a| a.norm_sqr()).sum::<f64>().sqrt()
    }

    #[test]
    fn test_uniform_is_unit_norm() {
        let u = ChainState::uniform(10).unwrap();
        assert!((u.norm() - 1.0).abs() < 1e-12);
        let amp = u.amplitude(517);
        assert!((amp.re - (1.0 / 1024f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_amplitude_matches_dense() {
        let mut rng = rng();
        let chain = random_chain(6, 3, &mut rng);
        let dense = chain.to_dense().unwrap();
        assert_eq!(dense.len(), 64);
        for (i, amp) in dense.iter().enumerate() {
            let a = chain.amplitude(i as u64);
            assert!((a - amp).norm() < 1e-12, "index {i}: {a} vs {amp}");
        }
        assert!((dense_norm(&dense) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_inner_product_matches_dense() {
        let mut rng = rng();
        let a = random_chain(5, 2, &mut rng);
        let b = random_chain(5, 3, &mut rng);
        let da = a.to_dense().unwrap();
        let db = b.to_dense().unwrap();
        let expected: Complex64 = da.iter().zip(&db).map(|(x, y)| x.conj() * y).sum();
        let got = a.inner(&b).unwrap();
        assert!((got - expected).norm() < 1e-12);
    }

    #[test]
    fn test_marginals_match_dense() {
        let mut rng = rng();
        let chain = random_chain(5, 2, &mut rng);
        let dense = chain.to_dense().unwrap();
        let marginals = chain.marginals().unwrap();
        for (k, m) in marginals.iter().enumerate() {
            let expected: f64 = dense
                .iter()
                .enumerate()
                .filter(|(i, _)| (i >> k) & 1 == 1)
                .map(|(_, a)| a.norm_sqr())
                .sum();
            assert!((m - expected).abs() < 1e-10, "qubit {k}: {m} vs {expected}");
        }
    }

    #[test]
    fn test_superpose_matches_dense() {
        let mut rng = rng();
        let a = random_chain(4, 2, &mut rng);
        let b = random_chain(4, 2, &mut rng);
        let wa = c(0.6, 0.0);
        let wb = c(0.0, 0.8);
        let sum = a.superpose(wa, &b, wb).unwrap();
        assert_eq!(sum.max_bond(), 4);
        let da = a.to_dense().unwrap();
        let db = b.to_dense().unwrap();
        let ds = sum.to_dense().unwrap();
        for i in 0..16 {
            let expected = wa * da[i] + wb * db[i];
            assert!((ds[i] - expected).norm() < 1e-12);
        }
    }

    #[test]
    fn test_superpose_size_mismatch() {
        let a = ChainState::uniform(3).unwrap();
        let b = ChainState::uniform(4).unwrap();
        assert!(a.superpose(ONE, &b, ONE).is_err());
    }

    #[test]
    fn test_squared_moduli_gives_purity() {
        let mut rng = rng();
        let chain = random_chain(5, 2, &mut rng);
        let dense = chain.to_dense().unwrap();
        let expected: f64 = dense.iter().map(|a| a.norm_sqr().powi(2)).sum();
        let got = chain.squared_moduli().norm_sqr();
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn test_left_canonicalize_preserves_state() {
        let mut rng = rng();
        let chain = random_chain(5, 3, &mut rng);
        let before = chain.to_dense().unwrap();
        let mut canon = chain.clone();
        canon.left_canonicalize();
        let after = canon.to_dense().unwrap();
        for (x, y) in before.iter().zip(&after) {
            assert!((x - y).norm() < 1e-10);
        }
    }

    #[test]
    fn test_truncate_full_threshold_is_lossless() {
        let mut rng = rng();
        let chain = random_chain(6, 2, &mut rng);
        let mut t = chain.clone();
        let report = t.truncate(1.0, 64).unwrap();
        let fidelity = chain.inner(&t).unwrap().norm_sqr();
        assert!((fidelity - 1.0).abs() < 1e-9, "fidelity {fidelity}");
        assert!(report.retained_variance > 1.0 - 1e-9);
    }

    #[test]
    fn test_truncate_caps_bond_and_keeps_unit_norm() {
        let mut rng = rng();
        let mut chain = random_chain(6, 4, &mut rng);
        let report = chain.truncate(0.95, 2).unwrap();
        assert!(chain.max_bond() <= 2);
        assert!(report.parameters_after <= report.parameters_before);
        assert!(chain.is_normalized(1e-10));
    }

    #[test]
    fn test_truncate_product_state_collapses_to_bond_one() {
        let a = ChainState::uniform(5).unwrap();
        let b = ChainState::uniform(5).unwrap();
        let mut doubled = a.superpose(c(0.5, 0.0), &b, c(0.5, 0.0)).unwrap();
        assert_eq!(doubled.max_bond(), 2);
        doubled.truncate(0.95, 8).unwrap();
        assert_eq!(doubled.max_bond(), 1);
        assert!((doubled.inner(&a).unwrap().norm_sqr() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_sampling_follows_born_rule() {
        let theta = 1.0f64;
        let local = [c((theta / 2.0).cos(), 0.0), c((theta / 2.0).sin(), 0.0)];
        let chain = ChainState::product(&[local, [ONE, ZERO]]).unwrap();
        let mut rng = rng();
        let samples = chain.sample_indices(4000, &mut rng).unwrap();
        let ones = samples.iter().filter(|&&i| i & 1 == 1).count() as f64 / 4000.0;
        let expected = (theta / 2.0).sin().powi(2);
        assert!((ones - expected).abs() < 0.03, "{ones} vs {expected}");
        assert!(samples.iter().all(|&i| i & 2 == 0));
    }

    #[test]
    fn test_normalize_rejects_zero_and_nan() {
        let mut zero = ChainState::product(&[[ZERO, ZERO], [ONE, ZERO]]).unwrap();
        assert!(matches!(zero.normalize(), Err(CoreError::DegenerateState(_))));

        let mut nan = ChainState::product(&[[c(f64::NAN, 0.0), ONE]]).unwrap();
        assert!(matches!(nan.normalize(), Err(CoreError::DegenerateState(_))));
    }

    #[test]
    fn test_from_sites_checks_bonds() {
        let sites = vec![Site::zeros(1, 2), Site::zeros(3, 1)];
        assert!(ChainState::from_sites(sites).is_err());
    }

    #[test]
    fn test_decoding_rejects_inconsistent_bonds() {
        let chain = random_chain(4, 2, &mut rng());
        let mut value = serde_json::to_value(&chain).unwrap();
        value["sites"][0]["right"] = serde_json::json!(7);
        let err = serde_json::from_value::<ChainState>(value).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"), "{err}");

        let mut value = serde_json::to_value(&chain).unwrap();
        value["sites"][1]["data"].as_array_mut().unwrap().pop();
        assert!(serde_json::from_value::<ChainState>(value).is_err());

        let json = serde_json::to_string(&chain).unwrap();
        let back: ChainState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_qubits(), 4);
    }

    #[test]
    fn test_to_dense_budget() {
        let big = ChainState::uniform(DENSE_LIMIT + 1).unwrap();
        assert!(matches!(big.to_dense(), Err(CoreError::QubitBudget { .. })));
    }

    #[test]
    fn test_bitstring_roundtrip() {
        assert_eq!(format_bitstring(0b101, 5), "00101");
        assert_eq!(parse_bitstring("00101"), Some(5));
        assert_eq!(parse_bitstring("012"), None);
        assert_eq!(parse_bitstring(""), None);
    }
}
