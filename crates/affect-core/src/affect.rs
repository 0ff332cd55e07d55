use serde::{Deserialize, Serialize};

use crate::constants::EPSILON;

/// Pleasure/arousal/dominance observation.
///
/// Components are clamped into range on construction, never rejected:
/// pleasure to [-1, 1], arousal and dominance to [0, 1]. Non-finite inputs
/// fall back to the neutral value of the component.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AffectVector {
    pub pleasure: f64,
    pub arousal: f64,
    pub dominance: f64,
}

impl PartialEq for AffectVector {
    fn eq(&self, other: &Self) -> bool {
        (self.pleasure - other.pleasure).abs() < EPSILON
            && (self.arousal - other.arousal).abs() < EPSILON
            && (self.dominance - other.dominance).abs() < EPSILON
    }
}

impl Default for AffectVector {
    fn default() -> Self {
        Self::neutral()
    }
}

fn clamp_or(value: f64, lo: f64, hi: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        fallback
    }
}

impl AffectVector {
    pub fn new(pleasure: f64, arousal: f64, dominance: f64) -> Self {
        Self {
            pleasure: clamp_or(pleasure, -1.0, 1.0, 0.0),
            arousal: clamp_or(arousal, 0.0, 1.0, 0.5),
            dominance: clamp_or(dominance, 0.0, 1.0, 0.5),
        }
    }

    /// Neutral affect: zero pleasure, mid arousal and dominance.
    pub fn neutral() -> Self {
        Self {
            pleasure: 0.0,
            arousal: 0.5,
            dominance: 0.5,
        }
    }

    /// Build from values already mapped into [0, 1] per dimension.
    pub fn from_normalized(values: [f64; 3]) -> Self {
        Self::new(values[0] * 2.0 - 1.0, values[1], values[2])
    }

    /// Every dimension mapped into [0, 1] (pleasure shifted from [-1, 1]).
    pub fn normalized(self) -> [f64; 3] {
        [(self.pleasure + 1.0) / 2.0, self.arousal, self.dominance]
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.pleasure, self.arousal, self.dominance]
    }

    pub fn from_array(arr: [f64; 3]) -> Self {
        Self::new(arr[0], arr[1], arr[2])
    }

    pub fn norm(self) -> f64 {
        self.to_array().iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Cosine similarity of the raw PAD vectors. Zero vectors score 0.
    pub fn cosine_similarity(self, other: Self) -> f64 {
        let denom = self.norm() * other.norm();
        if denom < EPSILON {
            return 0.0;
        }
        let dot: f64 = self
            .to_array()
            .iter()
            .zip(other.to_array())
            .map(|(a, b)| a * b)
            .sum();
        (dot / denom).clamp(-1.0, 1.0)
    }

    /// Euclidean distance in PAD space.
    pub fn distance(self, other: Self) -> f64 {
        self.to_array()
            .iter()
            .zip(other.to_array())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    /// Linear blend: `weight` = 0 returns self, 1 returns other. Re-clamped.
    pub fn blend(self, other: Self, weight: f64) -> Self {
        let w = weight.clamp(0.0, 1.0);
        Self::new(
            self.pleasure + w * (other.pleasure - self.pleasure),
            self.arousal + w * (other.arousal - self.arousal),
            self.dominance + w * (other.dominance - self.dominance),
        )
    }

    /// Component-wise mean. Returns None for an empty iterator.
    pub fn mean<I: IntoIterator<Item = Self>>(items: I) -> Option<Self> {
        let mut sum = [0.0; 3];
        let mut count = 0usize;
        for a in items {
            for (acc, v) in sum.iter_mut().zip(a.to_array()) {
                *acc += v;
            }
            count += 1;
        }
        if count == 0 {
            return None;
        }
        let n = count as f64;
        Some(Self::new(sum[0] / n, sum[1] / n, sum[2] / n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_is_clamped() {
        let a = AffectVector::new(1.7, -0.2, 3.0);
        assert_eq!(a, AffectVector::new(1.0, 0.0, 1.0));
    }

    #[test]
    fn test_non_finite_falls_back_to_neutral() {
        let a = AffectVector::new(f64::NAN, f64::INFINITY, f64::NEG_INFINITY);
        assert_eq!(a, AffectVector::neutral());
    }

    #[test]
    fn test_normalized_roundtrip() {
        let a = AffectVector::new(-0.4, 0.3, 0.9);
        let n = a.normalized();
        assert!((n[0] - 0.3).abs() < 1e-12);
        assert_eq!(AffectVector::from_normalized(n), a);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = AffectVector::new(0.5, 0.5, 0.5);
        assert!((a.cosine_similarity(a) - 1.0).abs() < 1e-12);

        let b = AffectVector::new(-0.5, 0.0, 0.0);
        let c = AffectVector::new(0.5, 0.0, 0.0);
        assert!((b.cosine_similarity(c) + 1.0).abs() < 1e-12);

        let zero = AffectVector::new(0.0, 0.0, 0.0);
        assert_eq!(zero.cosine_similarity(a), 0.0);
    }

    #[test]
    fn test_blend_endpoints() {
        let a = AffectVector::new(-1.0, 0.0, 0.2);
        let b = AffectVector::new(1.0, 1.0, 0.8);
        assert_eq!(a.blend(b, 0.0), a);
        assert_eq!(a.blend(b, 1.0), b);
        let mid = a.blend(b, 0.5);
        assert!((mid.pleasure).abs() < 1e-12);
        assert!((mid.dominance - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mean() {
        assert!(AffectVector::mean(Vec::new()).is_none());
        let m = AffectVector::mean([
            AffectVector::new(0.2, 0.4, 0.6),
            AffectVector::new(0.4, 0.6, 0.8),
        ])
        .unwrap();
        assert!((m.pleasure - 0.3).abs() < 1e-12);
        assert!((m.arousal - 0.5).abs() < 1e-12);
        assert!((m.dominance - 0.7).abs() < 1e-12);
    }
}
