use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::chain::ChainState;
use crate::error::Result;

/// Distances between two encoded affective states.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmotionalDistance {
    /// `|<a|b>|^2`
    pub fidelity: f64,
    /// `1 - F`
    pub fidelity_distance: f64,
    /// `sqrt(1 - F)`, the trace distance of the two pure states.
    pub trace_distance: f64,
    /// `||a - b||_2`
    pub euclidean_distance: f64,
    /// `sqrt(2 (1 - sqrt F))`
    pub bures_distance: f64,
    /// Plain Euclidean distance of the PAD vectors.
    pub affect_distance: f64,
}

impl EmotionalDistance {
    pub fn between(
        a: &ChainState,
        b: &ChainState,
        affect_a: AffectVector,
        affect_b: AffectVector,
    ) -> Result<Self> {
        let a = a.normalized()?;
        let b = b.normalized()?;
        let overlap = a.inner(&b)?;
        let fidelity = overlap.norm_sqr().clamp(0.0, 1.0);
        Ok(Self {
            fidelity,
            fidelity_distance: 1.0 - fidelity,
            trace_distance: (1.0 - fidelity).sqrt(),
            euclidean_distance: (2.0 - 2.0 * overlap.re).max(0.0).sqrt(),
            bures_distance: (2.0 * (1.0 - fidelity.sqrt())).max(0.0).sqrt(),
            affect_distance: affect_a.distance(affect_b),
        })
    }
}

/// Running measurement-fidelity statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FidelityMetrics {
    pub count: u64,
    pub mean_fidelity: f64,
    pub min_fidelity: f64,
    pub last_fidelity: f64,
    pub mean_confidence: f64,
}

impl FidelityMetrics {
    pub fn record(&mut self, fidelity: f64, confidence: f64) {
        let n = self.count as f64;
        self.mean_fidelity = (self.mean_fidelity * n + fidelity) / (n + 1.0);
        self.mean_confidence = (self.mean_confidence * n + confidence) / (n + 1.0);
        self.min_fidelity = if self.count == 0 {
            fidelity
        } else {
            self.min_fidelity.min(fidelity)
        };
        self.last_fidelity = fidelity;
        self.count += 1;
    }
}

/// Engine-level context persisted alongside the measurement cache.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionalContext {
    pub last_affect: Option<AffectVector>,
    pub encode_count: u64,
    pub decode_count: u64,
    pub calibration_offsets: [f64; 3],
    pub calibrated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub memory_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EntanglementPattern, StateCodec};
    use approx::assert_relative_eq;

    #[test]
    fn test_identical_states_are_zero_distance() {
        let codec = StateCodec::new(9, EntanglementPattern::Linear).unwrap();
        let affect = AffectVector::new(0.3, 0.3, 0.3);
        let s = codec.encode(affect).unwrap();
        let d = EmotionalDistance::between(&s, &s, affect, affect).unwrap();
        assert_relative_eq!(d.fidelity, 1.0, epsilon = 1e-10);
        assert!(d.trace_distance < 1e-4);
        assert!(d.bures_distance < 1e-4);
        assert!(d.euclidean_distance < 1e-4);
        assert_eq!(d.affect_distance, 0.0);
    }

    #[test]
    fn test_distant_affects_are_far_apart() {
        let codec = StateCodec::new(9, EntanglementPattern::Linear).unwrap();
        let a = AffectVector::new(-0.9, 0.1, 0.1);
        let b = AffectVector::new(0.9, 0.9, 0.9);
        let d = EmotionalDistance::between(
            &codec.encode(a).unwrap(),
            &codec.encode(b).unwrap(),
            a,
            b,
        )
        .unwrap();
        assert!(d.fidelity < 0.01);
        assert!(d.trace_distance > 0.99);
        assert_relative_eq!(d.fidelity_distance, 1.0 - d.fidelity, epsilon = 1e-12);
        assert!(d.bures_distance <= 2f64.sqrt() + 1e-12);
    }

    #[test]
    fn test_fidelity_metrics_running_stats() {
        let mut m = FidelityMetrics::default();
        m.record(0.9, 0.8);
        m.record(0.7, 0.6);
        assert_eq!(m.count, 2);
        assert_relative_eq!(m.mean_fidelity, 0.8, epsilon = 1e-12);
        assert_relative_eq!(m.min_fidelity, 0.7);
        assert_relative_eq!(m.last_fidelity, 0.7);
        assert_relative_eq!(m.mean_confidence, 0.7, epsilon = 1e-12);
    }
}
