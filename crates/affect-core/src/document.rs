//! Persisted engine document (schema 2.0) and the binary state archive.
//!
//! The JSON document carries configuration, the measurement cache and the
//! running metrics; raw chain tensors live in a side-car [`StateArchive`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::backend::BackendKind;
use crate::chain::ChainState;
use crate::codec::EntanglementPattern;
use crate::constants::{DEFAULT_CACHE_CAPACITY, DEFAULT_QUBITS, DEFAULT_SHOTS, MITIGATION_WINDOW};
use crate::memory::{CompressionMetrics, MemoryConfig, MemoryNode};
use crate::metrics::{EmotionalContext, FidelityMetrics};
use crate::noise::NoiseConfig;
use crate::regressor::RegressorState;

pub const DOCUMENT_VERSION: &str = "2.0";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub quantum_state_checksum: Option<String>,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub n_measurements_cached: usize,
}

fn default_qubits() -> usize {
    DEFAULT_QUBITS
}

fn default_true() -> bool {
    true
}

fn default_shots() -> usize {
    DEFAULT_SHOTS
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_window() -> usize {
    MITIGATION_WINDOW
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default = "default_qubits")]
    pub n_qubits: usize,
    #[serde(default)]
    pub device: String,
    #[serde(default = "default_true")]
    pub error_mitigation: bool,
    #[serde(default)]
    pub noise_model: NoiseConfig,
    #[serde(default)]
    pub entanglement_pattern: EntanglementPattern,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_shots")]
    pub default_shots: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_window")]
    pub mitigation_window: usize,
    #[serde(default)]
    pub readout_error: f64,
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Decoded affect as stored in the measurement cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    pub pleasure: f64,
    pub arousal: f64,
    pub dominance: f64,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fidelity: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub state: CachedState,
    #[serde(default)]
    pub measurements: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineDocument {
    pub metadata: DocumentMetadata,
    pub interface_config: InterfaceConfig,
    #[serde(default)]
    pub measurement_cache: Vec<CacheEntry>,
    #[serde(default)]
    pub compression_metrics: CompressionMetrics,
    #[serde(default)]
    pub fidelity_metrics: FidelityMetrics,
    #[serde(default)]
    pub emotional_context: EmotionalContext,
    #[serde(default)]
    pub classical_network_state: Option<RegressorState>,
}

/// One entry of the bounded measurement history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub affect: AffectVector,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub fidelity: f64,
    pub raw_counts: BTreeMap<String, u32>,
}

impl From<&MeasurementRecord> for CacheEntry {
    fn from(r: &MeasurementRecord) -> Self {
        Self {
            state: CachedState {
                pleasure: r.affect.pleasure,
                arousal: r.affect.arousal,
                dominance: r.affect.dominance,
                confidence: r.confidence,
                timestamp: r.timestamp,
                fidelity: r.fidelity,
            },
            measurements: r.raw_counts.clone(),
        }
    }
}

impl From<CacheEntry> for MeasurementRecord {
    fn from(e: CacheEntry) -> Self {
        Self {
            affect: AffectVector::new(e.state.pleasure, e.state.arousal, e.state.dominance),
            confidence: e.state.confidence.clamp(0.0, 1.0),
            timestamp: e.state.timestamp,
            fidelity: e.state.fidelity.clamp(0.0, 1.0),
            raw_counts: e.measurements,
        }
    }
}

/// Side-car payload: the live state and every memory node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateArchive {
    pub current_state: Option<ChainState>,
    pub memory_nodes: Vec<MemoryNode>,
}
