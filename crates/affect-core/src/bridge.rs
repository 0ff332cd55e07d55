//! Classical <-> encoded-state bridge.
//!
//! Orchestrates encode -> noise -> (memory) and sample -> decode -> error
//! mitigation, keeps the bounded measurement history used for mitigation and
//! calibration, and owns the sampling backend handed to it at construction.

use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::affect::AffectVector;
use crate::backend::{self, Backend, BackendKind};
use crate::chain::{ChainState, format_bitstring};
use crate::codec::{DecodedState, EntanglementPattern, StateCodec};
use crate::constants::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_QUBITS, DEFAULT_SHOTS, MAX_MITIGATION_WEIGHT,
    MITIGATION_WINDOW, TRAJECTORY_SEED,
};
use crate::document::{
    DOCUMENT_VERSION, DocumentMetadata, EngineDocument, InterfaceConfig, MeasurementRecord,
    StateArchive,
};
use crate::error::{CoreError, Result};
use crate::memory::{MemoryConfig, MemoryMatch, StoreOutcome, TensorNetworkStore};
use crate::metrics::{EmotionalContext, EmotionalDistance, FidelityMetrics};
use crate::noise::{NoiseConfig, NoiseModel};
use crate::regressor::AffectRegressor;

/// Passes over the calibration set when fitting the regressor.
const CALIBRATION_EPOCHS: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub n_qubits: usize,
    pub entanglement_pattern: EntanglementPattern,
    pub error_mitigation: bool,
    pub default_shots: usize,
    pub cache_capacity: usize,
    pub mitigation_window: usize,
    /// Per-bit flip probability applied to sampled outcomes.
    pub readout_error: f64,
    pub noise: NoiseConfig,
    pub backend: BackendKind,
    pub seed: Option<u64>,
    pub memory: MemoryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            n_qubits: DEFAULT_QUBITS,
            entanglement_pattern: EntanglementPattern::Linear,
            error_mitigation: true,
            default_shots: DEFAULT_SHOTS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            mitigation_window: MITIGATION_WINDOW,
            readout_error: 0.0,
            noise: NoiseConfig::default(),
            backend: BackendKind::Auto,
            seed: None,
            memory: MemoryConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_shots == 0 {
            return Err(CoreError::InvalidConfig("default_shots must be positive".into()));
        }
        if self.cache_capacity == 0 || self.mitigation_window == 0 {
            return Err(CoreError::InvalidConfig(
                "cache_capacity and mitigation_window must be positive".into(),
            ));
        }
        if !(0.0..=0.5).contains(&self.readout_error) {
            return Err(CoreError::InvalidConfig(format!(
                "readout_error {} outside [0, 0.5]",
                self.readout_error
            )));
        }
        self.noise.validate()?;
        self.memory.validate()
    }

    pub fn to_interface(&self, device: &str) -> InterfaceConfig {
        InterfaceConfig {
            n_qubits: self.n_qubits,
            device: device.to_string(),
            error_mitigation: self.error_mitigation,
            noise_model: self.noise,
            entanglement_pattern: self.entanglement_pattern,
            backend: self.backend,
            default_shots: self.default_shots,
            cache_capacity: self.cache_capacity,
            mitigation_window: self.mitigation_window,
            readout_error: self.readout_error,
            memory: self.memory.clone(),
        }
    }

    pub fn from_interface(ic: &InterfaceConfig, seed: Option<u64>) -> Self {
        Self {
            n_qubits: ic.n_qubits,
            entanglement_pattern: ic.entanglement_pattern,
            error_mitigation: ic.error_mitigation,
            default_shots: ic.default_shots,
            cache_capacity: ic.cache_capacity,
            mitigation_window: ic.mitigation_window,
            readout_error: ic.readout_error,
            noise: ic.noise_model,
            backend: ic.backend,
            seed,
            memory: ic.memory.clone(),
        }
    }
}

/// Decoded affect plus measurement metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassicalState {
    pub affect: AffectVector,
    /// Histogram estimate before mitigation and calibration offsets.
    pub raw_affect: AffectVector,
    pub confidence: f64,
    pub measurement_fidelity: f64,
    pub entanglement_measure: f64,
    pub coherence: f64,
    pub purity: f64,
    pub shots: usize,
    pub counts: BTreeMap<String, u32>,
    pub mitigated: bool,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HybridResult {
    pub affect: AffectVector,
    pub quantum: ClassicalState,
    pub classical: AffectVector,
    pub quantum_weight: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub samples: usize,
    pub offsets: [f64; 3],
    /// Mean absolute per-dimension error before and after applying offsets.
    pub mean_error_before: f64,
    pub mean_error_after: f64,
    pub regressor_mse: f64,
}

/// Histogram-level result of sampling one state.
struct RawMeasurement {
    exact: DecodedState,
    affect: AffectVector,
    counts: BTreeMap<String, u32>,
    max_count: u32,
    fidelity: f64,
}

fn measure(
    codec: &StateCodec,
    backend: &dyn Backend,
    readout_error: f64,
    state: &ChainState,
    shots: usize,
    rng: &mut dyn RngCore,
) -> Result<RawMeasurement> {
    if shots == 0 {
        return Err(CoreError::InvalidConfig("shots must be positive".into()));
    }
    let state = state.normalized()?;
    let exact = codec.decode(&state)?;
    let n = codec.n_qubits();

    let mut histogram: BTreeMap<u64, u32> = BTreeMap::new();
    for mut index in backend.sample(&state, shots, rng)? {
        if readout_error > 0.0 {
            for k in 0..n {
                if rng.random::<f64>() < readout_error {
                    index ^= 1 << k;
                }
            }
        }
        *histogram.entry(index).or_default() += 1;
    }

    let layout = codec.layout();
    let mut sums = [0.0; 3];
    let mut overlap = 0.0;
    let mut max_count = 0;
    for (&index, &count) in &histogram {
        let values = layout.normalized_values(index);
        for (acc, v) in sums.iter_mut().zip(values) {
            *acc += v * count as f64;
        }
        overlap += (count as f64 / shots as f64).sqrt() * state.amplitude(index).norm();
        max_count = max_count.max(count);
    }
    let affect = AffectVector::from_normalized(sums.map(|s| s / shots as f64));
    let counts = histogram
        .into_iter()
        .map(|(index, count)| (format_bitstring(index, n), count))
        .collect();

    Ok(RawMeasurement {
        exact,
        affect,
        counts,
        max_count,
        fidelity: (overlap * overlap).clamp(0.0, 1.0),
    })
}

fn confidence(raw: &RawMeasurement, shots: usize) -> f64 {
    let peak = raw.max_count as f64 / shots as f64;
    (peak * raw.exact.purity * (1.0 - 0.5 * raw.exact.entanglement_measure)).clamp(0.0, 1.0)
}

fn trajectory_seed(start: AffectVector, end: AffectVector) -> u64 {
    start
        .to_array()
        .into_iter()
        .chain(end.to_array())
        .fold(TRAJECTORY_SEED, |acc, v| {
            (acc ^ v.to_bits()).wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(17)
        })
}

pub struct ClassicalBridge {
    config: BridgeConfig,
    codec: StateCodec,
    noise: NoiseModel,
    backend: Box<dyn Backend>,
    memory: TensorNetworkStore,
    cache: VecDeque<MeasurementRecord>,
    regressor: AffectRegressor,
    fidelity: FidelityMetrics,
    context: EmotionalContext,
    current_state: Option<ChainState>,
    rng: SmallRng,
}

impl ClassicalBridge {
    /// Build with the backend the factory picks for `config.backend`, initialized.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let mut backend = backend::create(config.backend, config.n_qubits)?;
        backend.init()?;
        Self::with_backend(config, backend)
    }

    /// Build around a caller-supplied backend. Its lifecycle stays with the caller.
    pub fn with_backend(config: BridgeConfig, backend: Box<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let codec = StateCodec::new(config.n_qubits, config.entanglement_pattern)?;
        if config.n_qubits > backend.capabilities().max_qubits {
            return Err(CoreError::QubitBudget {
                requested: config.n_qubits,
                limit: backend.capabilities().max_qubits,
            });
        }
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Ok(Self {
            noise: NoiseModel::new(config.noise)?,
            memory: TensorNetworkStore::new(config.memory.clone())?,
            regressor: AffectRegressor::new(codec.layout()),
            cache: VecDeque::with_capacity(config.cache_capacity),
            fidelity: FidelityMetrics::default(),
            context: EmotionalContext::default(),
            current_state: None,
            codec,
            backend,
            config,
            rng,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn codec(&self) -> &StateCodec {
        &self.codec
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    pub fn shutdown(&mut self) {
        self.backend.shutdown();
    }

    pub fn memory(&self) -> &TensorNetworkStore {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut TensorNetworkStore {
        &mut self.memory
    }

    pub fn measurement_cache(&self) -> &VecDeque<MeasurementRecord> {
        &self.cache
    }

    pub fn current_state(&self) -> Option<&ChainState> {
        self.current_state.as_ref()
    }

    pub fn fidelity_metrics(&self) -> &FidelityMetrics {
        &self.fidelity
    }

    pub fn context(&self) -> &EmotionalContext {
        &self.context
    }

    pub fn regressor(&self) -> &AffectRegressor {
        &self.regressor
    }

    /// Encode, apply the noise model and optionally file the state in memory.
    pub fn encode_classical_to_quantum(&mut self, affect: AffectVector, store: bool) -> Result<ChainState> {
        self.encode_and_store(affect, store).map(|(state, _)| state)
    }

    /// As [`Self::encode_classical_to_quantum`], also returning what the memory store did.
    pub fn encode_and_store(
        &mut self,
        affect: AffectVector,
        store: bool,
    ) -> Result<(ChainState, Option<StoreOutcome>)> {
        let mut state = self.codec.encode(affect)?;
        self.noise.apply(&mut state, &mut self.rng)?;

        let outcome = if store {
            let metadata = BTreeMap::from([
                ("source".to_string(), "encode".to_string()),
                ("pattern".to_string(), self.codec.pattern().as_str().to_string()),
            ]);
            Some(self.memory.store_memory(affect, state.clone(), metadata)?)
        } else {
            None
        };

        self.context.encode_count += 1;
        self.context.last_affect = Some(affect);
        self.context.memory_count = self.memory.len();
        self.current_state = Some(state.clone());
        Ok((state, outcome))
    }

    /// Sample `shots` outcomes, decode, mitigate against recent history and
    /// push the result into the measurement cache.
    pub fn decode_quantum_to_classical(&mut self, state: &ChainState, shots: usize) -> Result<ClassicalState> {
        let raw = measure(
            &self.codec,
            self.backend.as_ref(),
            self.config.readout_error,
            state,
            shots,
            &mut self.rng,
        )?;

        let mitigated = self.config.error_mitigation && !self.cache.is_empty();
        let mut affect = raw.affect;
        if mitigated {
            let window = self.config.mitigation_window.min(self.cache.len());
            let recent = self.cache.iter().rev().take(window).map(|r| r.affect);
            if let Some(mean) = AffectVector::mean(recent) {
                let fullness = (self.cache.len() as f64 / self.config.cache_capacity as f64).min(1.0);
                affect = affect.blend(mean, MAX_MITIGATION_WEIGHT * fullness);
            }
        }
        let [dp, da, dd] = self.context.calibration_offsets;
        affect = AffectVector::new(affect.pleasure + dp, affect.arousal + da, affect.dominance + dd);

        let result = ClassicalState {
            affect,
            raw_affect: raw.affect,
            confidence: confidence(&raw, shots),
            measurement_fidelity: raw.fidelity,
            entanglement_measure: raw.exact.entanglement_measure,
            coherence: raw.exact.coherence,
            purity: raw.exact.purity,
            shots,
            counts: raw.counts,
            mitigated,
            timestamp: Utc::now(),
        };

        if self.cache.len() >= self.config.cache_capacity {
            self.cache.pop_front();
        }
        self.cache.push_back(MeasurementRecord {
            affect: result.affect,
            confidence: result.confidence,
            timestamp: result.timestamp,
            fidelity: result.measurement_fidelity,
            raw_counts: result.counts.clone(),
        });
        self.fidelity.record(result.measurement_fidelity, result.confidence);
        self.context.decode_count += 1;
        self.context.last_affect = Some(result.affect);
        Ok(result)
    }

    /// Encode then decode with `shots` samples.
    pub fn process(&mut self, affect: AffectVector, shots: usize) -> Result<ClassicalState> {
        let state = self.encode_classical_to_quantum(affect, false)?;
        self.decode_quantum_to_classical(&state, shots)
    }

    /// Blend of the sampled decode and the regressor's prediction;
    /// `quantum_weight` 1 is purely sampled, 0 purely regressed.
    pub fn hybrid_process(&mut self, affect: AffectVector, quantum_weight: f64) -> Result<HybridResult> {
        let state = self.encode_classical_to_quantum(affect, false)?;
        let quantum = self.decode_quantum_to_classical(&state, self.config.default_shots)?;
        let classical = self.regressor.predict(&state)?;
        let w = quantum_weight.clamp(0.0, 1.0);
        Ok(HybridResult {
            affect: classical.blend(quantum.affect, w),
            quantum,
            classical,
            quantum_weight: w,
        })
    }

    /// Interpolated path `sqrt(1 - t) |start> + sqrt(t) |end>`, renormalized.
    ///
    /// Endpoints are encoded without noise, decodes skip mitigation and the
    /// cache, and sampling is seeded from the endpoints, so the same inputs
    /// always give the same path.
    pub fn create_emotional_trajectory(
        &self,
        start: AffectVector,
        end: AffectVector,
        steps: usize,
    ) -> Result<Vec<ClassicalState>> {
        if steps == 0 {
            return Ok(Vec::new());
        }
        let a = self.codec.encode(start)?;
        let b = self.codec.encode(end)?;
        let mut rng = SmallRng::seed_from_u64(trajectory_seed(start, end));
        let shots = self.config.default_shots;

        let mut path = Vec::with_capacity(steps);
        for i in 0..steps {
            let t = if steps == 1 { 0.0 } else { i as f64 / (steps - 1) as f64 };
            let mut state = a.superpose(
                num_complex::Complex64::new((1.0 - t).sqrt(), 0.0),
                &b,
                num_complex::Complex64::new(t.sqrt(), 0.0),
            )?;
            state.normalize()?;
            let raw = measure(&self.codec, self.backend.as_ref(), 0.0, &state, shots, &mut rng)?;
            path.push(ClassicalState {
                affect: raw.affect,
                raw_affect: raw.affect,
                confidence: confidence(&raw, shots),
                measurement_fidelity: raw.fidelity,
                entanglement_measure: raw.exact.entanglement_measure,
                coherence: raw.exact.coherence,
                purity: raw.exact.purity,
                shots,
                counts: raw.counts,
                mitigated: false,
                timestamp: Utc::now(),
            });
        }
        Ok(path)
    }

    /// Distances between the noise-free encodings of two affects.
    pub fn measure_emotional_distance(&self, a: AffectVector, b: AffectVector) -> Result<EmotionalDistance> {
        let sa = self.codec.encode(a)?;
        let sb = self.codec.encode(b)?;
        EmotionalDistance::between(&sa, &sb, a, b)
    }

    /// Measure reference affects through the full noisy pipeline without
    /// mitigation, store the mean per-dimension bias as offsets and fit the
    /// regressor on the same states.
    pub fn calibrate(&mut self, references: &[AffectVector], shots: usize) -> Result<CalibrationReport> {
        if references.is_empty() {
            return Err(CoreError::InvalidConfig("calibration needs at least one reference".into()));
        }
        let mut errors = Vec::with_capacity(references.len());
        let mut samples = Vec::with_capacity(references.len());
        for &reference in references {
            let mut state = self.codec.encode(reference)?;
            self.noise.apply(&mut state, &mut self.rng)?;
            let raw = measure(
                &self.codec,
                self.backend.as_ref(),
                self.config.readout_error,
                &state,
                shots,
                &mut self.rng,
            )?;
            let target = reference.to_array();
            let got = raw.affect.to_array();
            errors.push([target[0] - got[0], target[1] - got[1], target[2] - got[2]]);
            samples.push((AffectRegressor::features(&state)?, reference));
        }

        let n = errors.len() as f64;
        let offsets: [f64; 3] = std::array::from_fn(|d| errors.iter().map(|e| e[d]).sum::<f64>() / n);
        let mean_error_before = errors.iter().flatten().map(|e| e.abs()).sum::<f64>() / (3.0 * n);
        let mean_error_after = errors
            .iter()
            .flat_map(|e| (0..3).map(move |d| (e[d] - offsets[d]).abs()))
            .sum::<f64>()
            / (3.0 * n);
        let regressor_mse = self.regressor.train(&samples, CALIBRATION_EPOCHS);

        self.context.calibration_offsets = offsets;
        self.context.calibrated_at = Some(Utc::now());
        Ok(CalibrationReport {
            samples: references.len(),
            offsets,
            mean_error_before,
            mean_error_after,
            regressor_mse,
        })
    }

    pub fn recall(&mut self, affect: AffectVector, top_k: usize) -> Vec<MemoryMatch> {
        self.memory.find_similar_memories(affect, top_k)
    }

    pub fn export_document(&self, quantum_state_checksum: Option<String>) -> EngineDocument {
        let device = self.backend.name();
        let mut context = self.context.clone();
        context.memory_count = self.memory.len();
        EngineDocument {
            metadata: DocumentMetadata {
                version: DOCUMENT_VERSION.to_string(),
                timestamp: Utc::now(),
                quantum_state_checksum,
                device: device.to_string(),
                n_measurements_cached: self.cache.len(),
            },
            interface_config: self.config.to_interface(device),
            measurement_cache: self.cache.iter().map(Into::into).collect(),
            compression_metrics: self.memory.compression_metrics().clone(),
            fidelity_metrics: self.fidelity.clone(),
            emotional_context: context,
            classical_network_state: Some(self.regressor.state().clone()),
        }
    }

    /// Replace configuration, cache, metrics and regressor from a document.
    /// Codec and backend are rebuilt from the document's interface config;
    /// memory nodes of the configured size are carried over under the new
    /// memory settings, the rest are dropped.
    pub fn import_document(&mut self, doc: EngineDocument) -> Result<()> {
        self.import_state(doc, None)
    }

    pub fn export_archive(&self) -> StateArchive {
        StateArchive {
            current_state: self.current_state.clone(),
            memory_nodes: self.memory.nodes().to_vec(),
        }
    }

    /// Replace the live state and memory nodes. Every chain must match the
    /// configured qubit count.
    pub fn import_archive(&mut self, archive: StateArchive) -> Result<()> {
        check_archive(&archive, self.config.n_qubits)?;
        let metrics = self.memory.compression_metrics().clone();
        self.memory = TensorNetworkStore::from_nodes(self.config.memory.clone(), archive.memory_nodes, metrics)?;
        self.current_state = archive.current_state;
        self.context.memory_count = self.memory.len();
        Ok(())
    }

    /// Apply a document and, optionally, its side-car archive together.
    /// Everything is decoded and checked before the engine is touched, so an
    /// error leaves the engine as it was.
    pub fn import_state(&mut self, doc: EngineDocument, archive: Option<StateArchive>) -> Result<()> {
        let config = BridgeConfig::from_interface(&doc.interface_config, self.config.seed);
        config.validate()?;
        let n = config.n_qubits;

        let codec = StateCodec::new(n, config.entanglement_pattern)?;
        let noise = NoiseModel::new(config.noise)?;
        let regressor = match doc.classical_network_state {
            Some(state) => AffectRegressor::from_state(codec.layout(), state)?,
            None => AffectRegressor::new(codec.layout()),
        };

        let (nodes, current_state) = match archive {
            Some(archive) => {
                check_archive(&archive, n)?;
                (archive.memory_nodes, archive.current_state)
            }
            None => {
                let nodes = self
                    .memory
                    .nodes()
                    .iter()
                    .filter(|node| node.state.n_qubits() == n)
                    .cloned()
                    .collect();
                let current = self.current_state.clone().filter(|s| s.n_qubits() == n);
                (nodes, current)
            }
        };
        let memory = TensorNetworkStore::from_nodes(config.memory.clone(), nodes, doc.compression_metrics)?;

        let skip = doc.measurement_cache.len().saturating_sub(config.cache_capacity);
        let cache = doc
            .measurement_cache
            .into_iter()
            .skip(skip)
            .map(MeasurementRecord::from)
            .collect();

        if n != self.config.n_qubits || config.backend != self.config.backend {
            let mut backend = backend::create(config.backend, n)?;
            backend.init()?;
            self.backend.shutdown();
            self.backend = backend;
        }

        self.memory = memory;
        self.cache = cache;
        self.current_state = current_state;
        self.codec = codec;
        self.noise = noise;
        self.regressor = regressor;
        self.fidelity = doc.fidelity_metrics;
        self.context = doc.emotional_context;
        self.context.memory_count = self.memory.len();
        self.config = config;
        Ok(())
    }
}

fn check_archive(archive: &StateArchive, n_qubits: usize) -> Result<()> {
    let chains = archive
        .current_state
        .iter()
        .chain(archive.memory_nodes.iter().map(|node| &node.state));
    for chain in chains {
        if chain.n_qubits() != n_qubits {
            return Err(CoreError::DimensionMismatch {
                expected: n_qubits,
                actual: chain.n_qubits(),
            });
        }
    }
    Ok(())
}
