//! Affective-state encoding engine.
//!
//! Encodes a pleasure/arousal/dominance observation into a chain-factorized
//! `2^n` complex state, decodes it back through sampled measurement with
//! history-based error mitigation, and keeps many encoded states in an
//! importance-weighted associative memory with periodic rank truncation.
//!
//! Zero I/O. Persistence lives in `affect-store`.

pub mod affect;
pub mod backend;
pub mod bridge;
pub mod chain;
pub mod codec;
pub mod constants;
pub mod document;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod noise;
pub mod regressor;

pub use affect::AffectVector;
pub use backend::{Backend, BackendKind, Capabilities, ChainBackend, DenseBackend};
pub use bridge::{BridgeConfig, CalibrationReport, ClassicalBridge, ClassicalState, HybridResult};
pub use chain::{ChainState, TruncationReport, format_bitstring, parse_bitstring};
pub use codec::{DecodedState, EntanglementPattern, QubitLayout, StateCodec};
pub use constants::{DEFAULT_QUBITS, DEFAULT_SHOTS, EPSILON};
pub use document::{
    CacheEntry, DOCUMENT_VERSION, EngineDocument, InterfaceConfig, MeasurementRecord, StateArchive,
};
pub use error::{CoreError, Result};
pub use memory::{
    CompressionMetrics, MemoryConfig, MemoryMatch, MemoryNode, StoreOutcome, TensorNetworkStore,
};
pub use metrics::{EmotionalContext, EmotionalDistance, FidelityMetrics};
pub use noise::{NoiseChannel, NoiseConfig, NoiseModel};
pub use regressor::{AffectRegressor, RegressorState};
