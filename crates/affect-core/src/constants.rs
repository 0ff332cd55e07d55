use std::f64::consts::PI;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// Default qubit budget (three groups of nine)
pub const DEFAULT_QUBITS: usize = 27;

/// Largest qubit count a layout accepts (basis indices are u64)
pub const MAX_QUBITS: usize = 60;

/// Largest state that may be materialized as a dense amplitude vector
pub const DENSE_LIMIT: usize = 24;

/// Largest state the dense backend will sample from
pub const DENSE_BACKEND_LIMIT: usize = 20;

/// Coherence is summed exactly up to this many qubits, estimated above
pub const COHERENCE_EXACT_LIMIT: usize = 16;

/// Samples drawn by the coherence estimator
pub const COHERENCE_SAMPLES: usize = 512;

/// Fixed seed for the coherence estimator so decode stays deterministic
pub const COHERENCE_SEED: u64 = 0x00C0_FFEE;

/// Residual superposition (radians of polar angle) kept around each target bit
pub const ENCODING_SPREAD: f64 = 0.05;

/// Amplitude of the sinusoidal per-position phase shift
pub const PHASE_SHIFT_SCALE: f64 = 0.25 * PI;

/// Phase-encoding weights for the pleasure, arousal and dominance groups
pub const PHASE_WEIGHTS: [f64; 3] = [PI / 2.0, PI / 3.0, PI / 4.0];

/// Controlled-phase coupling for nearest-neighbour entanglement
pub const LINEAR_COUPLING: f64 = PI / 4.0;

/// Controlled-phase coupling for hub-and-spoke entanglement
pub const STAR_COUPLING: f64 = PI / 8.0;

/// Default shot count for sampled decodes
pub const DEFAULT_SHOTS: usize = 1024;

/// Measurement history capacity
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Number of recent records blended by error mitigation
pub const MITIGATION_WINDOW: usize = 10;

/// Upper bound of the error-mitigation blend weight
pub const MAX_MITIGATION_WEIGHT: f64 = 0.5;

/// Seed mixed into trajectory sampling
pub const TRAJECTORY_SEED: u64 = 0x7EA1_EC70;
