use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Zero-norm or non-finite state. Callers should re-encode from the
    /// last valid affect vector.
    #[error("degenerate state: {0}")]
    DegenerateState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("qubit budget exceeded: {requested} qubits requested, {limit} supported")]
    QubitBudget { requested: usize, limit: usize },

    #[error("backend '{0}' is not initialized")]
    BackendNotReady(&'static str),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("linear algebra failure: {0}")]
    Linalg(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
