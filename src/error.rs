//! Error types for rusty-norm.

use thiserror::Error;

/// Errors raised by tensors and layers.
#[derive(Debug, Error)]
pub enum Error {
    /// A layer was used before its parameters were allocated.
    #[error("Layer '{0}' has not been built; call `build` with the input shape first")]
    NotBuilt(String),

    /// `build` was called on a layer that already owns parameters.
    #[error("Layer '{0}' has already been built")]
    AlreadyBuilt(String),

    /// The input's last dimension disagrees with the size fixed at build time.
    #[error("Shape mismatch: layer was built for last dimension {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// The shape cannot be normalized at all (rank 0, empty feature axis, ...).
    #[error("Invalid shape {shape:?}: {reason}")]
    InvalidShape { shape: Vec<usize>, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `set_weights` received the wrong number of arrays.
    #[error("Layer '{layer}' expects {expected} weight arrays, got {actual}")]
    WeightCount {
        layer: String,
        expected: usize,
        actual: usize,
    },

    #[error("Weight {index} has shape {actual:?}, expected {expected:?}")]
    WeightShape {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Array(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Serialization(#[from] bincode::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
