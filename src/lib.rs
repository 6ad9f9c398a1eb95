pub mod error;
pub mod nn;
pub mod tensor;

pub use error::{Error, Result};
pub use nn::layer_norm::{LayerNorm, LayerNormConfig};
pub use nn::Module;
pub use tensor::Tensor;
