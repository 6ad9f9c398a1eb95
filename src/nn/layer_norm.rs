//! Layer Normalization module.
//!
//! Normalizes every sample over its last axis (the features), never across the
//! batch, then applies a learned per-feature scale `alpha` and shift `beta`:
//!
//! ```text
//! y = alpha * (x - mean) / sqrt(var + eps) + beta
//! ```
//!
//! `var` is the biased (population) variance of the last axis.

use crate::error::{Error, Result};
use crate::nn::{to_config_map, unique_name, BaseConfig, ConfigMap, Module};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub const DEFAULT_EPS: f32 = 0.001;

fn default_eps() -> f32 {
    DEFAULT_EPS
}

/// Everything needed to reconstruct a `LayerNorm`, minus its learned parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNormConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(default = "default_eps")]
    pub eps: f32,
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            base: BaseConfig::default(),
            eps: DEFAULT_EPS,
        }
    }
}

impl LayerNormConfig {
    pub fn with_eps(eps: f32) -> Self {
        Self {
            eps,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct Params {
    alpha: Tensor, // Learnable gain
    beta: Tensor,  // Learnable bias
}

#[derive(Debug)]
pub struct LayerNorm {
    name: String,
    trainable: bool,
    eps: f32,
    params: Option<Params>,
}

/// Size of the feature (last) axis of `shape`.
fn feature_dim(shape: &[usize]) -> Result<usize> {
    shape.last().copied().ok_or_else(|| Error::InvalidShape {
        shape: shape.to_vec(),
        reason: "layer normalization needs at least one axis".to_string(),
    })
}

impl LayerNorm {
    /// Creates an unbuilt LayerNorm. Parameters are allocated by `build`, or
    /// by the first `call`.
    pub fn new(config: LayerNormConfig) -> Result<Self> {
        if !config.eps.is_finite() || config.eps <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "eps must be a positive finite number, got {}",
                config.eps
            )));
        }
        let name = config.base.name.unwrap_or_else(|| unique_name("layer_norm"));
        log::info!("Initializing LayerNorm '{}' with eps={}", name, config.eps);
        Ok(Self {
            name,
            trainable: config.base.trainable,
            eps: config.eps,
            params: None,
        })
    }

    pub fn with_eps(eps: f32) -> Result<Self> {
        Self::new(LayerNormConfig::with_eps(eps))
    }

    /// Creates a LayerNorm that is built immediately for `features` features.
    pub fn with_features(features: usize, config: LayerNormConfig) -> Result<Self> {
        let mut layer = Self::new(config)?;
        layer.build(&[features])?;
        Ok(layer)
    }

    /// Reconstructs a layer from the mapping produced by [`Module::config`].
    pub fn from_config(config: &ConfigMap) -> Result<Self> {
        let config: LayerNormConfig =
            serde_json::from_value(serde_json::Value::Object(config.clone()))?;
        Self::new(config)
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Feature dimension fixed at build time.
    pub fn features(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.alpha.shape()[0])
    }

    pub fn alpha(&self) -> Option<&Tensor> {
        self.params.as_ref().map(|p| &p.alpha)
    }

    pub fn beta(&self) -> Option<&Tensor> {
        self.params.as_ref().map(|p| &p.beta)
    }

    fn check_features(&self, shape: &[usize]) -> Result<usize> {
        let actual = feature_dim(shape)?;
        match self.features() {
            Some(expected) if expected != actual => Err(Error::ShapeMismatch { expected, actual }),
            _ => Ok(actual),
        }
    }
}

impl Module for LayerNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&mut self, input_shape: &[usize]) -> Result<()> {
        if self.params.is_some() {
            return Err(Error::AlreadyBuilt(self.name.clone()));
        }
        let dim = feature_dim(input_shape)?;
        if dim == 0 {
            return Err(Error::InvalidShape {
                shape: input_shape.to_vec(),
                reason: "the feature axis is empty".to_string(),
            });
        }
        log::info!("Building LayerNorm '{}' with dim={}", self.name, dim);
        // Unit gain and zero bias leave standardized inputs untouched.
        self.params = Some(Params {
            alpha: Tensor::ones(&[dim]),
            beta: Tensor::zeros(&[dim]),
        });
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.params.is_some()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| Error::NotBuilt(self.name.clone()))?;
        let shape = input.shape();
        self.check_features(&shape)?;
        log::trace!("LayerNorm '{}' forward on {:?}", self.name, shape);

        // Statistics over the last axis, kept as a size-1 axis for broadcasting.
        let axis = shape.len() - 1;
        let mean = input.mean_axis(axis, true);
        let variance = input.var_axis(axis, true);

        let normalized = (input - &mean) / &(&variance + self.eps).sqrt();

        // alpha and beta broadcast across every leading axis.
        Ok(&(&params.alpha * &normalized) + &params.beta)
    }

    fn compute_output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.check_features(input_shape)?;
        Ok(input_shape.to_vec())
    }

    fn config(&self) -> Result<ConfigMap> {
        to_config_map(&LayerNormConfig {
            base: BaseConfig {
                name: Some(self.name.clone()),
                trainable: self.trainable,
            },
            eps: self.eps,
        })
    }

    fn parameters(&self) -> Vec<Tensor> {
        match &self.params {
            Some(p) => vec![p.alpha.clone(), p.beta.clone()],
            None => Vec::new(),
        }
    }

    fn trainable(&self) -> bool {
        self.trainable
    }
}
