pub mod layer_norm;

use crate::error::{Error, Result};
use crate::tensor::Tensor;
use ndarray::ArrayD;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError};

/// Exported layer configuration: a flat key/value mapping.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Per-prefix counters behind auto-generated layer names.
static NAME_COUNTERS: Lazy<Mutex<HashMap<&'static str, usize>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns `prefix` the first time it is requested, then `prefix_1`, `prefix_2`, ...
pub fn unique_name(prefix: &'static str) -> String {
    let mut counters = NAME_COUNTERS.lock().unwrap_or_else(PoisonError::into_inner);
    let count = counters.entry(prefix).or_insert(0);
    let name = if *count == 0 {
        prefix.to_string()
    } else {
        format!("{}_{}", prefix, count)
    };
    *count += 1;
    name
}

fn default_trainable() -> bool {
    true
}

/// Configuration shared by every layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Resolved to a unique name when the layer is constructed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_trainable")]
    pub trainable: bool,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            name: None,
            trainable: true,
        }
    }
}

impl BaseConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Serializes a config struct into a `ConfigMap`.
pub(crate) fn to_config_map<T: Serialize>(config: &T) -> Result<ConfigMap> {
    match serde_json::to_value(config)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::InvalidConfig(format!(
            "expected a key/value mapping, got {}",
            other
        ))),
    }
}

/// A trait for a neural network layer.
///
/// Layers may allocate their parameters lazily: `build` receives the shape of
/// the first input and sizes the parameters from it. `call` performs that
/// step implicitly before forwarding.
pub trait Module {
    fn name(&self) -> &str;

    /// Allocates the layer's parameters for inputs of `input_shape`.
    /// Must run exactly once per instance.
    fn build(&mut self, input_shape: &[usize]) -> Result<()>;

    fn is_built(&self) -> bool;

    /// Performs a forward pass on the module.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Builds from the input's shape if needed, then runs `forward`.
    fn call(&mut self, input: &Tensor) -> Result<Tensor> {
        if !self.is_built() {
            self.build(&input.shape())?;
        }
        self.forward(input)
    }

    /// Shape of the output produced for an input of `input_shape`.
    fn compute_output_shape(&self, input_shape: &[usize]) -> Result<Vec<usize>>;

    /// Exports enough configuration to construct an equivalent, unbuilt layer.
    fn config(&self) -> Result<ConfigMap>;

    /// Returns a vector of all learnable parameters in the module.
    fn parameters(&self) -> Vec<Tensor>;

    fn trainable(&self) -> bool;

    /// Parameters an optimizer should update; empty for frozen layers.
    fn trainable_parameters(&self) -> Vec<Tensor> {
        if self.trainable() {
            self.parameters()
        } else {
            Vec::new()
        }
    }

    /// Zeros out the gradients for all parameters in the module.
    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }

    /// Copies of the parameter data, in `parameters()` order.
    fn weights(&self) -> Vec<ArrayD<f32>> {
        self.parameters().iter().map(|p| p.data().clone()).collect()
    }

    /// Overwrites the parameters. Nothing is written unless every array matches.
    fn set_weights(&mut self, weights: Vec<ArrayD<f32>>) -> Result<()> {
        if !self.is_built() {
            return Err(Error::NotBuilt(self.name().to_string()));
        }
        let params = self.parameters();
        if weights.len() != params.len() {
            return Err(Error::WeightCount {
                layer: self.name().to_string(),
                expected: params.len(),
                actual: weights.len(),
            });
        }
        for (index, (param, weight)) in params.iter().zip(&weights).enumerate() {
            let expected = param.shape();
            if expected.as_slice() != weight.shape() {
                return Err(Error::WeightShape {
                    index,
                    expected,
                    actual: weight.shape().to_vec(),
                });
            }
        }
        for (param, weight) in params.iter().zip(weights) {
            param.assign(weight);
        }
        Ok(())
    }
}

/// Writes the module's weights with `bincode`.
pub fn save_weights<W: Write>(module: &dyn Module, writer: W) -> Result<()> {
    let weights = module.weights();
    bincode::serialize_into(writer, &weights)?;
    log::debug!("Saved {} weight arrays for '{}'", weights.len(), module.name());
    Ok(())
}

/// Reads weights written by [`save_weights`] into an already built module.
pub fn load_weights<R: Read>(module: &mut dyn Module, reader: R) -> Result<()> {
    let weights: Vec<ArrayD<f32>> = bincode::deserialize_from(reader)?;
    let count = weights.len();
    module.set_weights(weights)?;
    log::debug!("Loaded {} weight arrays into '{}'", count, module.name());
    Ok(())
}
