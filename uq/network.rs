//! A typed, sequential layer graph.
//!
//! This is the minimal model representation the output augmenter needs: the
//! last fully-connected projection is found by its [`Layer::Dense`] tag rather
//! than by inspecting layer names. The forward pass is inference only; training
//! is the business of the external trainer.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Layer {layer} expects {expected} inputs, but the preceding layer produces {found}.")]
    WidthMismatch {
        layer: usize,
        expected: usize,
        found: usize,
    },
    #[error("Input batch has {found} features, but the network was built for {expected}.")]
    InputMismatch { expected: usize, found: usize },
    #[error("Dense layer '{0}' must have at least one input and one unit.")]
    EmptyDense(String),
    #[error("Bias of dense layer '{name}' has {found} entries for {units} units.")]
    BiasMismatch {
        name: String,
        units: usize,
        found: usize,
    },
    #[error("Dropout rate must lie in [0, 1), got {0}.")]
    InvalidDropout(f64),
    #[error("Normalization epsilon must be positive, got {0}.")]
    InvalidEpsilon(f64),
    #[error("Unknown activation function '{0}'.")]
    UnknownActivation(String),
    #[error("Failed to read or write network file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML network file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize network to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    /// Applies the activation to every row of `z` in place.
    pub fn apply(self, z: &mut Array2<f64>) {
        match self {
            Activation::Linear => {}
            Activation::Relu => z.mapv_inplace(|v| v.max(0.0)),
            Activation::Sigmoid => {
                z.mapv_inplace(|v| 1.0 / (1.0 + (-v.clamp(-700.0, 700.0)).exp()))
            }
            Activation::Tanh => z.mapv_inplace(f64::tanh),
            Activation::Softmax => {
                for mut row in z.axis_iter_mut(Axis(0)) {
                    let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let total = row.sum();
                    row.mapv_inplace(|v| v / total);
                }
            }
        }
    }
}

impl FromStr for Activation {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            "softmax" => Ok(Activation::Softmax),
            other => Err(NetworkError::UnknownActivation(other.to_string())),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Softmax => "softmax",
        };
        f.write_str(name)
    }
}

/// Fully-connected projection `x W + b` followed by an activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub name: String,
    pub activation: Activation,
    /// Shape `[inputs, units]`.
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Dense {
    /// Glorot-uniform weights and a zero bias.
    pub fn glorot<R: Rng + ?Sized>(
        name: impl Into<String>,
        inputs: usize,
        units: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let limit = (6.0 / (inputs + units).max(1) as f64).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        Self {
            name: name.into(),
            activation,
            weights: Array2::from_shape_fn((inputs, units), |_| rng.sample(dist)),
            bias: Array1::zeros(units),
        }
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    pub fn units(&self) -> usize {
        self.weights.ncols()
    }

    fn forward(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut z = x.dot(&self.weights);
        z += &self.bias;
        self.activation.apply(&mut z);
        z
    }
}

/// Per-sample feature normalization with a learned scale and shift per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub epsilon: f64,
    pub scale: Array1<f64>,
    pub shift: Array1<f64>,
}

impl Normalization {
    pub fn new(width: usize, epsilon: f64) -> Self {
        Self {
            epsilon,
            scale: Array1::ones(width),
            shift: Array1::zeros(width),
        }
    }

    pub fn width(&self) -> usize {
        self.scale.len()
    }

    fn forward(&self, mut x: Array2<f64>) -> Array2<f64> {
        for mut row in x.axis_iter_mut(Axis(0)) {
            let mean = row.mean().unwrap_or(0.0);
            let var = row.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
            let inv = 1.0 / (var + self.epsilon).sqrt();
            row.mapv_inplace(|v| (v - mean) * inv);
        }
        x *= &self.scale;
        x += &self.shift;
        x
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layer {
    Dense(Dense),
    Activation { function: Activation },
    Dropout { rate: f64 },
    Normalization(Normalization),
}

impl Layer {
    pub fn as_dense(&self) -> Option<&Dense> {
        match self {
            Layer::Dense(dense) => Some(dense),
            _ => None,
        }
    }

    /// Width this layer expects on its input, if it fixes one.
    fn expected_input(&self) -> Option<usize> {
        match self {
            Layer::Dense(dense) => Some(dense.inputs()),
            Layer::Normalization(norm) => Some(norm.width()),
            Layer::Activation { .. } | Layer::Dropout { .. } => None,
        }
    }

    fn output_width(&self, input: usize) -> usize {
        match self {
            Layer::Dense(dense) => dense.units(),
            _ => input,
        }
    }

    /// Recreates this layer from its configuration for a new input width.
    /// Per-feature parameters are re-initialised; dense layers keep their shape.
    pub fn rebuild(&self, width: usize) -> Layer {
        match self {
            Layer::Normalization(norm) => {
                Layer::Normalization(Normalization::new(width, norm.epsilon))
            }
            other => other.clone(),
        }
    }

    fn forward(&self, x: Array2<f64>) -> Array2<f64> {
        match self {
            Layer::Dense(dense) => dense.forward(x.view()),
            Layer::Activation { function } => {
                let mut z = x;
                function.apply(&mut z);
                z
            }
            // Inference: dropout passes activations through unchanged.
            Layer::Dropout { .. } => x,
            Layer::Normalization(norm) => norm.forward(x),
        }
    }

    fn validate(&self) -> Result<(), NetworkError> {
        match self {
            Layer::Dense(dense) => {
                if dense.inputs() == 0 || dense.units() == 0 {
                    return Err(NetworkError::EmptyDense(dense.name.clone()));
                }
                if dense.bias.len() != dense.units() {
                    return Err(NetworkError::BiasMismatch {
                        name: dense.name.clone(),
                        units: dense.units(),
                        found: dense.bias.len(),
                    });
                }
                Ok(())
            }
            Layer::Dropout { rate } if !(0.0..1.0).contains(rate) => {
                Err(NetworkError::InvalidDropout(*rate))
            }
            Layer::Normalization(norm) if !(norm.epsilon > 0.0) => {
                Err(NetworkError::InvalidEpsilon(norm.epsilon))
            }
            _ => Ok(()),
        }
    }
}

/// Anything that maps a feature batch to a flat prediction matrix.
pub trait Predictor {
    fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, NetworkError>;
}

/// Adapts a plain closure into a [`Predictor`].
pub struct PredictFn<F>(pub F);

impl<F> Predictor for PredictFn<F>
where
    F: Fn(ArrayView2<f64>) -> Array2<f64>,
{
    fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, NetworkError> {
        Ok((self.0)(x))
    }
}

/// A validated sequential stack of layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    input_dim: usize,
    layers: Vec<Layer>,
}

impl Network {
    pub fn new(input_dim: usize, layers: Vec<Layer>) -> Result<Self, NetworkError> {
        let mut width = input_dim;
        for (idx, layer) in layers.iter().enumerate() {
            layer.validate()?;
            if let Some(expected) = layer.expected_input() {
                if expected != width {
                    return Err(NetworkError::WidthMismatch {
                        layer: idx,
                        expected,
                        found: width,
                    });
                }
            }
            width = layer.output_width(width);
        }
        Ok(Self { input_dim, layers })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn output_dim(&self) -> usize {
        self.layers
            .iter()
            .fold(self.input_dim, |width, layer| layer.output_width(width))
    }

    /// Width flowing into layer `idx`.
    pub fn width_before(&self, idx: usize) -> usize {
        self.layers[..idx]
            .iter()
            .fold(self.input_dim, |width, layer| layer.output_width(width))
    }

    pub fn save(&self, path: &Path) -> Result<(), NetworkError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a network from TOML, re-checking that the layer widths chain.
    pub fn load(path: &Path) -> Result<Self, NetworkError> {
        let toml_string = fs::read_to_string(path)?;
        let raw: Network = toml::from_str(&toml_string)?;
        Network::new(raw.input_dim, raw.layers)
    }
}

impl Predictor for Network {
    fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, NetworkError> {
        if x.ncols() != self.input_dim {
            return Err(NetworkError::InputMismatch {
                expected: self.input_dim,
                found: x.ncols(),
            });
        }
        let mut activations = x.to_owned();
        for layer in &self.layers {
            activations = layer.forward(activations);
        }
        Ok(activations)
    }
}

/// Incremental construction of a [`Network`] with seeded weight initialisation.
pub struct NetworkBuilder {
    input_dim: usize,
    width: usize,
    layers: Vec<Layer>,
    rng: StdRng,
}

impl NetworkBuilder {
    pub fn new(input_dim: usize, seed: u64) -> Self {
        Self {
            input_dim,
            width: input_dim,
            layers: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn dense(mut self, units: usize, activation: Activation) -> Self {
        let dense_count = self.layers.iter().filter(|l| l.as_dense().is_some()).count();
        let name = if dense_count == 0 {
            "dense".to_string()
        } else {
            format!("dense_{dense_count}")
        };
        let layer = Dense::glorot(name, self.width, units, activation, &mut self.rng);
        self.width = units;
        self.layers.push(Layer::Dense(layer));
        self
    }

    pub fn activation(mut self, function: Activation) -> Self {
        self.layers.push(Layer::Activation { function });
        self
    }

    pub fn dropout(mut self, rate: f64) -> Self {
        self.layers.push(Layer::Dropout { rate });
        self
    }

    pub fn normalization(mut self, epsilon: f64) -> Self {
        self.layers
            .push(Layer::Normalization(Normalization::new(self.width, epsilon)));
        self
    }

    pub fn build(self) -> Result<Network, NetworkError> {
        Network::new(self.input_dim, self.layers)
    }
}
