//! Widening of a network's final projection for UQ training.
//!
//! Each UQ mode needs more outputs than the base model: abstention adds
//! `num_add` extra classes, quantile regression triples every output and
//! heteroscedastic regression doubles it. The last [`Layer::Dense`] is rebuilt at
//! the new width and every layer after it is recreated from its configuration.

use crate::network::{Activation, Dense, Layer, Network, NetworkError};
use rand::Rng;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AugmentError {
    #[error(
        "Mode '{0}' for adding outputs to the model is not implemented. Expected one of: abstain, qtl, het."
    )]
    UnknownMode(String),
    #[error("Mode 'abstain' requires the number of units to add.")]
    MissingNumAdd,
    #[error("No dense layer was found between the output and the input of the network.")]
    NoDenseLayer,
    #[error("The widened network is inconsistent: {0}")]
    Network(#[from] NetworkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UqMode {
    /// Extra abstention units appended after the class outputs.
    Abstain { num_add: usize },
    /// Median, low and high quantile per output.
    Quantile,
    /// Mean and log-variance per output.
    Heteroscedastic,
}

impl UqMode {
    /// Parses the mode tags `abstain`, `qtl` and `het`.
    pub fn parse(tag: &str, num_add: Option<usize>) -> Result<Self, AugmentError> {
        match tag {
            "abstain" => num_add
                .map(|num_add| UqMode::Abstain { num_add })
                .ok_or(AugmentError::MissingNumAdd),
            "qtl" => Ok(UqMode::Quantile),
            "het" => Ok(UqMode::Heteroscedastic),
            other => Err(AugmentError::UnknownMode(other.to_string())),
        }
    }

    /// Output width of the widened layer given its current width.
    pub fn widen(&self, units: usize) -> usize {
        match self {
            UqMode::Abstain { num_add } => units + num_add,
            UqMode::Quantile => 3 * units,
            UqMode::Heteroscedastic => 2 * units,
        }
    }
}

impl fmt::Display for UqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UqMode::Abstain { num_add } => write!(f, "abstain(+{num_add})"),
            UqMode::Quantile => f.write_str("qtl"),
            UqMode::Heteroscedastic => f.write_str("het"),
        }
    }
}

/// Returns a copy of `network` whose last dense layer has the width `mode` needs.
///
/// The replacement layer keeps the original name and, unless `activation` is
/// given, the original activation. Its weights are freshly initialised from `rng`.
/// `network` itself is left untouched; with `mode == None` an identical copy is
/// returned.
pub fn add_model_output<R: Rng + ?Sized>(
    network: &Network,
    mode: Option<UqMode>,
    activation: Option<Activation>,
    rng: &mut R,
) -> Result<Network, AugmentError> {
    let Some(mode) = mode else {
        return Ok(network.clone());
    };

    let layers = network.layers();
    let (idx, dense) = layers
        .iter()
        .enumerate()
        .rev()
        .find_map(|(idx, layer)| layer.as_dense().map(|dense| (idx, dense)))
        .ok_or(AugmentError::NoDenseLayer)?;

    let new_units = mode.widen(dense.units());
    log::info!(
        "Widening dense layer '{}' (position {}) from {} to {} units for mode {}",
        dense.name,
        idx,
        dense.units(),
        new_units,
        mode
    );

    let inputs = network.width_before(idx);
    let replacement = Dense::glorot(
        dense.name.clone(),
        inputs,
        new_units,
        activation.unwrap_or(dense.activation),
        rng,
    );

    let mut rebuilt = Vec::with_capacity(layers.len());
    rebuilt.extend(layers[..idx].iter().cloned());
    rebuilt.push(Layer::Dense(replacement));
    for layer in &layers[idx + 1..] {
        // Only width-preserving layers follow the last dense one.
        rebuilt.push(layer.rebuild(new_units));
    }

    Ok(Network::new(network.input_dim(), rebuilt)?)
}
