#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! Uncertainty-quantification objectives for neural-network training.
//!
//! Four strategies are provided, each pairing a loss over a flat prediction
//! matrix with metrics and (where the strategy adapts) an epoch-end callback:
//!
//! - [`abstention`]: classification with an extra "abstain" output.
//! - [`heteroscedastic`]: regression with a predicted log-variance per output.
//! - [`quantile`]: median plus low/high quantile regression.
//! - [`contamination`]: Normal/Cauchy mixture regression fitted by EM.
//!
//! The surrounding trainer is external. It talks to this crate through the
//! [`objective::Loss`], [`objective::Metric`] and [`callback::EpochCallback`]
//! traits, and through [`augment::add_model_output`] for the output width.

pub mod abstention;
pub mod augment;
pub mod callback;
pub mod config;
pub mod contamination;
pub mod data;
pub mod heteroscedastic;
pub mod layout;
pub mod network;
pub mod objective;
pub mod quantile;
pub mod state;
pub mod stats;
pub mod types;
