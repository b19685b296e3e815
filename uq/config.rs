//! TOML configuration selecting a UQ mode and its parameters.
//!
//! ```toml
//! mode = "quantile"
//! outputs = 2
//! low_quantile = 0.1
//! high_quantile = 0.9
//! ```
//!
//! Every field except `mode` (and `num_classes` for abstention) has a default.

use crate::abstention::{
    AbstentionAccuracy, AbstentionAdapt, AbstentionClassAccuracy, AbstentionRate, AdaptSettings,
    ClassAccuracy, abstention_mask,
};
use crate::callback::{CallbackError, EpochCallback};
use crate::contamination::{ContaminationCallback, ContaminationMetric};
use crate::heteroscedastic::{HeteroscedasticLoss, MeanComponentMetric, MeanLogVariance};
use crate::layout::qtl;
use crate::objective::{Loss, Metric};
use crate::quantile::{QuantileMetric, TripleQuantileLoss};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Mode '{0}' needs the training set to build its objective.")]
    TrainingSetRequired(&'static str),
    #[error(transparent)]
    Callback(#[from] CallbackError),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn default_outputs() -> usize {
    1
}

fn default_low_quantile() -> f64 {
    0.1
}

fn default_high_quantile() -> f64 {
    0.9
}

fn default_em_iterations() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbstentionConfig {
    /// Number of real classes. The abstention output is appended after them.
    pub num_classes: usize,
    #[serde(default)]
    pub adapt: AdaptSettings,
}

impl AbstentionConfig {
    /// Index of the abstention output.
    pub fn abs_index(&self) -> usize {
        self.num_classes
    }

    pub fn width(&self) -> usize {
        self.num_classes + 1
    }

    pub fn callback(&self) -> AbstentionAdapt {
        AbstentionAdapt::new(self.adapt.clone())
    }

    pub fn metrics(&self) -> Vec<Box<dyn Metric>> {
        let abs_index = self.abs_index();
        let mut metrics: Vec<Box<dyn Metric>> = vec![
            Box::new(AbstentionAccuracy::new(abs_index)),
            Box::new(AbstentionRate::new(abs_index)),
        ];
        for class in 0..self.num_classes {
            metrics.push(Box::new(ClassAccuracy::new(class)));
            metrics.push(Box::new(AbstentionClassAccuracy::new(abs_index, class)));
        }
        metrics
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeteroscedasticConfig {
    #[serde(default = "default_outputs")]
    pub outputs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileConfig {
    #[serde(default = "default_outputs")]
    pub outputs: usize,
    #[serde(default = "default_low_quantile")]
    pub low_quantile: f64,
    #[serde(default = "default_high_quantile")]
    pub high_quantile: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContaminationConfig {
    #[serde(default = "default_outputs")]
    pub outputs: usize,
    /// EM updates run by `uqkit evaluate` against fixed predictions.
    #[serde(default = "default_em_iterations")]
    pub em_iterations: usize,
    /// Step size of the `gamma^2` update when no optimizer supplies one.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Seed for the random initial responsibilities.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl ContaminationConfig {
    pub fn callback(
        &self,
        x_train: Array2<f64>,
        y_train: Array2<f64>,
    ) -> Result<ContaminationCallback, ConfigError> {
        if y_train.ncols() != self.outputs {
            return Err(invalid(
                "outputs",
                format!(
                    "configured for {} outputs but the training targets have {} columns",
                    self.outputs,
                    y_train.ncols()
                ),
            ));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        Ok(ContaminationCallback::new(x_train, y_train, &mut rng)?)
    }

    pub fn metrics(&self) -> Vec<Box<dyn Metric>> {
        vec![
            Box::new(ContaminationMetric::mse(self.outputs)),
            Box::new(ContaminationMetric::r2(self.outputs)),
        ]
    }

    /// Loss, metrics and EM callback over the given training set.
    pub fn build_objective(
        &self,
        x_train: Array2<f64>,
        y_train: Array2<f64>,
    ) -> Result<Objective, ConfigError> {
        let callback = self.callback(x_train, y_train)?;
        Ok(Objective {
            loss: Box::new(callback.loss()),
            metrics: self.metrics(),
            callback: Some(Box::new(callback)),
        })
    }
}

/// A mode with its parameters, tagged by `mode` in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UqConfig {
    Abstention(AbstentionConfig),
    Heteroscedastic(HeteroscedasticConfig),
    Quantile(QuantileConfig),
    Contamination(ContaminationConfig),
}

/// Everything a trainer needs for one UQ mode.
pub struct Objective {
    pub loss: Box<dyn Loss>,
    pub metrics: Vec<Box<dyn Metric>>,
    /// Epoch-end hook, for the modes that adapt their loss.
    pub callback: Option<Box<dyn EpochCallback>>,
}

impl UqConfig {
    pub fn mode_name(&self) -> &'static str {
        match self {
            UqConfig::Abstention(_) => "abstention",
            UqConfig::Heteroscedastic(_) => "heteroscedastic",
            UqConfig::Quantile(_) => "quantile",
            UqConfig::Contamination(_) => "contamination",
        }
    }

    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: UqConfig = toml::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded {} configuration from {}", config.mode_name(), path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            UqConfig::Abstention(cfg) => {
                if cfg.num_classes == 0 {
                    return Err(invalid("num_classes", "at least one class is required"));
                }
                let adapt = &cfg.adapt;
                if !(adapt.mu0 >= 0.0 && adapt.mu0.is_finite()) {
                    let reason = format!("must be finite and non-negative, got {}", adapt.mu0);
                    return Err(invalid("adapt.mu0", reason));
                }
                if !(adapt.scale_factor > 0.0 && adapt.scale_factor <= 1.0) {
                    let reason = format!("must lie in (0, 1], got {}", adapt.scale_factor);
                    return Err(invalid("adapt.scale_factor", reason));
                }
                for (field, value) in [
                    ("adapt.target_acc", adapt.target_acc),
                    ("adapt.max_abs", adapt.max_abs),
                ] {
                    if !(0.0..=1.0).contains(&value) {
                        return Err(invalid(field, format!("must lie in [0, 1], got {value}")));
                    }
                }
            }
            UqConfig::Heteroscedastic(cfg) => check_outputs(cfg.outputs)?,
            UqConfig::Quantile(cfg) => {
                check_outputs(cfg.outputs)?;
                for (field, q) in [
                    ("low_quantile", cfg.low_quantile),
                    ("high_quantile", cfg.high_quantile),
                ] {
                    if !(q > 0.0 && q < 1.0) {
                        return Err(invalid(field, format!("must lie in (0, 1), got {q}")));
                    }
                    // The median column already reports `quantile_0.5`.
                    if q == 0.5 {
                        return Err(invalid(field, "0.5 is reserved for the median column"));
                    }
                }
                if cfg.low_quantile >= cfg.high_quantile {
                    let reason = format!(
                        "{} is not below high_quantile {}",
                        cfg.low_quantile, cfg.high_quantile
                    );
                    return Err(invalid("low_quantile", reason));
                }
            }
            UqConfig::Contamination(cfg) => {
                check_outputs(cfg.outputs)?;
                if cfg.em_iterations == 0 {
                    return Err(invalid("em_iterations", "at least one EM update is required"));
                }
                if !(cfg.learning_rate > 0.0 && cfg.learning_rate.is_finite()) {
                    return Err(invalid(
                        "learning_rate",
                        format!("must be finite and positive, got {}", cfg.learning_rate),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Columns of the label matrix the loss expects.
    pub fn label_width(&self) -> usize {
        match self {
            UqConfig::Abstention(cfg) => cfg.width(),
            UqConfig::Heteroscedastic(cfg) => cfg.outputs,
            UqConfig::Quantile(cfg) => cfg.outputs,
            UqConfig::Contamination(cfg) => cfg.outputs + 1,
        }
    }

    /// Columns of the prediction matrix the loss expects.
    pub fn prediction_width(&self) -> usize {
        match self {
            UqConfig::Abstention(cfg) => cfg.width(),
            UqConfig::Heteroscedastic(cfg) => 2 * cfg.outputs,
            UqConfig::Quantile(cfg) => qtl::STRIDE * cfg.outputs,
            UqConfig::Contamination(cfg) => cfg.outputs,
        }
    }

    pub fn metrics(&self) -> Vec<Box<dyn Metric>> {
        match self {
            UqConfig::Abstention(cfg) => cfg.metrics(),
            UqConfig::Heteroscedastic(cfg) => vec![
                Box::new(MeanComponentMetric::r2(cfg.outputs)),
                Box::new(MeanComponentMetric::mae(cfg.outputs)),
                Box::new(MeanComponentMetric::mse(cfg.outputs)),
                Box::new(MeanLogVariance::new(cfg.outputs)),
            ],
            UqConfig::Quantile(cfg) => vec![
                Box::new(QuantileMetric::new(cfg.outputs, qtl::MEDIAN, 0.5)),
                Box::new(QuantileMetric::new(cfg.outputs, qtl::LOW, cfg.low_quantile)),
                Box::new(QuantileMetric::new(cfg.outputs, qtl::HIGH, cfg.high_quantile)),
            ],
            UqConfig::Contamination(cfg) => cfg.metrics(),
        }
    }

    /// Loss, metrics and callback for every mode that does not depend on the
    /// training set. Contamination goes through
    /// [`ContaminationConfig::build_objective`].
    pub fn build_objective(&self) -> Result<Objective, ConfigError> {
        self.validate()?;
        match self {
            UqConfig::Abstention(cfg) => {
                let callback = cfg.callback();
                let loss = callback.loss(abstention_mask(cfg.width(), cfg.abs_index()));
                Ok(Objective {
                    loss: Box::new(loss),
                    metrics: cfg.metrics(),
                    callback: Some(Box::new(callback)),
                })
            }
            UqConfig::Heteroscedastic(cfg) => Ok(Objective {
                loss: Box::new(HeteroscedasticLoss::new(cfg.outputs)),
                metrics: self.metrics(),
                callback: None,
            }),
            UqConfig::Quantile(cfg) => Ok(Objective {
                loss: Box::new(TripleQuantileLoss::new(
                    cfg.outputs,
                    cfg.low_quantile,
                    cfg.high_quantile,
                )),
                metrics: self.metrics(),
                callback: None,
            }),
            UqConfig::Contamination(_) => Err(ConfigError::TrainingSetRequired("contamination")),
        }
    }
}

fn check_outputs(outputs: usize) -> Result<(), ConfigError> {
    if outputs == 0 {
        return Err(invalid("outputs", "at least one output is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricLog;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(text: &str) -> Result<UqConfig, ConfigError> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
        UqConfig::load(file.path())
    }

    #[test]
    fn defaults_fill_missing_fields() {
        assert_eq!(
            parse("mode = \"quantile\"\n").unwrap(),
            UqConfig::Quantile(QuantileConfig {
                outputs: 1,
                low_quantile: 0.1,
                high_quantile: 0.9,
            })
        );
        assert_eq!(
            parse("mode = \"contamination\"\noutputs = 2\n").unwrap(),
            UqConfig::Contamination(ContaminationConfig {
                outputs: 2,
                em_iterations: 1,
                learning_rate: 1e-3,
                seed: 42,
            })
        );
    }

    #[test]
    fn abstention_settings_come_from_a_nested_table() {
        let config =
            parse("mode = \"abstention\"\nnum_classes = 3\n\n[adapt]\ntarget_acc = 0.8\n").unwrap();
        let UqConfig::Abstention(cfg) = config else {
            panic!("expected an abstention configuration");
        };
        assert_eq!(cfg.adapt.target_acc, 0.8);
        assert_eq!(cfg.adapt.init_abs_epoch, 4);
        assert_eq!(cfg.adapt.scale_factor, 0.95);
        assert_eq!(cfg.adapt.max_abs, 0.5);
        assert_eq!(cfg.adapt.monitor, "abstention_acc");
        assert_eq!(cfg.width(), 4);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            parse("mode = \"quantile\"\nlow_quantile = 0.0\n"),
            Err(ConfigError::Invalid { field: "low_quantile", .. })
        ));
        assert!(matches!(
            parse("mode = \"quantile\"\nlow_quantile = 0.6\nhigh_quantile = 0.4\n"),
            Err(ConfigError::Invalid { field: "low_quantile", .. })
        ));
        assert!(matches!(
            parse("mode = \"quantile\"\nlow_quantile = 0.5\n"),
            Err(ConfigError::Invalid { field: "low_quantile", .. })
        ));
        assert!(matches!(
            parse("mode = \"quantile\"\nhigh_quantile = 0.5\n"),
            Err(ConfigError::Invalid { field: "high_quantile", .. })
        ));
        assert!(matches!(
            parse("mode = \"heteroscedastic\"\noutputs = 0\n"),
            Err(ConfigError::Invalid { field: "outputs", .. })
        ));
        assert!(matches!(
            parse("mode = \"abstention\"\nnum_classes = 2\n[adapt]\nscale_factor = 1.5\n"),
            Err(ConfigError::Invalid { field: "adapt.scale_factor", .. })
        ));
        assert!(matches!(parse("mode = \"dropout\"\n"), Err(ConfigError::TomlParseError(_))));
        assert!(matches!(parse("mode = \"abstention\"\n"), Err(ConfigError::TomlParseError(_))));
    }

    #[test]
    fn save_and_load_round_trip() {
        let config = UqConfig::Abstention(AbstentionConfig {
            num_classes: 5,
            adapt: AdaptSettings {
                mu0: 0.5,
                ..AdaptSettings::default()
            },
        });
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        assert_eq!(UqConfig::load(file.path()).unwrap(), config);
    }

    #[test]
    fn widths_follow_the_mode() {
        let het = UqConfig::Heteroscedastic(HeteroscedasticConfig { outputs: 3 });
        assert_eq!((het.label_width(), het.prediction_width()), (3, 6));
        let qtl = UqConfig::Quantile(QuantileConfig {
            outputs: 2,
            low_quantile: 0.1,
            high_quantile: 0.9,
        });
        assert_eq!((qtl.label_width(), qtl.prediction_width()), (2, 6));
        let cont = UqConfig::Contamination(ContaminationConfig {
            outputs: 1,
            em_iterations: 1,
            learning_rate: 1e-3,
            seed: 42,
        });
        assert_eq!((cont.label_width(), cont.prediction_width()), (2, 1));
    }

    #[test]
    fn abstention_objective_reports_per_class_metrics() {
        let config = parse("mode = \"abstention\"\nnum_classes = 2\n").unwrap();
        let objective = config.build_objective().unwrap();
        let names: Vec<&str> = objective.metrics.iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            vec![
                "abstention_acc",
                "abstention",
                "acc_class_0",
                "abstention_acc_class_0",
                "acc_class_1",
                "abstention_acc_class_1",
            ]
        );
        assert!(objective.callback.is_some());

        let y_true = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let y_pred = array![[0.7, 0.2, 0.1], [0.2, 0.7, 0.1]];
        let loss = objective.loss.evaluate(y_true.view(), y_pred.view()).unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn quantile_objective_uses_the_configured_band() {
        let config =
            parse("mode = \"quantile\"\nlow_quantile = 0.25\nhigh_quantile = 0.75\n").unwrap();
        let objective = config.build_objective().unwrap();
        let names: Vec<&str> = objective.metrics.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["quantile_0.5", "quantile_0.25", "quantile_0.75"]);
        assert!(objective.callback.is_none());
    }

    #[test]
    fn contamination_needs_the_training_set() {
        let config = parse("mode = \"contamination\"\n").unwrap();
        assert!(matches!(
            config.build_objective(),
            Err(ConfigError::TrainingSetRequired("contamination"))
        ));

        let UqConfig::Contamination(cfg) = config else {
            panic!("expected a contamination configuration");
        };
        let x = array![[0.0], [1.0], [2.0]];
        let y = array![[0.1], [0.9], [2.2]];
        let mut objective = cfg.build_objective(x, y.clone()).unwrap();
        let names: Vec<&str> = objective.metrics.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["mse_contamination", "r2_contamination"]);

        let identity = crate::network::PredictFn(|x: ndarray::ArrayView2<f64>| x.to_owned());
        let ctx = crate::callback::EpochContext {
            predictor: &identity,
            learning_rate: cfg.learning_rate,
        };
        let callback = objective.callback.as_mut().unwrap();
        callback.on_epoch_end(0, &MetricLog::new(), &ctx).unwrap();

        let labels = crate::contamination::add_index_to_output(y.view());
        let value = objective
            .loss
            .evaluate(labels.view(), array![[0.0], [1.0], [2.0]].view())
            .unwrap();
        assert!(value.is_finite());

        assert!(matches!(
            cfg.build_objective(Array2::zeros((3, 1)), Array2::zeros((3, 2))),
            Err(ConfigError::Invalid { field: "outputs", .. })
        ));
    }
}
