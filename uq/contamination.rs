//! Robust regression with a Normal/Cauchy contamination model fitted by EM.
//!
//! Every residual is drawn either from Normal(0, sigma^2) with prior `a`, or from
//! an outlier component Cauchy(0, gamma) with prior `1 - a`. The latent matrix
//! `T` holds, per training sample, the posterior membership of both components.
//!
//! [`ContaminationCallback`] owns `a`, `sigma^2`, `gamma^2` and `T` and refits them
//! at every epoch end. [`ContaminationLoss`] reads them per batch and gathers the
//! rows of `T` through the sample index appended to the labels by
//! [`add_index_to_output`]. Those indices refer to the training set only, so the
//! loss is meaningless on any other split.

use crate::callback::{CallbackError, EpochCallback, EpochContext};
use crate::objective::{Loss, Metric, ObjectiveError, check_batch, check_width};
use crate::state::{AdaptiveParam, ParamReader};
use crate::stats::{EPSILON, cauchy_pdf, mean_squared_error, normal_pdf, r_squared};
use crate::types::{History, MetricLog};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip, s};
use rand::Rng;
use rand::distributions::Uniform;
use std::f64::consts::PI;

/// Initial value of both `sigma^2` and `gamma^2`.
const INITIAL_SCALE_SQ: f64 = 0.1;

/// Appends the sample index `0..N` as a trailing label column.
pub fn add_index_to_output(y_train: ArrayView2<f64>) -> Array2<f64> {
    let (rows, cols) = y_train.dim();
    let mut out = Array2::zeros((rows, cols + 1));
    out.slice_mut(s![.., ..cols]).assign(&y_train);
    for (idx, value) in out.column_mut(cols).iter_mut().enumerate() {
        *value = idx as f64;
    }
    out
}

fn squared_residual(y: ArrayView1<f64>, y_hat: ArrayView1<f64>) -> f64 {
    y.iter().zip(y_hat.iter()).map(|(t, p)| (t - p) * (t - p)).sum()
}

fn sample_index(value: f64, len: usize) -> Result<usize, ObjectiveError> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(ObjectiveError::InvalidIndex(value));
    }
    let index = value as usize;
    if index >= len {
        return Err(ObjectiveError::IndexOutOfRange { index, len });
    }
    Ok(index)
}

/// Expected complete-data negative log-likelihood of a batch.
///
/// With `d = sum((y - y_hat)^2)` over the outputs of one sample:
///
/// - `normal = d / (2 sigma^2) + ln(sigma^2) / 2 + ln(2 pi) / 2 - ln(a)`
/// - `cauchy = ln(1 + d / gamma^2) + ln(pi^2 gamma^2) / 2 - ln(1 - a)`
///
/// and the batch loss is `sum(T0[idx] normal + T1[idx] cauchy)`, a sum rather
/// than a mean.
pub struct ContaminationLoss {
    outputs: usize,
    a: ParamReader<f64>,
    sigma_sq: ParamReader<f64>,
    gamma_sq: ParamReader<f64>,
    latent: ParamReader<Array2<f64>>,
}

impl ContaminationLoss {
    pub fn new(
        outputs: usize,
        a: ParamReader<f64>,
        sigma_sq: ParamReader<f64>,
        gamma_sq: ParamReader<f64>,
        latent: ParamReader<Array2<f64>>,
    ) -> Self {
        Self {
            outputs,
            a,
            sigma_sq,
            gamma_sq,
            latent,
        }
    }

    fn check(
        &self,
        y_true: &ArrayView2<f64>,
        y_pred: &ArrayView2<f64>,
    ) -> Result<(), ObjectiveError> {
        check_batch(y_true, y_pred)?;
        check_width("contamination predictions", y_pred.ncols(), self.outputs)?;
        check_width("index-augmented labels", y_true.ncols(), self.outputs + 1)
    }
}

impl Loss for ContaminationLoss {
    fn name(&self) -> &str {
        "contamination_loss"
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        self.check(&y_true, &y_pred)?;
        let a = self.a.get();
        let sigma_sq = self.sigma_sq.get();
        let gamma_sq = self.gamma_sq.get();
        let latent = self.latent.read();

        let normal_offset = 0.5 * sigma_sq.ln() + 0.5 * (2.0 * PI).ln() - a.ln();
        let cauchy_offset = 0.5 * (PI * PI * gamma_sq).ln() - (1.0 - a).ln();

        let mut total = 0.0;
        for (t, p) in y_true.outer_iter().zip(y_pred.outer_iter()) {
            let idx = sample_index(t[self.outputs], latent.nrows())?;
            let d = squared_residual(t.slice(s![..self.outputs]), p);
            let normal = d / (2.0 * sigma_sq) + normal_offset;
            let cauchy = (1.0 + d / gamma_sq).ln() + cauchy_offset;
            total += latent[[idx, 0]] * normal + latent[[idx, 1]] * cauchy;
        }
        Ok(total)
    }

    fn gradient(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<Array2<f64>, ObjectiveError> {
        self.check(&y_true, &y_pred)?;
        let sigma_sq = self.sigma_sq.get();
        let gamma_sq = self.gamma_sq.get();
        let latent = self.latent.read();

        let mut grad = Array2::zeros(y_pred.raw_dim());
        for ((t, p), mut g) in y_true
            .outer_iter()
            .zip(y_pred.outer_iter())
            .zip(grad.outer_iter_mut())
        {
            let idx = sample_index(t[self.outputs], latent.nrows())?;
            let y = t.slice(s![..self.outputs]);
            let d = squared_residual(y, p);
            let weight = latent[[idx, 0]] / sigma_sq + 2.0 * latent[[idx, 1]] / (gamma_sq + d);
            Zip::from(&mut g)
                .and(&y)
                .and(&p)
                .for_each(|g, &target, &estimate| *g = -weight * (target - estimate));
        }
        Ok(grad)
    }
}

/// Epoch-end EM update of the contamination model.
///
/// Each call predicts the whole training set, refits `a` and `sigma^2` in closed
/// form, takes one positivity-preserving gradient step on `gamma^2`, and then
/// recomputes the responsibilities `T` from the refreshed parameters.
pub struct ContaminationCallback {
    x_train: Array2<f64>,
    y_train: Array2<f64>,
    a: AdaptiveParam<f64>,
    sigma_sq: AdaptiveParam<f64>,
    gamma_sq: AdaptiveParam<f64>,
    latent: AdaptiveParam<Array2<f64>>,
    a_history: History,
    sigma_sq_history: History,
    gamma_sq_history: History,
}

impl ContaminationCallback {
    /// Starts from `sigma^2 = gamma^2 = 0.1` and a random split of every sample
    /// between the two components.
    pub fn new<R: Rng + ?Sized>(
        x_train: Array2<f64>,
        y_train: Array2<f64>,
        rng: &mut R,
    ) -> Result<Self, CallbackError> {
        let rows = x_train.nrows();
        if rows != y_train.nrows() {
            return Err(CallbackError::TrainingSetMismatch {
                x_rows: rows,
                y_rows: y_train.nrows(),
            });
        }
        if rows == 0 {
            return Err(CallbackError::EmptyTrainingSet);
        }

        let unit = Uniform::new(0.0, 1.0);
        let mut latent = Array2::zeros((rows, 2));
        for mut row in latent.outer_iter_mut() {
            let normal: f64 = rng.sample(unit);
            row[0] = normal;
            row[1] = 1.0 - normal;
        }
        let a = latent.column(0).mean().unwrap_or(0.5);
        log::debug!("Contamination model initialised over {rows} samples with a={a:.4}");

        Ok(Self {
            x_train,
            y_train,
            a: AdaptiveParam::new(a),
            sigma_sq: AdaptiveParam::new(INITIAL_SCALE_SQ),
            gamma_sq: AdaptiveParam::new(INITIAL_SCALE_SQ),
            latent: AdaptiveParam::new(latent),
            a_history: History::new(),
            sigma_sq_history: History::new(),
            gamma_sq_history: History::new(),
        })
    }

    /// Number of regression outputs, excluding the index column.
    pub fn outputs(&self) -> usize {
        self.y_train.ncols()
    }

    /// A loss reading this callback's parameters.
    pub fn loss(&self) -> ContaminationLoss {
        ContaminationLoss::new(
            self.outputs(),
            self.a.reader(),
            self.sigma_sq.reader(),
            self.gamma_sq.reader(),
            self.latent.reader(),
        )
    }

    pub fn a(&self) -> f64 {
        self.a.get()
    }

    pub fn sigma_sq(&self) -> f64 {
        self.sigma_sq.get()
    }

    pub fn gamma_sq(&self) -> f64 {
        self.gamma_sq.get()
    }

    /// Copy of the responsibilities, one `[normal, outlier]` row per sample.
    pub fn latent(&self) -> Array2<f64> {
        self.latent.read().clone()
    }

    /// Posterior probability that each training sample is an outlier.
    pub fn outlier_probabilities(&self) -> Array1<f64> {
        self.latent.read().column(1).to_owned()
    }

    pub fn a_history(&self) -> &History {
        &self.a_history
    }

    pub fn sigma_sq_history(&self) -> &History {
        &self.sigma_sq_history
    }

    pub fn gamma_sq_history(&self) -> &History {
        &self.gamma_sq_history
    }

    /// One M-step followed by one E-step against predictions for the training set.
    pub fn em_step(
        &mut self,
        y_pred: ArrayView2<f64>,
        learning_rate: f64,
    ) -> Result<(), CallbackError> {
        if !(learning_rate > 0.0 && learning_rate.is_finite()) {
            return Err(CallbackError::InvalidLearningRate(learning_rate));
        }
        if y_pred.dim() != self.y_train.dim() {
            return Err(CallbackError::PredictionShape {
                expected: self.y_train.dim(),
                found: y_pred.dim(),
            });
        }
        let residual_sq: Array1<f64> = Zip::from(self.y_train.rows())
            .and(y_pred.rows())
            .map_collect(squared_residual);

        let (a, sigma_sq, gamma_sq) = self.maximize(&residual_sq, learning_rate);
        self.a.set(a);
        self.sigma_sq.set(sigma_sq);
        self.gamma_sq.set(gamma_sq);

        let mut latent = Array2::zeros((residual_sq.len(), 2));
        Zip::from(latent.rows_mut())
            .and(&residual_sq)
            .par_for_each(|mut row, &r_sq| {
                let r = r_sq.sqrt();
                let normal = a * normal_pdf(r, sigma_sq);
                let outlier = (1.0 - a) * cauchy_pdf(r, gamma_sq);
                let total = normal + outlier;
                if total > 0.0 && total.is_finite() {
                    row[0] = normal / total;
                    row[1] = outlier / total;
                } else {
                    row[0] = 0.0;
                    row[1] = 1.0;
                }
            });
        self.latent.set(latent);

        self.a_history.push(a);
        self.sigma_sq_history.push(sigma_sq);
        self.gamma_sq_history.push(gamma_sq);
        log::info!("a: {a:.6}, sigmaSQ: {sigma_sq:.6}, gammaSQ: {gamma_sq:.6}");
        Ok(())
    }

    /// New `(a, sigma^2, gamma^2)` from the current responsibilities.
    fn maximize(&self, residual_sq: &Array1<f64>, learning_rate: f64) -> (f64, f64, f64) {
        let latent = self.latent.read();
        let normal = latent.column(0);
        let outlier = latent.column(1);
        let normal_mass = normal.sum();
        let outlier_mass = outlier.sum();

        // Kept off 0 and 1 so both log-priors in the loss stay finite.
        let a = (normal_mass / latent.nrows() as f64).clamp(EPSILON, 1.0 - EPSILON);

        let previous_sigma_sq = self.sigma_sq.get();
        let sigma_sq = if normal_mass > 0.0 {
            (normal.dot(residual_sq) / normal_mass).max(EPSILON)
        } else {
            log::warn!(
                "No sample is assigned to the normal component; keeping sigmaSQ={previous_sigma_sq}"
            );
            previous_sigma_sq
        };

        let gamma_sq = self.gamma_sq.get();
        let pull: f64 = Zip::from(&outlier)
            .and(residual_sq)
            .fold(0.0, |acc, &t, &r_sq| acc + t * r_sq / (gamma_sq + r_sq));
        let grad = (0.5 * outlier_mass - pull) / gamma_sq;
        if !grad.is_finite() {
            log::warn!("Non-finite gammaSQ gradient; keeping gammaSQ={gamma_sq}");
            return (a, sigma_sq, gamma_sq);
        }

        let mut eta = learning_rate;
        let mut next = gamma_sq - eta * grad;
        while next <= 0.0 {
            eta /= 2.0;
            next = gamma_sq - eta * grad;
        }
        if eta < learning_rate {
            log::debug!("gammaSQ step shrunk from {learning_rate} to {eta} to stay positive");
        }
        (a, sigma_sq, next)
    }
}

impl EpochCallback for ContaminationCallback {
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        _logs: &MetricLog,
        ctx: &EpochContext<'_>,
    ) -> Result<(), CallbackError> {
        let y_pred = ctx.predictor.predict(self.x_train.view())?;
        log::debug!("epoch {epoch}: refitting contamination model on {} samples", y_pred.nrows());
        self.em_step(y_pred.view(), ctx.learning_rate)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Statistic {
    MeanSquaredError,
    RSquared,
}

/// Regression metric on the prediction columns, ignoring the index column of the labels.
pub struct ContaminationMetric {
    outputs: usize,
    statistic: Statistic,
}

impl ContaminationMetric {
    pub fn mse(outputs: usize) -> Self {
        Self {
            outputs,
            statistic: Statistic::MeanSquaredError,
        }
    }

    pub fn r2(outputs: usize) -> Self {
        Self {
            outputs,
            statistic: Statistic::RSquared,
        }
    }
}

impl Metric for ContaminationMetric {
    fn name(&self) -> &str {
        match self.statistic {
            Statistic::MeanSquaredError => "mse_contamination",
            Statistic::RSquared => "r2_contamination",
        }
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        check_width("contamination predictions", y_pred.ncols(), self.outputs)?;
        check_width("index-augmented labels", y_true.ncols(), self.outputs + 1)?;
        let y = y_true.slice(s![.., ..self.outputs]);
        Ok(match self.statistic {
            Statistic::MeanSquaredError => mean_squared_error(y, y_pred),
            Statistic::RSquared => r_squared(y, y_pred),
        })
    }
}
