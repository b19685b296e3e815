//! Heteroscedastic regression: every output predicts a mean and a log-variance.
//!
//! Predictions interleave `(mean_i, log_var_i)` per output. The loss is the
//! Gaussian negative log-likelihood up to constants,
//! `mean(exp(-s) (mu - y)^2 + s)`, averaged over samples and outputs.

use crate::layout::{InterleavedLayout, het};
use crate::objective::{Loss, Metric, ObjectiveError, check_batch};
use crate::stats::{mean_absolute_error, mean_squared_error, r_squared};
use ndarray::{Array2, ArrayView2, Zip};

pub struct HeteroscedasticLoss {
    layout: InterleavedLayout,
}

impl HeteroscedasticLoss {
    pub fn new(outputs: usize) -> Self {
        Self {
            layout: InterleavedLayout::heteroscedastic(outputs),
        }
    }
}

impl Loss for HeteroscedasticLoss {
    fn name(&self) -> &str {
        "heteroscedastic_loss"
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        self.layout.check(&y_true, &y_pred)?;
        let mean = self.layout.component(&y_pred, het::MEAN);
        let log_var = self.layout.component(&y_pred, het::LOG_VARIANCE);

        let mut total = 0.0;
        Zip::from(&y_true)
            .and(&mean)
            .and(&log_var)
            .for_each(|&y, &mu, &s| total += (-s).exp() * (mu - y) * (mu - y) + s);
        Ok(total / y_true.len() as f64)
    }

    fn gradient(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<Array2<f64>, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        self.layout.check(&y_true, &y_pred)?;
        let n = y_true.len() as f64;
        let mean = self.layout.component(&y_pred, het::MEAN);
        let log_var = self.layout.component(&y_pred, het::LOG_VARIANCE);
        let precision = log_var.mapv(|s| (-s).exp());

        let mut grad = Array2::zeros(y_pred.raw_dim());
        Zip::from(self.layout.component_mut(&mut grad, het::MEAN))
            .and(&y_true)
            .and(&mean)
            .and(&precision)
            .for_each(|g, &y, &mu, &p| *g = 2.0 * p * (mu - y) / n);
        Zip::from(self.layout.component_mut(&mut grad, het::LOG_VARIANCE))
            .and(&y_true)
            .and(&mean)
            .and(&precision)
            .for_each(|g, &y, &mu, &p| *g = (1.0 - p * (mu - y) * (mu - y)) / n);
        Ok(grad)
    }
}

/// Which statistic of the mean component a [`MeanComponentMetric`] reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeanStatistic {
    RSquared,
    MeanAbsoluteError,
    MeanSquaredError,
}

/// Regression metric over the mean predictions only; variances are ignored.
pub struct MeanComponentMetric {
    layout: InterleavedLayout,
    statistic: MeanStatistic,
}

impl MeanComponentMetric {
    pub fn new(outputs: usize, statistic: MeanStatistic) -> Self {
        Self {
            layout: InterleavedLayout::heteroscedastic(outputs),
            statistic,
        }
    }

    pub fn r2(outputs: usize) -> Self {
        Self::new(outputs, MeanStatistic::RSquared)
    }

    pub fn mae(outputs: usize) -> Self {
        Self::new(outputs, MeanStatistic::MeanAbsoluteError)
    }

    pub fn mse(outputs: usize) -> Self {
        Self::new(outputs, MeanStatistic::MeanSquaredError)
    }
}

impl Metric for MeanComponentMetric {
    fn name(&self) -> &str {
        match self.statistic {
            MeanStatistic::RSquared => "r2_heteroscedastic",
            MeanStatistic::MeanAbsoluteError => "mae_heteroscedastic",
            MeanStatistic::MeanSquaredError => "mse_heteroscedastic",
        }
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        self.layout.check(&y_true, &y_pred)?;
        let mean = self.layout.component(&y_pred, het::MEAN);
        Ok(match self.statistic {
            MeanStatistic::RSquared => r_squared(y_true, mean),
            MeanStatistic::MeanAbsoluteError => mean_absolute_error(y_true, mean),
            MeanStatistic::MeanSquaredError => mean_squared_error(y_true, mean),
        })
    }
}

/// Mean of the predicted log-variances, a calibration diagnostic.
pub struct MeanLogVariance {
    layout: InterleavedLayout,
}

impl MeanLogVariance {
    pub fn new(outputs: usize) -> Self {
        Self {
            layout: InterleavedLayout::heteroscedastic(outputs),
        }
    }
}

impl Metric for MeanLogVariance {
    fn name(&self) -> &str {
        "meanS_heteroscedastic"
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        self.layout.check(&y_true, &y_pred)?;
        let log_var = self.layout.component(&y_pred, het::LOG_VARIANCE);
        Ok(log_var.mean().unwrap_or(0.0))
    }
}
