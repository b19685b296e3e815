//! Quantile regression with a median and a low/high quantile band per output.
//!
//! Predictions interleave `(median_i, low_i, high_i)` per output.

use crate::layout::{InterleavedLayout, qtl};
use crate::objective::{Loss, Metric, ObjectiveError, check_batch};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Zip};

/// Pinball loss `mean(max(q e, (q - 1) e))` with `e = y_true - y_pred`.
pub fn pinball(quantile: f64, y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>) -> f64 {
    let mut total = 0.0;
    Zip::from(&y_true).and(&y_pred).for_each(|&t, &p| {
        let e = t - p;
        total += (quantile * e).max((quantile - 1.0) * e);
    });
    total / y_true.len() as f64
}

/// Writes `weight * d pinball / d y_pred` into `grad`. At `e == 0` the
/// subgradient of the `q e` branch is used.
fn pinball_gradient(
    quantile: f64,
    weight: f64,
    y_true: ArrayView2<f64>,
    y_pred: ArrayView2<f64>,
    grad: ArrayViewMut2<f64>,
) {
    let n = y_true.len() as f64;
    Zip::from(grad)
        .and(&y_true)
        .and(&y_pred)
        .for_each(|g, &t, &p| {
            let slope = if t - p >= 0.0 { -quantile } else { 1.0 - quantile };
            *g = weight * slope / n;
        });
}

fn check_fraction(quantile: f64) {
    assert!(
        quantile > 0.0 && quantile < 1.0,
        "quantile fraction must lie in (0, 1), got {quantile}"
    );
}

/// `2 pinball(0.5, median) + pinball(low, low_col) + pinball(high, high_col)`.
pub struct TripleQuantileLoss {
    layout: InterleavedLayout,
    low_quantile: f64,
    high_quantile: f64,
}

impl TripleQuantileLoss {
    pub fn new(outputs: usize, low_quantile: f64, high_quantile: f64) -> Self {
        check_fraction(low_quantile);
        check_fraction(high_quantile);
        Self {
            layout: InterleavedLayout::quantile(outputs),
            low_quantile,
            high_quantile,
        }
    }

    /// `(component, quantile, weight)` for each term of the loss.
    fn terms(&self) -> [(usize, f64, f64); 3] {
        [
            (qtl::MEDIAN, 0.5, 2.0),
            (qtl::LOW, self.low_quantile, 1.0),
            (qtl::HIGH, self.high_quantile, 1.0),
        ]
    }
}

impl Loss for TripleQuantileLoss {
    fn name(&self) -> &str {
        "triple_quantile_loss"
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        self.layout.check(&y_true, &y_pred)?;
        Ok(self
            .terms()
            .iter()
            .map(|&(component, q, weight)| {
                weight * pinball(q, y_true, self.layout.component(&y_pred, component))
            })
            .sum())
    }

    fn gradient(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<Array2<f64>, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        self.layout.check(&y_true, &y_pred)?;
        let mut grad = Array2::zeros(y_pred.raw_dim());
        for (component, q, weight) in self.terms() {
            pinball_gradient(
                q,
                weight,
                y_true,
                self.layout.component(&y_pred, component),
                self.layout.component_mut(&mut grad, component),
            );
        }
        Ok(grad)
    }
}

/// Pinball loss of one component at one quantile, tracked while training.
pub struct QuantileMetric {
    layout: InterleavedLayout,
    index: usize,
    quantile: f64,
    name: String,
}

impl QuantileMetric {
    pub fn new(outputs: usize, index: usize, quantile: f64) -> Self {
        assert!(index < qtl::STRIDE, "quantile component index must be 0, 1 or 2");
        check_fraction(quantile);
        Self {
            layout: InterleavedLayout::quantile(outputs),
            index,
            quantile,
            name: format!("quantile_{quantile}"),
        }
    }
}

impl Metric for QuantileMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        self.layout.check(&y_true, &y_pred)?;
        Ok(pinball(
            self.quantile,
            y_true,
            self.layout.component(&y_pred, self.index),
        ))
    }
}
