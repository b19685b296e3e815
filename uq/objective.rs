//! The loss and metric seam between this crate and an external trainer.
//!
//! A trainer calls [`Loss::evaluate`] and [`Loss::gradient`] once per batch and
//! reports [`Metric`] values under their stable names. Adaptive callbacks look
//! those names up in the resulting [`MetricLog`].

use crate::types::MetricLog;
use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Errors raised while evaluating a loss or a metric on a batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObjectiveError {
    #[error("Cannot evaluate an objective on an empty batch.")]
    EmptyBatch,

    #[error("Ground truth has {y_true} rows but predictions have {y_pred} rows.")]
    RowMismatch { y_true: usize, y_pred: usize },

    #[error("{what} has {found} columns, but {expected} were expected.")]
    WidthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Sample index {0} in the augmented label column is not a non-negative integer.")]
    InvalidIndex(f64),

    #[error("Sample index {index} is outside the training set of {len} samples.")]
    IndexOutOfRange { index: usize, len: usize },
}

/// A training loss over augmented labels and a flat prediction matrix.
pub trait Loss {
    /// Name used when reporting the loss value.
    fn name(&self) -> &str;

    /// Scalar loss for one batch.
    fn evaluate(&self, y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>)
    -> Result<f64, ObjectiveError>;

    /// Derivative of [`Loss::evaluate`] with respect to every entry of `y_pred`.
    fn gradient(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<Array2<f64>, ObjectiveError>;
}

/// A reporting-only statistic over one batch.
pub trait Metric {
    /// Stable key under which the value is logged.
    fn name(&self) -> &str;

    fn evaluate(&self, y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>)
    -> Result<f64, ObjectiveError>;
}

/// Evaluates every metric on the same batch and collects the values by name.
pub fn evaluate_metrics(
    metrics: &[Box<dyn Metric>],
    y_true: ArrayView2<f64>,
    y_pred: ArrayView2<f64>,
) -> Result<MetricLog, ObjectiveError> {
    let mut log = MetricLog::new();
    for metric in metrics {
        let value = metric.evaluate(y_true, y_pred)?;
        log::debug!("metric {} = {:.6}", metric.name(), value);
        log.record(metric.name(), value);
    }
    Ok(log)
}

/// Checks that both matrices describe the same non-empty batch.
pub(crate) fn check_batch(
    y_true: &ArrayView2<f64>,
    y_pred: &ArrayView2<f64>,
) -> Result<usize, ObjectiveError> {
    if y_true.nrows() != y_pred.nrows() {
        return Err(ObjectiveError::RowMismatch {
            y_true: y_true.nrows(),
            y_pred: y_pred.nrows(),
        });
    }
    if y_true.nrows() == 0 {
        return Err(ObjectiveError::EmptyBatch);
    }
    Ok(y_true.nrows())
}

pub(crate) fn check_width(
    what: &'static str,
    found: usize,
    expected: usize,
) -> Result<(), ObjectiveError> {
    if found == expected {
        Ok(())
    } else {
        Err(ObjectiveError::WidthMismatch {
            what,
            expected,
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    struct ColumnSum;

    impl Metric for ColumnSum {
        fn name(&self) -> &str {
            "column_sum"
        }

        fn evaluate(
            &self,
            _y_true: ArrayView2<f64>,
            y_pred: ArrayView2<f64>,
        ) -> Result<f64, ObjectiveError> {
            Ok(y_pred.sum())
        }
    }

    #[test]
    fn metrics_are_logged_by_name() {
        let metrics: Vec<Box<dyn Metric>> = vec![Box::new(ColumnSum)];
        let y = array![[1.0], [2.0]];
        let log = evaluate_metrics(&metrics, y.view(), y.view()).unwrap();
        assert_eq!(log.value("column_sum"), Some(3.0));
    }

    #[test]
    fn batch_checks_reject_mismatched_and_empty_batches() {
        let a = array![[1.0], [2.0]];
        let b = array![[1.0]];
        assert_eq!(
            check_batch(&a.view(), &b.view()),
            Err(ObjectiveError::RowMismatch { y_true: 2, y_pred: 1 })
        );

        let empty = Array2::<f64>::zeros((0, 1));
        assert_eq!(
            check_batch(&empty.view(), &empty.view()),
            Err(ObjectiveError::EmptyBatch)
        );
        assert!(check_width("predictions", 3, 3).is_ok());
        assert!(check_width("predictions", 2, 3).is_err());
    }
}
