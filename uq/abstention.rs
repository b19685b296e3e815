//! Classification with an abstention option.
//!
//! The network gets one extra output, the abstention class, placed after the
//! real classes: `[class_0, .., class_{C-1}, abstain]`. The loss discounts the
//! cross-entropy of samples the model abstains on, but charges a penalty
//! weighted by `mu`. [`AbstentionAdapt`] tunes `mu` between epochs so that the
//! monitored accuracy approaches a target without abstaining on too many samples.

use crate::callback::{CallbackError, EpochCallback, EpochContext};
use crate::objective::{Loss, Metric, ObjectiveError, check_batch, check_width};
use crate::state::{AdaptiveParam, ParamReader};
use crate::stats::{EPSILON, argmax_rows};
use crate::types::{History, MetricLog};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mask selecting the abstention output: 1 at `abs_index`, 0 elsewhere.
pub fn abstention_mask(width: usize, abs_index: usize) -> Array1<f64> {
    assert!(abs_index < width, "abstention index must be one of the outputs");
    let mut mask = Array1::zeros(width);
    mask[abs_index] = 1.0;
    mask
}

/// Cross-entropy on the non-abstention outputs plus a `mu`-weighted abstention penalty.
///
/// For one row with predicted probabilities `p`, one-hot label `t` and mask `m`:
///
/// - `q = (1 - m) p / sum((1 - m) p)`, clipped to `[EPSILON, 1 - EPSILON]`
/// - `ce = -sum(t ln q)`
/// - `a = mean(m p)` across the row
/// - `loss = (1 - a) ce - mu ln(1 - a)`
///
/// The batch loss is the mean over rows.
pub struct AbstentionLoss {
    mask: Array1<f64>,
    mu: ParamReader<f64>,
}

/// Intermediate values of one row, shared by the loss and its gradient.
struct RowTerms {
    base_sum: f64,
    abs_mean: f64,
    cross_entropy: f64,
    /// Normalised base predictions before clipping.
    q: Vec<f64>,
}

impl AbstentionLoss {
    pub fn new(mask: Array1<f64>, mu: ParamReader<f64>) -> Self {
        Self { mask, mu }
    }

    pub fn mask(&self) -> ArrayView1<'_, f64> {
        self.mask.view()
    }

    fn row_terms(&self, t: ArrayView1<f64>, p: ArrayView1<f64>) -> RowTerms {
        let width = p.len() as f64;
        let mut base_sum = 0.0;
        let mut abs_sum = 0.0;
        for (&m, &v) in self.mask.iter().zip(p.iter()) {
            base_sum += (1.0 - m) * v;
            abs_sum += m * v;
        }

        let q: Vec<f64> = self
            .mask
            .iter()
            .zip(p.iter())
            .map(|(&m, &v)| if base_sum > 0.0 { (1.0 - m) * v / base_sum } else { 0.0 })
            .collect();

        let cross_entropy = -t
            .iter()
            .zip(q.iter())
            .map(|(&tj, &qj)| tj * qj.clamp(EPSILON, 1.0 - EPSILON).ln())
            .sum::<f64>();

        RowTerms {
            base_sum,
            abs_mean: abs_sum / width,
            cross_entropy,
            q,
        }
    }

    fn check(
        &self,
        y_true: &ArrayView2<f64>,
        y_pred: &ArrayView2<f64>,
    ) -> Result<usize, ObjectiveError> {
        let rows = check_batch(y_true, y_pred)?;
        check_width("abstention predictions", y_pred.ncols(), self.mask.len())?;
        check_width("augmented labels", y_true.ncols(), self.mask.len())?;
        Ok(rows)
    }
}

impl Loss for AbstentionLoss {
    fn name(&self) -> &str {
        "abstention_loss"
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        let rows = self.check(&y_true, &y_pred)?;
        let mu = self.mu.get();
        let total: f64 = y_true
            .outer_iter()
            .zip(y_pred.outer_iter())
            .map(|(t, p)| {
                let terms = self.row_terms(t, p);
                (1.0 - terms.abs_mean) * terms.cross_entropy - mu * (1.0 - terms.abs_mean).ln()
            })
            .sum();
        Ok(total / rows as f64)
    }

    fn gradient(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<Array2<f64>, ObjectiveError> {
        let rows = self.check(&y_true, &y_pred)?;
        let mu = self.mu.get();
        let width = y_pred.ncols() as f64;
        let mut grad = Array2::zeros(y_pred.raw_dim());

        for ((t, p), mut g) in y_true
            .outer_iter()
            .zip(y_pred.outer_iter())
            .zip(grad.outer_iter_mut())
        {
            let terms = self.row_terms(t, p);
            let keep = 1.0 - terms.abs_mean;
            let unclipped = |qj: f64| (EPSILON..=1.0 - EPSILON).contains(&qj);

            // Labels on unclipped outputs; their derivative flows through the normaliser.
            let live_label_mass: f64 = t
                .iter()
                .zip(terms.q.iter())
                .filter(|&(_, &qj)| unclipped(qj))
                .map(|(&tj, _)| tj)
                .sum();

            let abs_coeff = -terms.cross_entropy + mu / keep;
            for k in 0..p.len() {
                let m = self.mask[k];
                let d_ce = if terms.base_sum > 0.0 {
                    let own = if unclipped(terms.q[k]) {
                        t[k] * (1.0 - m) / terms.q[k]
                    } else {
                        0.0
                    };
                    -(1.0 - m) / terms.base_sum * (own - live_label_mass)
                } else {
                    0.0
                };
                g[k] = (keep * d_ce + abs_coeff * m / width) / rows as f64;
            }
        }
        Ok(grad)
    }
}

/// Accuracy over the samples the model does not abstain on.
///
/// Returns 0 when every sample in the batch abstains.
pub struct AbstentionAccuracy {
    abs_index: usize,
}

impl AbstentionAccuracy {
    pub fn new(abs_index: usize) -> Self {
        Self { abs_index }
    }
}

impl Metric for AbstentionAccuracy {
    fn name(&self) -> &str {
        "abstention_acc"
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        let rows = check_batch(&y_true, &y_pred)?;
        let true_class = argmax_rows(y_true);
        let pred_class = argmax_rows(y_pred);

        let matches = true_class.iter().zip(pred_class.iter()).filter(|(t, p)| t == p).count();
        let abstained = pred_class.iter().filter(|&&p| p == self.abs_index).count();
        let predicted = rows - abstained;
        if predicted == 0 {
            return Ok(0.0);
        }
        Ok(matches as f64 / predicted as f64)
    }
}

/// Fraction of samples whose most probable output is the abstention class.
pub struct AbstentionRate {
    abs_index: usize,
}

impl AbstentionRate {
    pub fn new(abs_index: usize) -> Self {
        Self { abs_index }
    }
}

impl Metric for AbstentionRate {
    fn name(&self) -> &str {
        "abstention"
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        let rows = check_batch(&y_true, &y_pred)?;
        let abstained = argmax_rows(y_pred).iter().filter(|&&p| p == self.abs_index).count();
        Ok(abstained as f64 / rows as f64)
    }
}

/// Accuracy on class `i` over all samples, abstaining ones included.
///
/// The predicted class ignores the trailing abstention column. A batch without
/// ground-truth samples of class `i` scores 0.
pub struct ClassAccuracy {
    class: usize,
    name: String,
}

impl ClassAccuracy {
    pub fn new(class: usize) -> Self {
        Self {
            class,
            name: format!("acc_class_{class}"),
        }
    }
}

impl Metric for ClassAccuracy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        if y_pred.ncols() < 2 {
            return Err(ObjectiveError::WidthMismatch {
                what: "abstention predictions",
                expected: 2,
                found: y_pred.ncols(),
            });
        }
        let true_class = argmax_rows(y_true);
        let pred_class = argmax_rows(y_pred.slice(s![.., ..-1]));

        let mut in_class = 0usize;
        let mut correct = 0usize;
        for (&t, &p) in true_class.iter().zip(pred_class.iter()) {
            if t == self.class {
                in_class += 1;
                if p == self.class {
                    correct += 1;
                }
            }
        }
        if in_class == 0 {
            return Ok(0.0);
        }
        Ok(correct as f64 / in_class as f64)
    }
}

/// Accuracy on class `i` restricted to samples the model does not abstain on.
pub struct AbstentionClassAccuracy {
    abs_index: usize,
    class: usize,
    name: String,
}

impl AbstentionClassAccuracy {
    pub fn new(abs_index: usize, class: usize) -> Self {
        Self {
            abs_index,
            class,
            name: format!("abstention_acc_class_{class}"),
        }
    }
}

impl Metric for AbstentionClassAccuracy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        y_true: ArrayView2<f64>,
        y_pred: ArrayView2<f64>,
    ) -> Result<f64, ObjectiveError> {
        check_batch(&y_true, &y_pred)?;
        let true_class = argmax_rows(y_true);
        let pred_class = argmax_rows(y_pred);

        let mut in_class = 0usize;
        let mut correct = 0usize;
        for (&t, &p) in true_class.iter().zip(pred_class.iter()) {
            if p == self.abs_index || t != self.class {
                continue;
            }
            in_class += 1;
            if p == t {
                correct += 1;
            }
        }
        if in_class == 0 {
            return Ok(0.0);
        }
        Ok(correct as f64 / in_class as f64)
    }
}

/// Settings for [`AbstentionAdapt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptSettings {
    /// Accuracy metric compared against `target_acc`.
    pub monitor: String,
    /// Abstention-rate metric compared against `max_abs`.
    pub abs_monitor: String,
    /// Initial abstention penalty weight.
    pub mu0: f64,
    /// Last epoch (0-based) during which `mu` is held fixed.
    pub init_abs_epoch: usize,
    pub scale_factor: f64,
    pub target_acc: f64,
    pub max_abs: f64,
}

impl Default for AdaptSettings {
    fn default() -> Self {
        Self {
            monitor: "abstention_acc".to_string(),
            abs_monitor: "abstention".to_string(),
            mu0: 1.0,
            init_abs_epoch: 4,
            scale_factor: 0.95,
            target_acc: 0.95,
            max_abs: 0.5,
        }
    }
}

/// Epoch-end controller for the abstention penalty `mu`.
///
/// After `init_abs_epoch`, `mu` is multiplied by `scale_factor` when the monitored
/// accuracy is below target and divided by it when the abstention rate exceeds
/// `max_abs`. Both adjustments can apply in the same epoch.
pub struct AbstentionAdapt {
    settings: AdaptSettings,
    mu: AdaptiveParam<f64>,
    history: History,
}

impl AbstentionAdapt {
    pub fn new(settings: AdaptSettings) -> Self {
        let mu = AdaptiveParam::new(settings.mu0);
        Self {
            settings,
            mu,
            history: History::new(),
        }
    }

    pub fn settings(&self) -> &AdaptSettings {
        &self.settings
    }

    pub fn mu(&self) -> f64 {
        self.mu.get()
    }

    pub fn mu_reader(&self) -> ParamReader<f64> {
        self.mu.reader()
    }

    /// The abstention loss driven by this callback's `mu`.
    pub fn loss(&self, mask: Array1<f64>) -> AbstentionLoss {
        AbstentionLoss::new(mask, self.mu.reader())
    }

    /// `mu` at the end of every epoch seen so far.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Applies one epoch's update rule to `mu`.
    pub fn adapt(&mut self, epoch: usize, logs: &MetricLog) {
        let mut mu = self.mu.get();
        if epoch > self.settings.init_abs_epoch {
            let current = logs.value(&self.settings.monitor);
            let abstention = logs.value(&self.settings.abs_monitor);
            match (current, abstention) {
                (Some(current), Some(abstention)) => {
                    if current < self.settings.target_acc {
                        mu *= self.settings.scale_factor;
                    }
                    if abstention > self.settings.max_abs {
                        mu /= self.settings.scale_factor;
                    }
                    self.mu.set(mu);
                    log::debug!(
                        "epoch {epoch}: {}={current:.4}, {}={abstention:.4}, mu={mu:.6}",
                        self.settings.monitor,
                        self.settings.abs_monitor
                    );
                }
                _ => {
                    let missing = if current.is_none() {
                        &self.settings.monitor
                    } else {
                        &self.settings.abs_monitor
                    };
                    log::warn!(
                        "Abstention adapt conditioned on metric `{}` which is not available. Available metrics are: {}",
                        missing,
                        logs.names().join(",")
                    );
                }
            }
        }
        self.history.push(mu);
    }
}

impl EpochCallback for AbstentionAdapt {
    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &MetricLog,
        _ctx: &EpochContext<'_>,
    ) -> Result<(), CallbackError> {
        self.adapt(epoch, logs);
        Ok(())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LabelError {
    #[error("The {0} split contains no labels.")]
    EmptySplit(&'static str),
    #[error("The {split} split has {found} classes but the training split has {expected}.")]
    ClassCountMismatch {
        split: &'static str,
        expected: usize,
        found: usize,
    },
    #[error(
        "Expected exactly one abstention slot: {classes} classes + 1 should equal numclasses_out = {numclasses_out}."
    )]
    AbstentionSlots { classes: usize, numclasses_out: usize },
    #[error("Label {label} does not fit into {num_classes} categories.")]
    LabelOutOfRange { label: usize, num_classes: usize },
}

/// One-hot labels for every split, with a trailing abstention column.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedLabels {
    pub train: Array2<f64>,
    pub test: Array2<f64>,
    pub val: Option<Array2<f64>>,
}

/// One-hot encodes integer class labels into `num_classes` columns.
pub fn to_categorical(
    labels: ArrayView1<usize>,
    num_classes: usize,
) -> Result<Array2<f64>, LabelError> {
    let mut out = Array2::zeros((labels.len(), num_classes));
    for (mut row, &label) in out.outer_iter_mut().zip(labels.iter()) {
        if label >= num_classes {
            return Err(LabelError::LabelOutOfRange { label, num_classes });
        }
        row[label] = 1.0;
    }
    Ok(out)
}

fn class_count(split: &'static str, labels: ArrayView1<usize>) -> Result<usize, LabelError> {
    labels
        .iter()
        .max()
        .map(|&max| max + 1)
        .ok_or(LabelError::EmptySplit(split))
}

/// Converts integer labels of each split into one-hot rows of width
/// `numclasses_out` (the original classes plus one abstention slot).
///
/// Every split must span the same number of classes. The abstention column of the
/// training labels is checked for collisions, which are only logged.
pub fn modify_labels(
    numclasses_out: usize,
    ytrain: ArrayView1<usize>,
    ytest: ArrayView1<usize>,
    yval: Option<ArrayView1<usize>>,
) -> Result<AugmentedLabels, LabelError> {
    let classes_train = class_count("training", ytrain)?;
    let classes_test = class_count("test", ytest)?;
    if classes_test != classes_train {
        return Err(LabelError::ClassCountMismatch {
            split: "test",
            expected: classes_train,
            found: classes_test,
        });
    }
    if let Some(yval) = yval {
        let classes_val = class_count("validation", yval)?;
        if classes_val != classes_train {
            return Err(LabelError::ClassCountMismatch {
                split: "validation",
                expected: classes_train,
                found: classes_val,
            });
        }
    }
    if classes_train + 1 != numclasses_out {
        return Err(LabelError::AbstentionSlots {
            classes: classes_train,
            numclasses_out,
        });
    }

    let train = to_categorical(ytrain, numclasses_out)?;
    let test = to_categorical(ytest, numclasses_out)?;
    let val = yval.map(|y| to_categorical(y, numclasses_out)).transpose()?;

    let abs_column = train.index_axis(Axis(1), numclasses_out - 1);
    for (row, &v) in abs_column.iter().enumerate() {
        if v == 1.0 {
            log::warn!(
                "Problem at {}, {}: sample occupies the abstention column",
                row,
                numclasses_out - 1
            );
        }
    }

    Ok(AugmentedLabels { train, test, val })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::PredictFn;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn loss_with_mu(mu: f64, width: usize) -> (AdaptiveParam<f64>, AbstentionLoss) {
        let param = AdaptiveParam::new(mu);
        let loss = AbstentionLoss::new(abstention_mask(width, width - 1), param.reader());
        (param, loss)
    }

    #[test]
    fn loss_matches_hand_computation() {
        let (_mu, loss) = loss_with_mu(0.5, 3);
        let y_true = array![[1.0, 0.0, 0.0]];
        let y_pred = array![[0.6, 0.2, 0.2]];

        // q = [0.75, 0.25, 0], a = 0.2 / 3
        let a = 0.2 / 3.0;
        let ce = -(0.75_f64).ln();
        let expected = (1.0 - a) * ce - 0.5 * (1.0 - a).ln();
        assert_abs_diff_eq!(
            loss.evaluate(y_true.view(), y_pred.view()).unwrap(),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn loss_reads_the_current_mu() {
        let (mu, loss) = loss_with_mu(0.0, 3);
        let y_true = array![[0.0, 1.0, 0.0]];
        let y_pred = array![[0.1, 0.3, 0.6]];
        let before = loss.evaluate(y_true.view(), y_pred.view()).unwrap();
        mu.set(2.0);
        let after = loss.evaluate(y_true.view(), y_pred.view()).unwrap();
        let a: f64 = 0.6 / 3.0;
        assert_abs_diff_eq!(after - before, -2.0 * (1.0 - a).ln(), epsilon = 1e-12);
    }

    #[test]
    fn loss_is_non_negative() {
        let y_true = array![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 1.0, 0.0, 0.0]];
        let y_pred = array![[0.7, 0.1, 0.1, 0.1], [0.05, 0.05, 0.1, 0.8], [0.3, 0.3, 0.3, 0.1]];
        for mu in [0.0, 0.1, 1.0, 10.0] {
            let (_param, loss) = loss_with_mu(mu, 4);
            assert!(loss.evaluate(y_true.view(), y_pred.view()).unwrap() >= 0.0);
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let (_mu, loss) = loss_with_mu(0.7, 4);
        let y_true = array![[0.0, 1.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0]];
        let y_pred = array![[0.2, 0.4, 0.1, 0.3], [0.5, 0.2, 0.2, 0.1]];
        let grad = loss.gradient(y_true.view(), y_pred.view()).unwrap();

        let h = 1e-6;
        for ((i, j), &g) in grad.indexed_iter() {
            let mut plus = y_pred.clone();
            plus[[i, j]] += h;
            let mut minus = y_pred.clone();
            minus[[i, j]] -= h;
            let numeric = (loss.evaluate(y_true.view(), plus.view()).unwrap()
                - loss.evaluate(y_true.view(), minus.view()).unwrap())
                / (2.0 * h);
            assert_abs_diff_eq!(g, numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn accuracy_and_rate_ignore_abstaining_samples() {
        // abstention index 2
        let y_true = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let y_pred = array![[0.8, 0.1, 0.1], [0.6, 0.3, 0.1], [0.1, 0.1, 0.8], [0.2, 0.7, 0.1]];
        let acc = AbstentionAccuracy::new(2)
            .evaluate(y_true.view(), y_pred.view())
            .unwrap();
        let rate = AbstentionRate::new(2).evaluate(y_true.view(), y_pred.view()).unwrap();
        assert_abs_diff_eq!(acc, 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rate, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn accuracy_is_zero_when_everything_abstains() {
        let y_true = array![[1.0, 0.0, 0.0]];
        let y_pred = array![[0.1, 0.1, 0.8]];
        assert_eq!(
            AbstentionAccuracy::new(2)
                .evaluate(y_true.view(), y_pred.view())
                .unwrap(),
            0.0
        );
    }

    #[test]
    fn class_accuracies_guard_absent_classes() {
        let y_true = array![[1.0, 0.0, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]];
        // Second sample abstains, but its best real class is still class 0.
        let y_pred = array![[0.6, 0.2, 0.1, 0.1], [0.3, 0.1, 0.1, 0.5], [0.5, 0.4, 0.05, 0.05]];

        let all0 = ClassAccuracy::new(0).evaluate(y_true.view(), y_pred.view()).unwrap();
        let all1 = ClassAccuracy::new(1).evaluate(y_true.view(), y_pred.view()).unwrap();
        let all2 = ClassAccuracy::new(2).evaluate(y_true.view(), y_pred.view()).unwrap();
        assert_abs_diff_eq!(all0, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(all1, 0.0, epsilon = 1e-12);
        assert_eq!(all2, 0.0);

        let kept0 = AbstentionClassAccuracy::new(3, 0)
            .evaluate(y_true.view(), y_pred.view())
            .unwrap();
        let kept2 = AbstentionClassAccuracy::new(3, 2)
            .evaluate(y_true.view(), y_pred.view())
            .unwrap();
        assert_abs_diff_eq!(kept0, 1.0, epsilon = 1e-12);
        assert_eq!(kept2, 0.0);
        assert!(kept2.is_finite());

        assert_eq!(ClassAccuracy::new(1).name(), "acc_class_1");
        assert_eq!(AbstentionClassAccuracy::new(3, 1).name(), "abstention_acc_class_1");
    }

    fn logs(acc: f64, abs: f64) -> MetricLog {
        [("abstention_acc", acc), ("abstention", abs)].into_iter().collect()
    }

    #[test]
    fn mu_is_held_during_warmup() {
        let mut adapt = AbstentionAdapt::new(AdaptSettings {
            mu0: 1.0,
            init_abs_epoch: 2,
            ..AdaptSettings::default()
        });
        for epoch in 0..=2 {
            adapt.adapt(epoch, &logs(0.1, 0.9));
        }
        assert_eq!(adapt.mu(), 1.0);
        assert_eq!(adapt.history().len(), 3);
    }

    #[test]
    fn low_accuracy_lowers_mu_by_the_scale_factor() {
        let mut adapt = AbstentionAdapt::new(AdaptSettings {
            mu0: 0.8,
            init_abs_epoch: 0,
            scale_factor: 0.9,
            ..AdaptSettings::default()
        });
        adapt.adapt(0, &logs(0.5, 0.1));
        assert_eq!(adapt.mu(), 0.8);
        adapt.adapt(1, &logs(0.5, 0.1));
        assert_abs_diff_eq!(adapt.mu(), 0.8 * 0.9, epsilon = 1e-15);
        // Excess abstention alone raises it back.
        adapt.adapt(2, &logs(0.99, 0.7));
        assert_abs_diff_eq!(adapt.mu(), 0.8, epsilon = 1e-12);
        // Both conditions cancel out.
        adapt.adapt(3, &logs(0.5, 0.7));
        assert_abs_diff_eq!(adapt.mu(), 0.8, epsilon = 1e-12);
        assert_eq!(adapt.history().len(), 4);
    }

    #[test]
    fn missing_metric_leaves_mu_unchanged() {
        let mut adapt = AbstentionAdapt::new(AdaptSettings {
            init_abs_epoch: 0,
            ..AdaptSettings::default()
        });
        let partial: MetricLog = [("abstention", 0.9)].into_iter().collect();
        let ctx_predictor = PredictFn(|x: ArrayView2<f64>| x.to_owned());
        let ctx = EpochContext {
            predictor: &ctx_predictor,
            learning_rate: 0.01,
        };
        adapt.on_epoch_end(5, &partial, &ctx).unwrap();
        assert_eq!(adapt.mu(), 1.0);
        assert_eq!(adapt.history().as_slice(), &[1.0]);
    }

    #[test]
    fn missing_abstention_rate_leaves_mu_unchanged() {
        let mut adapt = AbstentionAdapt::new(AdaptSettings {
            init_abs_epoch: 0,
            ..AdaptSettings::default()
        });
        // Accuracy below target would shrink mu if the rate were present.
        let partial: MetricLog = [("abstention_acc", 0.1)].into_iter().collect();
        adapt.adapt(1, &partial);
        adapt.adapt(2, &partial);
        assert_eq!(adapt.mu(), 1.0);
        assert_eq!(adapt.history().as_slice(), &[1.0, 1.0]);
    }

    #[test]
    fn loss_follows_callback_updates() {
        let mut adapt = AbstentionAdapt::new(AdaptSettings {
            init_abs_epoch: 0,
            ..AdaptSettings::default()
        });
        let loss = adapt.loss(abstention_mask(3, 2));
        let y_true = array![[1.0, 0.0, 0.0]];
        let y_pred = array![[0.5, 0.2, 0.3]];
        let before = loss.evaluate(y_true.view(), y_pred.view()).unwrap();
        adapt.adapt(1, &logs(0.2, 0.1));
        let after = loss.evaluate(y_true.view(), y_pred.view()).unwrap();
        // Lower mu means a smaller abstention penalty.
        assert!(after < before);
    }

    #[test]
    fn labels_gain_an_empty_abstention_column() {
        let ytrain = array![0usize, 1, 2, 1];
        let ytest = array![2usize, 0, 1];
        let labels = modify_labels(4, ytrain.view(), ytest.view(), None).unwrap();
        assert_eq!(labels.train.dim(), (4, 4));
        assert_eq!(labels.test.dim(), (3, 4));
        assert!(labels.val.is_none());
        assert!(labels.train.column(3).iter().all(|&v| v == 0.0));
        assert!(labels.test.column(3).iter().all(|&v| v == 0.0));
        assert_eq!(labels.train.row(2), array![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn label_splits_must_agree() {
        let ytrain = array![0usize, 1, 2];
        let ytest = array![0usize, 1];
        assert_eq!(
            modify_labels(4, ytrain.view(), ytest.view(), None),
            Err(LabelError::ClassCountMismatch {
                split: "test",
                expected: 3,
                found: 2
            })
        );

        let yval = array![0usize, 3];
        assert_eq!(
            modify_labels(4, ytrain.view(), ytrain.view(), Some(yval.view())),
            Err(LabelError::ClassCountMismatch {
                split: "validation",
                expected: 3,
                found: 4
            })
        );

        assert_eq!(
            modify_labels(5, ytrain.view(), ytrain.view(), None),
            Err(LabelError::AbstentionSlots {
                classes: 3,
                numclasses_out: 5
            })
        );

        let empty = Array1::<usize>::zeros(0);
        assert_eq!(
            modify_labels(4, empty.view(), ytrain.view(), None),
            Err(LabelError::EmptySplit("training"))
        );
    }
}
