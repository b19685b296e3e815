//! Small statistics shared by the metrics and the EM updates.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis, Zip};
use std::f64::consts::PI;

/// Fuzz factor added to denominators, matching the usual deep-learning backend value.
pub const EPSILON: f64 = 1e-7;

/// Index of the largest entry of each row. Ties resolve to the first index.
pub fn argmax_rows(values: ArrayView2<f64>) -> Array1<usize> {
    values.map_axis(Axis(1), argmax)
}

pub fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (idx, &value) in row.iter().enumerate() {
        if value > best_value {
            best = idx;
            best_value = value;
        }
    }
    best
}

pub fn mean_squared_error(y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>) -> f64 {
    let mut total = 0.0;
    Zip::from(&y_true)
        .and(&y_pred)
        .for_each(|&t, &p| total += (t - p) * (t - p));
    total / y_true.len() as f64
}

pub fn mean_absolute_error(y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>) -> f64 {
    let mut total = 0.0;
    Zip::from(&y_true)
        .and(&y_pred)
        .for_each(|&t, &p| total += (t - p).abs());
    total / y_true.len() as f64
}

/// Coefficient of determination over every entry, `1 - SS_res / (SS_tot + eps)`.
pub fn r_squared(y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>) -> f64 {
    let mean = y_true.mean().unwrap_or(0.0);
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    Zip::from(&y_true).and(&y_pred).for_each(|&t, &p| {
        ss_res += (t - p) * (t - p);
        ss_tot += (t - mean) * (t - mean);
    });
    1.0 - ss_res / (ss_tot + EPSILON)
}

/// Density of Normal(0, sigma^2) at `x`.
pub fn normal_pdf(x: f64, sigma_sq: f64) -> f64 {
    (-0.5 * x * x / sigma_sq).exp() / (2.0 * PI * sigma_sq).sqrt()
}

/// Density of Cauchy(0, gamma) at `x`, where `gamma_sq` is the squared scale.
pub fn cauchy_pdf(x: f64, gamma_sq: f64) -> f64 {
    let gamma = gamma_sq.sqrt();
    1.0 / (PI * gamma * (1.0 + x * x / gamma_sq))
}
