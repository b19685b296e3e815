//! Decoding of flat prediction matrices.
//!
//! Regression modes interleave their components per output: with `stride`
//! components, the columns of one row read
//! `[out0_c0, out0_c1, .., out1_c0, out1_c1, ..]`, so component `k` of every
//! output is the strided column slice `k..; step stride`. Losses and metrics of
//! one mode share a single [`InterleavedLayout`] so they always agree on it.

use crate::objective::{ObjectiveError, check_width};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, s};

/// Component positions for heteroscedastic predictions.
pub mod het {
    pub const STRIDE: usize = 2;
    pub const MEAN: usize = 0;
    pub const LOG_VARIANCE: usize = 1;
}

/// Component positions for quantile predictions.
pub mod qtl {
    pub const STRIDE: usize = 3;
    pub const MEDIAN: usize = 0;
    pub const LOW: usize = 1;
    pub const HIGH: usize = 2;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterleavedLayout {
    outputs: usize,
    stride: usize,
}

impl InterleavedLayout {
    pub fn new(outputs: usize, stride: usize) -> Self {
        assert!(outputs > 0, "an interleaved layout needs at least one output");
        assert!(stride > 0, "an interleaved layout needs at least one component");
        Self { outputs, stride }
    }

    pub fn heteroscedastic(outputs: usize) -> Self {
        Self::new(outputs, het::STRIDE)
    }

    pub fn quantile(outputs: usize) -> Self {
        Self::new(outputs, qtl::STRIDE)
    }

    /// Number of outputs before UQ augmentation.
    pub fn outputs(&self) -> usize {
        self.outputs
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Width of a prediction row.
    pub fn width(&self) -> usize {
        self.outputs * self.stride
    }

    /// Checks that `y_true` carries one column per output and `y_pred` the full
    /// interleaved width.
    pub fn check(
        &self,
        y_true: &ArrayView2<f64>,
        y_pred: &ArrayView2<f64>,
    ) -> Result<(), ObjectiveError> {
        check_width("ground truth", y_true.ncols(), self.outputs)?;
        check_width("interleaved predictions", y_pred.ncols(), self.width())
    }

    /// All outputs' values of one component, shaped like the ground truth.
    pub fn component<'a>(
        &self,
        y_pred: &ArrayView2<'a, f64>,
        component: usize,
    ) -> ArrayView2<'a, f64> {
        debug_assert!(component < self.stride);
        y_pred.clone().slice_move(s![.., component..;self.stride])
    }

    pub fn component_mut<'a>(
        &self,
        grad: &'a mut Array2<f64>,
        component: usize,
    ) -> ArrayViewMut2<'a, f64> {
        debug_assert!(component < self.stride);
        grad.slice_mut(s![.., component..;self.stride])
    }
}
