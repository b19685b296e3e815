// ========================================================================================
//
//                      UQKIT LOSS AND EM-STEP PERFORMANCE BENCHMARK
//
// ========================================================================================
//
// Measures the per-batch cost of every loss (value and gradient) and of one
// contamination EM update, across batch sizes typical of minibatch training and
// of a full-training-set E-step.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ndarray::{Array2, ArrayView2, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::hint::black_box;
use uqkit::abstention::{AbstentionAdapt, AdaptSettings, abstention_mask};
use uqkit::contamination::{ContaminationCallback, add_index_to_output};
use uqkit::heteroscedastic::HeteroscedasticLoss;
use uqkit::objective::Loss;
use uqkit::quantile::TripleQuantileLoss;

// --- Benchmark Tuning Parameters ---

/// Rows per simulated batch.
const BATCH_SIZES: [usize; 3] = [256, 4_096, 65_536];
/// Regression outputs per sample.
const OUTPUTS: usize = 4;
/// Real classes of the abstention classifier; the network has one more output.
const CLASSES: usize = 10;

fn gaussian(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut *rng))
}

/// Row-wise softmax of random logits.
fn probabilities(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
    let mut p = gaussian(rows, cols, rng).mapv(f64::exp);
    for mut row in p.outer_iter_mut() {
        let total = row.sum();
        row /= total;
    }
    p
}

fn one_hot(rows: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(i, j)| if j == i % (cols - 1) { 1.0 } else { 0.0 })
}

fn bench_loss(
    c: &mut Criterion,
    group_name: &str,
    loss: &dyn Loss,
    batch: impl Fn(usize) -> (Array2<f64>, Array2<f64>),
) {
    let mut group = c.benchmark_group(group_name);
    for &rows in &BATCH_SIZES {
        let (y_true, y_pred) = batch(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("evaluate", rows), &rows, |b, _| {
            b.iter(|| loss.evaluate(black_box(y_true.view()), black_box(y_pred.view())).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("gradient", rows), &rows, |b, _| {
            b.iter(|| loss.gradient(black_box(y_true.view()), black_box(y_pred.view())).unwrap())
        });
    }
    group.finish();
}

fn losses(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);

    let mut regression = |stride: usize| {
        let y_true = gaussian(BATCH_SIZES[2], OUTPUTS, &mut rng);
        let y_pred = gaussian(BATCH_SIZES[2], stride * OUTPUTS, &mut rng);
        (y_true, y_pred)
    };
    let (het_true, het_pred) = regression(2);
    let (qtl_true, qtl_pred) = regression(3);
    let rows_of = |a: &Array2<f64>, rows: usize| a.slice(s![..rows, ..]).to_owned();

    bench_loss(c, "heteroscedastic", &HeteroscedasticLoss::new(OUTPUTS), |rows| {
        (rows_of(&het_true, rows), rows_of(&het_pred, rows))
    });
    bench_loss(c, "triple_quantile", &TripleQuantileLoss::new(OUTPUTS, 0.1, 0.9), |rows| {
        (rows_of(&qtl_true, rows), rows_of(&qtl_pred, rows))
    });

    let width = CLASSES + 1;
    let adapt = AbstentionAdapt::new(AdaptSettings::default());
    let abstention = adapt.loss(abstention_mask(width, CLASSES));
    let abs_pred = probabilities(BATCH_SIZES[2], width, &mut rng);
    bench_loss(c, "abstention", &abstention, |rows| {
        (one_hot(rows, width), rows_of(&abs_pred, rows))
    });
}

fn contamination(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut group = c.benchmark_group("contamination");
    for &rows in &BATCH_SIZES {
        let x = gaussian(rows, 1, &mut rng);
        let noise = gaussian(rows, 1, &mut rng);
        let y = x.mapv(|v| 2.0 * v + 1.0) + noise.mapv(|e| 0.1 * e);
        let y_pred = x.mapv(|v| 2.0 * v + 1.0);
        let mut callback = ContaminationCallback::new(x, y.clone(), &mut rng).unwrap();
        let loss = callback.loss();
        let labels = add_index_to_output(y.view());

        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("em_step", rows), &rows, |b, _| {
            b.iter(|| callback.em_step(black_box(y_pred.view()), 0.1).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("gradient", rows), &rows, |b, _| {
            let pred: ArrayView2<f64> = y_pred.view();
            b.iter(|| loss.gradient(black_box(labels.view()), black_box(pred)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, losses, contamination);
criterion_main!(benches);
