// ========================================================================================
//
//                      THE COMMAND-LINE FRONT END: UQKIT
//
// ========================================================================================
//
// The library is driven by an external trainer. This binary covers the file-level
// chores around such a trainer:
//
// 1.  **Widening:** rebuild a saved network with the output width a UQ mode needs.
// 2.  **Label preparation:** one-hot labels with an abstention column, or regression
//     targets with the training-set index column.
// 3.  **Evaluation:** the loss and every metric of a configured mode over saved
//     ground truth and predictions.

use clap::{Args, Parser, Subcommand};
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use uqkit::abstention::modify_labels;
use uqkit::augment::{UqMode, add_model_output};
use uqkit::callback::EpochContext;
use uqkit::config::{Objective, UqConfig};
use uqkit::contamination::add_index_to_output;
use uqkit::data::{column_names, load_class_labels, load_matrix, write_matrix};
use uqkit::network::{Activation, Network, PredictFn};
use uqkit::objective::evaluate_metrics;
use uqkit::types::MetricLog;

type CliResult = Result<(), Box<dyn std::error::Error>>;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "uqkit",
    version,
    about = "Uncertainty-quantification objectives for neural-network training"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct WidenArgs {
    /// Network saved as TOML
    network: PathBuf,

    /// UQ mode: abstain, qtl or het
    #[arg(long)]
    mode: String,

    /// Number of abstention units to add (abstain mode only)
    #[arg(long, value_name = "N")]
    num_add: Option<usize>,

    /// Activation of the widened layer; defaults to the layer's current one
    #[arg(long)]
    activation: Option<String>,

    /// Seed for the new layer's weights
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Where to write the widened network
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args)]
struct LabelsArgs {
    /// Output width of the abstention model: number of classes + 1
    #[arg(long, value_name = "N")]
    numclasses_out: usize,

    /// Training labels, one integer class per row
    train: PathBuf,

    /// Test labels, one integer class per row
    test: PathBuf,

    /// Validation labels, one integer class per row
    #[arg(long)]
    val: Option<PathBuf>,

    /// Directory receiving train.tsv, test.tsv and val.tsv
    #[arg(long)]
    out_dir: PathBuf,
}

#[derive(Args)]
struct IndexArgs {
    /// Training targets
    y: PathBuf,

    /// Where to write the targets with their index column
    #[arg(long)]
    out: PathBuf,
}

#[derive(Args)]
struct EvaluateArgs {
    /// UQ configuration (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Ground truth in the layout the configured loss expects
    #[arg(long)]
    truth: PathBuf,

    /// Model predictions
    #[arg(long)]
    pred: PathBuf,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Widen a network's final dense layer for a UQ mode
    #[command(about = "Widen a network's last dense layer (outputs: network.toml)")]
    Widen(WidenArgs),

    /// One-hot encode class labels with a trailing abstention column
    #[command(about = "Prepare abstention labels (outputs: train.tsv, test.tsv, val.tsv)")]
    Labels(LabelsArgs),

    /// Append the training-set index column used by the contamination loss
    #[command(about = "Append sample indices to regression targets")]
    Index(IndexArgs),

    /// Evaluate the configured loss and metrics on saved predictions
    #[command(about = "Report loss and metrics for a UQ mode")]
    Evaluate(EvaluateArgs),
}

// ========================================================================================
//                                  SUBCOMMANDS
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Widen(args) => run_widen(args),
        Commands::Labels(args) => run_labels(args),
        Commands::Index(args) => run_index(args),
        Commands::Evaluate(args) => run_evaluate(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_widen(args: WidenArgs) -> CliResult {
    let network = Network::load(&args.network)?;
    let mode = UqMode::parse(&args.mode, args.num_add)?;
    let activation = args
        .activation
        .as_deref()
        .map(str::parse::<Activation>)
        .transpose()?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let widened = add_model_output(&network, Some(mode), activation, &mut rng)?;
    widened.save(&args.out)?;
    println!(
        "Widened network from {} to {} outputs; saved to {}",
        network.output_dim(),
        widened.output_dim(),
        args.out.display()
    );
    Ok(())
}

fn run_labels(args: LabelsArgs) -> CliResult {
    let train = load_class_labels(&args.train)?;
    let test = load_class_labels(&args.test)?;
    let val = args.val.as_deref().map(load_class_labels).transpose()?;

    let labels = modify_labels(
        args.numclasses_out,
        train.view(),
        test.view(),
        val.as_ref().map(|v| v.view()),
    )?;

    fs::create_dir_all(&args.out_dir)?;
    let mut header = column_names("class_", args.numclasses_out - 1);
    header.push("abstain".to_string());

    write_labels(&args.out_dir.join("train.tsv"), &header, labels.train.view())?;
    write_labels(&args.out_dir.join("test.tsv"), &header, labels.test.view())?;
    if let Some(val) = &labels.val {
        write_labels(&args.out_dir.join("val.tsv"), &header, val.view())?;
    }
    Ok(())
}

fn write_labels(path: &Path, header: &[String], values: ArrayView2<f64>) -> CliResult {
    write_matrix(path, header, values)?;
    println!("Wrote {} labels to {}", values.nrows(), path.display());
    Ok(())
}

fn run_index(args: IndexArgs) -> CliResult {
    let y = load_matrix(&args.y)?;
    let augmented = add_index_to_output(y.view());
    let mut header = column_names("y", y.ncols());
    header.push("index".to_string());
    write_matrix(&args.out, &header, augmented.view())?;
    println!("Indexed {} samples; saved to {}", y.nrows(), args.out.display());
    Ok(())
}

#[derive(Serialize)]
struct Report {
    mode: &'static str,
    loss_name: String,
    loss: f64,
    metrics: BTreeMap<String, f64>,
}

fn run_evaluate(args: EvaluateArgs) -> CliResult {
    let config = UqConfig::load(&args.config)?;
    let truth = load_matrix(&args.truth)?;
    let pred = load_matrix(&args.pred)?;

    let (labels, objective) = match &config {
        UqConfig::Contamination(cfg) => {
            // Plain targets; the index column is added here.
            check_columns("ground truth", &truth, cfg.outputs)?;
            check_columns("predictions", &pred, cfg.outputs)?;
            let mut objective = cfg.build_objective(pred.clone(), truth.clone())?;
            refit_contamination(&mut objective, cfg.em_iterations, cfg.learning_rate)?;
            (add_index_to_output(truth.view()), objective)
        }
        _ => {
            check_columns("ground truth", &truth, config.label_width())?;
            check_columns("predictions", &pred, config.prediction_width())?;
            (truth, config.build_objective()?)
        }
    };

    let loss = objective.loss.evaluate(labels.view(), pred.view())?;
    let metrics: MetricLog = evaluate_metrics(&objective.metrics, labels.view(), pred.view())?;
    let report = Report {
        mode: config.mode_name(),
        loss_name: objective.loss.name().to_string(),
        loss,
        metrics: metrics.iter().map(|(k, v)| (k.clone(), *v)).collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("mode\t{}", report.mode);
        println!("{}\t{:.6}", report.loss_name, report.loss);
        for (name, value) in &report.metrics {
            println!("{name}\t{value:.6}");
        }
    }
    Ok(())
}

/// Runs EM updates against fixed predictions: the callback's "training inputs" are
/// the predictions themselves and the predictor is the identity.
fn refit_contamination(
    objective: &mut Objective,
    iterations: usize,
    learning_rate: f64,
) -> CliResult {
    let Some(callback) = objective.callback.as_mut() else {
        return Ok(());
    };
    let identity = PredictFn(|x: ArrayView2<f64>| x.to_owned());
    let ctx = EpochContext {
        predictor: &identity,
        learning_rate,
    };
    let logs = MetricLog::new();
    for epoch in 0..iterations {
        callback.on_epoch_end(epoch, &logs, &ctx)?;
    }
    Ok(())
}

fn check_columns(what: &str, values: &Array2<f64>, expected: usize) -> CliResult {
    if values.ncols() != expected {
        return Err(format!(
            "{what} has {} columns, but the configured mode expects {expected}",
            values.ncols()
        )
        .into());
    }
    Ok(())
}
