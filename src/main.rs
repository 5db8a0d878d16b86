mod cancel;
mod config;
mod data;
mod dataset;
mod error;
mod evaluate;
mod model;
mod model_artifacts;
mod models;
mod train;

use anyhow::{Context, Result};
use cancel::CancelToken;
use clap::Parser;
use config::{DEFAULT_MODEL_ID, EVAL_BATCH_SIZE, PipelineConfig, TRAIN_SPLIT};
use evaluate::EvalOutcome;
use model::SequenceModel;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use train::{FitOptions, TrainMessage, TrainOutcome};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "PanelGRU: directional forecasting on multi-symbol daily price panels",
    after_help = "EXAMPLES:
    # Train on a panel and evaluate on the held-out windows
    cargo run --release -- --csv prices.csv

    # Custom split and training schedule
    cargo run --release -- --csv prices.csv --train-split 0.7 --epochs 50 --batch-size 32

    # Evaluate a previously saved model without retraining
    cargo run --release -- --csv prices.csv --load --model-id gru-stock"
)]
struct Args {
    /// Panel CSV with Date, Symbol, Open, Close columns
    #[arg(long)]
    csv: PathBuf,

    /// Fraction of dates (for scaling) and windows (for the split) used for training
    #[arg(long, default_value_t = TRAIN_SPLIT)]
    train_split: f64,

    /// Number of training epochs (default: 25)
    #[arg(long)]
    epochs: Option<usize>,

    /// Training mini-batch size (default: 64)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Optimizer learning rate (default: 0.001)
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Rows scored per evaluation chunk
    #[arg(long, default_value_t = EVAL_BATCH_SIZE)]
    eval_batch_size: usize,

    /// Name under which the model is saved or loaded
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model_id: String,

    /// Load a saved model instead of training a new one
    #[arg(long)]
    load: bool,

    /// Skip saving the trained model
    #[arg(long)]
    no_save: bool,

    /// Write the evaluation report as JSON to this path
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("panelgru=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    let cancel = CancelToken::new();
    let host = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping at the next epoch or chunk boundary");
            host.cancel();
        }
    });

    if let Err(e) = run(args, cancel).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args, cancel: CancelToken) -> Result<()> {
    let cfg = PipelineConfig::with_train_fraction(args.train_split);
    let (dataset, report) = dataset::load_dataset(&args.csv, &cfg)
        .await
        .with_context(|| format!("failed to load {}", args.csv.display()))?;
    info!(
        "Loaded {} train / {} test windows ({} rows skipped, {} gaps filled, {} windows dropped)",
        dataset.n_train(),
        dataset.n_test(),
        report.parse.skipped,
        report.fill.filled,
        report.windows.dropped()
    );

    let device = config::get_device(args.cuda);
    let model_dir = config::model_dir();

    let model = if args.load {
        SequenceModel::load(
            &model_dir,
            &args.model_id,
            &dataset.symbols,
            dataset.lookback,
            dataset.horizon,
            &device,
        )
        .with_context(|| format!("failed to load model '{}'", args.model_id))?
    } else {
        let mut model = SequenceModel::build(&dataset.symbols, dataset.lookback, dataset.horizon, &device)?;
        let defaults = FitOptions::default();
        let opts = FitOptions {
            epochs: args.epochs.unwrap_or(defaults.epochs),
            batch_size: args.batch_size.unwrap_or(defaults.batch_size),
            learning_rate: args.learning_rate.unwrap_or(defaults.learning_rate),
        };

        let (tx, mut rx) = mpsc::channel(32);
        let epochs = opts.epochs;
        let listener = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    TrainMessage::Epoch(m) => info!(
                        "Epoch {}/{} - loss={:.4} acc={:.4} val_loss={} val_acc={}",
                        m.epoch,
                        epochs,
                        m.loss,
                        m.accuracy,
                        m.val_loss.map_or("n/a".to_string(), |v| format!("{:.4}", v)),
                        m.val_accuracy.map_or("n/a".to_string(), |v| format!("{:.4}", v)),
                    ),
                    TrainMessage::Log(line) => info!("{}", line),
                    TrainMessage::Finished => info!("Training finished"),
                    TrainMessage::Cancelled => warn!("Training cancelled"),
                }
            }
        });

        let outcome = train::train_on_dataset(&mut model, &dataset, opts, &tx, &cancel).await?;
        drop(tx);
        let _ = listener.await;

        if let TrainOutcome::Cancelled(history) = outcome {
            warn!("Stopped after {} epochs; skipping save and evaluation", history.len());
            return Ok(());
        }
        if !args.no_save {
            model.save(&model_dir, &args.model_id)?;
        }
        model
    };

    info!("Evaluating on {} test windows...", dataset.n_test());
    let outcome = evaluate::evaluate_batched(
        &dataset.x_test,
        &dataset.y_test,
        &dataset.symbols,
        dataset.horizon,
        |rows: &[Vec<f32>]| model.predict(rows),
        &cancel,
        args.eval_batch_size,
    )
    .await?;

    match outcome {
        EvalOutcome::Completed(report) => {
            evaluate::print_report(&report);
            if let Some(path) = &args.report_json {
                let writer = std::io::BufWriter::new(std::fs::File::create(path)?);
                serde_json::to_writer_pretty(writer, &report)?;
                info!("Evaluation report saved: {}", path.display());
            }
        }
        EvalOutcome::Aborted { rows_processed } => {
            warn!(
                "Evaluation aborted after {}/{} rows; no accuracy reported",
                rows_processed,
                dataset.n_test()
            );
        }
    }

    Ok(())
}
