use crate::cancel::CancelToken;
use crate::config::{BATCH_SIZE, EPOCHS, LEARNING_RATE, WEIGHT_DECAY, validate_batch_size};
use crate::dataset::Dataset;
use crate::error::{PipelineError, Result};
use crate::model::SequenceModel;
use candle_core::{DType, Tensor};
use candle_nn::Optimizer;
use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: EPOCHS,
            batch_size: BATCH_SIZE,
            learning_rate: LEARNING_RATE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

/// Events emitted to whoever hosts training.
#[derive(Clone, Debug, PartialEq)]
pub enum TrainMessage {
    Epoch(EpochMetrics),
    Log(String),
    Finished,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrainOutcome {
    Completed(Vec<EpochMetrics>),
    Cancelled(Vec<EpochMetrics>),
}

impl TrainOutcome {
    pub fn history(&self) -> &[EpochMetrics] {
        match self {
            Self::Completed(h) | Self::Cancelled(h) => h,
        }
    }
}

#[derive(Serialize)]
struct TrainingRunLog {
    started_at: String,
    finished_at: String,
    symbols: Vec<String>,
    train_samples: usize,
    val_samples: usize,
    epochs_requested: usize,
    epochs_completed: usize,
    batch_size: usize,
    learning_rate: f64,
    stop_reason: String,
    epoch_metrics: Vec<EpochMetrics>,
}

fn persist_training_log(run_log: &TrainingRunLog) -> Result<std::path::PathBuf> {
    let log_dir = std::path::Path::new("log");
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    let file_name = format!(
        "training_{}_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    );
    let file_path = log_dir.join(file_name);

    let file = std::fs::File::create(&file_path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, run_log)?;

    Ok(file_path)
}

/// Mean binary cross-entropy on logits, clamped away from log(0).
fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let p = candle_nn::ops::sigmoid(logits)?.clamp(1e-7, 1.0 - 1e-7)?;
    let pos = targets.mul(&p.log()?)?;
    let neg = targets.affine(-1.0, 1.0)?.mul(&p.affine(-1.0, 1.0)?.log()?)?;
    (pos + neg)?.neg()?.mean_all()
}

/// Count of element-wise matches between thresholded predictions and labels.
fn correct_calls(logits: &Tensor, targets: &Tensor) -> candle_core::Result<f64> {
    // sigmoid(x) >= 0.5 exactly when x >= 0
    let called = logits.ge(0.0)?;
    let truth = targets.ge(0.5)?;
    let hits = called.eq(&truth)?.to_dtype(DType::F32)?.sum_all()?;
    Ok(hits.to_scalar::<f32>()? as f64)
}

/// Loss and binary accuracy over `x`/`y` without touching the weights.
fn score(model: &SequenceModel, x: &[Vec<f32>], y: &[Vec<f32>], batch_size: usize) -> Result<(f64, f64)> {
    let mut total_loss = 0.0;
    let mut correct = 0.0;
    for start in (0..x.len()).step_by(batch_size) {
        let end = (start + batch_size).min(x.len());
        let xs: Vec<&[f32]> = x[start..end].iter().map(Vec::as_slice).collect();
        let ys: Vec<&[f32]> = y[start..end].iter().map(Vec::as_slice).collect();
        let x_t = model.features_tensor(&xs)?;
        let y_t = model.labels_tensor(&ys)?;
        let logits = model.net.forward(&x_t)?;
        total_loss += bce_with_logits(&logits, &y_t)?.to_scalar::<f32>()? as f64 * (end - start) as f64;
        correct += correct_calls(&logits, &y_t)?;
    }
    let n = x.len() as f64;
    Ok((total_loss / n, correct / (n * model.output_width() as f64)))
}

/// Trains in place. Mini-batch order is shuffled inside each epoch; the data
/// itself is not reordered. The token is checked and the task yields at every
/// epoch boundary, and one `TrainMessage::Epoch` is sent per finished epoch.
pub async fn fit(
    model: &mut SequenceModel,
    x: &[Vec<f32>],
    y: &[Vec<f32>],
    validation: Option<(&[Vec<f32>], &[Vec<f32>])>,
    opts: FitOptions,
    tx: &mpsc::Sender<TrainMessage>,
    cancel: &CancelToken,
) -> Result<TrainOutcome> {
    validate_batch_size(opts.batch_size, "training")?;
    if x.is_empty() {
        return Err(PipelineError::DataSufficiency("no training windows".to_string()));
    }
    if x.len() != y.len() {
        return Err(PipelineError::ShapeMismatch {
            expected: format!("{} label rows", x.len()),
            actual: format!("{} label rows", y.len()),
        });
    }
    let validation = validation.filter(|(vx, _)| !vx.is_empty());
    if let Some((vx, vy)) = validation {
        if vx.len() != vy.len() {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("{} validation label rows", vx.len()),
                actual: format!("{} validation label rows", vy.len()),
            });
        }
    }

    let params = candle_nn::ParamsAdamW {
        lr: opts.learning_rate,
        weight_decay: WEIGHT_DECAY,
        ..Default::default()
    };
    let mut opt = candle_nn::AdamW::new(model.varmap.all_vars(), params)?;

    let n = x.len();
    let mut history = Vec::with_capacity(opts.epochs);
    let _ = tx
        .send(TrainMessage::Log(format!(
            "Training on {} windows, {} batches per epoch",
            n,
            n.div_ceil(opts.batch_size)
        )))
        .await;

    for epoch in 0..opts.epochs {
        if cancel.is_cancelled() {
            warn!("Training cancelled before epoch {}", epoch + 1);
            let _ = tx.send(TrainMessage::Cancelled).await;
            return Ok(TrainOutcome::Cancelled(history));
        }

        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut rand::thread_rng());

        let mut total_loss = 0.0;
        let mut correct = 0.0;
        for batch in indices.chunks(opts.batch_size) {
            let xs: Vec<&[f32]> = batch.iter().map(|&i| x[i].as_slice()).collect();
            let ys: Vec<&[f32]> = batch.iter().map(|&i| y[i].as_slice()).collect();
            let x_t = model.features_tensor(&xs)?;
            let y_t = model.labels_tensor(&ys)?;

            let logits = model.net.forward(&x_t)?;
            let loss = bce_with_logits(&logits, &y_t)?;
            opt.backward_step(&loss)?;

            total_loss += loss.to_scalar::<f32>()? as f64 * batch.len() as f64;
            correct += correct_calls(&logits, &y_t)?;
        }

        let (val_loss, val_accuracy) = match validation {
            Some((vx, vy)) => {
                let (l, a) = score(model, vx, vy, opts.batch_size)?;
                (Some(l), Some(a))
            }
            None => (None, None),
        };

        let metrics = EpochMetrics {
            epoch: epoch + 1,
            loss: total_loss / n as f64,
            accuracy: correct / (n * model.output_width()) as f64,
            val_loss,
            val_accuracy,
        };
        history.push(metrics);
        let _ = tx.send(TrainMessage::Epoch(metrics)).await;

        tokio::task::yield_now().await;
    }

    let _ = tx.send(TrainMessage::Finished).await;
    Ok(TrainOutcome::Completed(history))
}

/// Fits on the train split, reports validation metrics on the test split, and
/// writes a JSON run log under `log/`.
pub async fn train_on_dataset(
    model: &mut SequenceModel,
    dataset: &Dataset,
    opts: FitOptions,
    tx: &mpsc::Sender<TrainMessage>,
    cancel: &CancelToken,
) -> Result<TrainOutcome> {
    let started_at = Utc::now();
    info!(
        "Configuration: Epochs={}, Batch Size={}, LR={}",
        opts.epochs, opts.batch_size, opts.learning_rate
    );

    let outcome = fit(
        model,
        &dataset.x_train,
        &dataset.y_train,
        Some((dataset.x_test.as_slice(), dataset.y_test.as_slice())),
        opts,
        tx,
        cancel,
    )
    .await?;

    let run_log = TrainingRunLog {
        started_at: started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        symbols: dataset.symbols.clone(),
        train_samples: dataset.n_train(),
        val_samples: dataset.n_test(),
        epochs_requested: opts.epochs,
        epochs_completed: outcome.history().len(),
        batch_size: opts.batch_size,
        learning_rate: opts.learning_rate,
        stop_reason: match outcome {
            TrainOutcome::Completed(_) => "finished".to_string(),
            TrainOutcome::Cancelled(_) => "cancelled".to_string(),
        },
        epoch_metrics: outcome.history().to_vec(),
    };
    match persist_training_log(&run_log) {
        Ok(path) => info!("Training JSON log saved: {}", path.display()),
        Err(e) => warn!("Failed to save training JSON log: {}", e),
    }

    Ok(outcome)
}
