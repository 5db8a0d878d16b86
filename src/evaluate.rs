use crate::cancel::CancelToken;
use crate::config::{DECISION_THRESHOLD, validate_batch_size};
use crate::dataset::label_index;
use crate::error::{PipelineError, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Directional accuracy over the whole test set.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvalReport {
    pub symbols: Vec<String>,
    /// Fraction of correct calls per symbol, over rows x horizon days.
    pub symbol_accuracy: Vec<f64>,
    /// Fraction of correct calls per horizon day, over rows x symbols.
    pub day_accuracy: Vec<f64>,
    pub overall_accuracy: f64,
    pub rows: usize,
    /// `timeline[s][row]`: share of the horizon days called correctly for symbol `s`.
    pub timeline: Vec<Vec<f64>>,
}

impl EvalReport {
    /// Symbols with their accuracy, best first.
    pub fn ranked(&self) -> Vec<(&str, f64)> {
        let mut ranked: Vec<(&str, f64)> = self
            .symbols
            .iter()
            .map(String::as_str)
            .zip(self.symbol_accuracy.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EvalOutcome {
    Completed(EvalReport),
    /// Cancelled before every row was scored. Partial counts are discarded.
    Aborted { rows_processed: usize },
}

/// Scores `predict` against `y_test` in chunks of `batch_size` rows.
///
/// The token is checked before each chunk and the task yields after each one,
/// so a single-threaded host never waits on more than one chunk. Correct calls
/// are counted as integers, which makes the result independent of the batch size.
pub async fn evaluate_batched<F>(
    x_test: &[Vec<f32>],
    y_test: &[Vec<f32>],
    symbols: &[String],
    horizon: usize,
    mut predict: F,
    cancel: &CancelToken,
    batch_size: usize,
) -> Result<EvalOutcome>
where
    F: FnMut(&[Vec<f32>]) -> Result<Vec<Vec<f32>>>,
{
    validate_batch_size(batch_size, "evaluation")?;
    let n = x_test.len();
    if n == 0 {
        return Err(PipelineError::DataSufficiency("test set is empty, nothing to evaluate".to_string()));
    }
    if y_test.len() != n {
        return Err(PipelineError::ShapeMismatch {
            expected: format!("{} label rows", n),
            actual: format!("{} label rows", y_test.len()),
        });
    }

    let n_sym = symbols.len();
    let width = n_sym * horizon;
    let mut symbol_correct = vec![0u64; n_sym];
    let mut day_correct = vec![0u64; horizon];
    let mut timeline: Vec<Vec<f64>> = vec![Vec::with_capacity(n); n_sym];
    let mut rows_processed = 0;

    for start in (0..n).step_by(batch_size) {
        if cancel.is_cancelled() {
            warn!("Evaluation cancelled after {}/{} rows; discarding partial counts", rows_processed, n);
            return Ok(EvalOutcome::Aborted { rows_processed });
        }

        let end = (start + batch_size).min(n);
        {
            let preds = predict(&x_test[start..end])?;
            if preds.len() != end - start {
                return Err(PipelineError::ShapeMismatch {
                    expected: format!("{} prediction rows", end - start),
                    actual: format!("{} prediction rows", preds.len()),
                });
            }

            for (pred, truth) in preds.iter().zip(&y_test[start..end]) {
                if pred.len() != width || truth.len() != width {
                    return Err(PipelineError::ShapeMismatch {
                        expected: format!("rows of width {}", width),
                        actual: format!("prediction width {}, label width {}", pred.len(), truth.len()),
                    });
                }
                for s in 0..n_sym {
                    let mut row_correct = 0u64;
                    for d in 0..horizon {
                        let idx = label_index(s, d, horizon);
                        let called_up = pred[idx] >= DECISION_THRESHOLD;
                        let went_up = truth[idx] >= DECISION_THRESHOLD;
                        if called_up == went_up {
                            row_correct += 1;
                            day_correct[d] += 1;
                        }
                    }
                    symbol_correct[s] += row_correct;
                    timeline[s].push(row_correct as f64 / horizon as f64);
                }
            }
        }

        rows_processed = end;
        debug!("Evaluated {}/{} rows", rows_processed, n);
        tokio::task::yield_now().await;
    }

    let rows = rows_processed as f64;
    let symbol_accuracy = symbol_correct
        .iter()
        .map(|&c| c as f64 / (rows * horizon as f64))
        .collect();
    let day_accuracy = day_correct
        .iter()
        .map(|&c| c as f64 / (rows * n_sym as f64))
        .collect();
    let overall_accuracy = symbol_correct.iter().sum::<u64>() as f64 / (rows * width as f64);

    info!("Evaluation finished: {} rows, overall accuracy {:.4}", rows_processed, overall_accuracy);

    Ok(EvalOutcome::Completed(EvalReport {
        symbols: symbols.to_vec(),
        symbol_accuracy,
        day_accuracy,
        overall_accuracy,
        rows: rows_processed,
        timeline,
    }))
}

pub fn print_report(report: &EvalReport) {
    println!("\n╔════════════════════════════════════════════╗");
    println!("║        Directional Accuracy (test)         ║");
    println!("╠════════════════════════════════════════════╣");
    println!("║  Rows evaluated : {:>8}                 ║", report.rows);
    println!("║  Overall        : {:>7.2}%                 ║", report.overall_accuracy * 100.0);
    println!("╠════════════════════════════════════════════╣");
    println!("║  Per symbol (best → worst)                 ║");
    for (sym, acc) in report.ranked() {
        println!("║    {:<10} {:>7.2}%                     ║", sym, acc * 100.0);
    }
    println!("╠════════════════════════════════════════════╣");
    println!("║  Per horizon day                           ║");
    for (d, acc) in report.day_accuracy.iter().enumerate() {
        println!("║    Day {:<6} {:>7.2}%                     ║", d + 1, acc * 100.0);
    }
    println!("╚════════════════════════════════════════════╝");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const H: usize = 3;

    fn symbols(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("S{i}")).collect()
    }

    /// Random labels plus a fixed table of "predictions" looked up by the first feature.
    fn fixture(n: usize, n_sym: usize) -> (Vec<Vec<f32>>, Vec<Vec<f32>>, Vec<Vec<f32>>) {
        let mut rng = rand::thread_rng();
        let x = (0..n).map(|i| vec![i as f32]).collect();
        let y = (0..n)
            .map(|_| (0..n_sym * H).map(|_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 }).collect())
            .collect();
        let p = (0..n)
            .map(|_| (0..n_sym * H).map(|_| rng.gen_range(0.0f32..1.0)).collect())
            .collect();
        (x, y, p)
    }

    fn table_predictor(table: &[Vec<f32>]) -> impl FnMut(&[Vec<f32>]) -> Result<Vec<Vec<f32>>> + '_ {
        move |rows: &[Vec<f32>]| -> Result<Vec<Vec<f32>>> {
            Ok(rows.iter().map(|r| table[r[0] as usize].clone()).collect())
        }
    }

    async fn run(x: &[Vec<f32>], y: &[Vec<f32>], p: &[Vec<f32>], syms: &[String], batch: usize) -> EvalReport {
        let outcome = evaluate_batched(x, y, syms, H, table_predictor(p), &CancelToken::new(), batch)
            .await
            .unwrap();
        match outcome {
            EvalOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_size_invariance() {
        let syms = symbols(4);
        let (x, y, p) = fixture(53, syms.len());
        let reference = run(&x, &y, &p, &syms, x.len()).await;
        for batch in [1, 7, 256] {
            let report = run(&x, &y, &p, &syms, batch).await;
            assert_eq!(report, reference, "batch size {batch}");
        }
    }

    #[tokio::test]
    async fn test_accuracy_normalization() {
        let syms = symbols(2);
        // Two rows. Symbol 0 is always right, symbol 1 is right only on day 0 of row 0.
        let y = vec![vec![1.0, 0.0, 1.0, 1.0, 1.0, 1.0], vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0]];
        let p = vec![vec![0.9, 0.1, 0.5, 0.7, 0.2, 0.2], vec![0.4, 0.0, 0.49, 0.8, 0.8, 0.8]];
        let x = vec![vec![0.0], vec![1.0]];
        let report = run(&x, &y, &p, &syms, 1).await;

        assert_eq!(report.rows, 2);
        assert_eq!(report.symbol_accuracy, vec![1.0, 1.0 / 6.0]);
        assert_eq!(report.day_accuracy, vec![3.0 / 4.0, 2.0 / 4.0, 2.0 / 4.0]);
        assert!((report.overall_accuracy - 7.0 / 12.0).abs() < 1e-12);
        assert_eq!(report.timeline[0], vec![1.0, 1.0]);
        assert_eq!(report.timeline[1], vec![1.0 / 3.0, 0.0]);
        assert_eq!(report.ranked()[0], ("S0", 1.0));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_aborts() {
        let syms = symbols(1);
        let (x, y, p) = fixture(10, 1);
        let token = CancelToken::new();
        token.cancel();
        let outcome = evaluate_batched(&x, &y, &syms, H, table_predictor(&p), &token, 4).await.unwrap();
        assert_eq!(outcome, EvalOutcome::Aborted { rows_processed: 0 });
    }

    #[tokio::test]
    async fn test_cancel_mid_run_never_returns_numbers() {
        let syms = symbols(2);
        let (x, y, p) = fixture(20, 2);
        let token = CancelToken::new();
        let host = token.clone();
        let mut calls = 0;
        let predict = |rows: &[Vec<f32>]| -> Result<Vec<Vec<f32>>> {
            calls += 1;
            if calls == 2 {
                host.cancel();
            }
            Ok(rows.iter().map(|r| p[r[0] as usize].clone()).collect())
        };
        let outcome = evaluate_batched(&x, &y, &syms, H, predict, &token, 5).await.unwrap();
        assert_eq!(outcome, EvalOutcome::Aborted { rows_processed: 10 });
    }

    #[tokio::test]
    async fn test_cancel_from_concurrent_task() {
        let syms = symbols(1);
        let (x, y, p) = fixture(1000, 1);
        let token = CancelToken::new();
        let host = token.clone();
        // Runs only while the evaluator yields between chunks on this
        // single-threaded runtime.
        let canceller = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            host.cancel();
        });
        let outcome = evaluate_batched(&x, &y, &syms, H, table_predictor(&p), &token, 10).await.unwrap();
        canceller.await.unwrap();
        match outcome {
            EvalOutcome::Aborted { rows_processed } => {
                assert!(rows_processed > 0 && rows_processed < 1000, "got {rows_processed}");
                assert_eq!(rows_processed % 10, 0);
            }
            other => panic!("expected an aborted run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_test_set_is_insufficient() {
        let syms = symbols(1);
        let err = evaluate_batched(&[], &[], &syms, H, table_predictor(&[]), &CancelToken::new(), 8)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::DataSufficiency(_)));
    }

    #[tokio::test]
    async fn test_wrong_prediction_width_is_rejected() {
        let syms = symbols(2);
        let (x, y, _) = fixture(3, 2);
        let predict = |rows: &[Vec<f32>]| -> Result<Vec<Vec<f32>>> {
            Ok(rows.iter().map(|_| vec![0.5; 2]).collect())
        };
        let err = evaluate_batched(&x, &y, &syms, H, predict, &CancelToken::new(), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_invalid() {
        let syms = symbols(1);
        let (x, y, p) = fixture(3, 1);
        let err = evaluate_batched(&x, &y, &syms, H, table_predictor(&p), &CancelToken::new(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }
}
