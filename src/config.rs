use crate::error::{PipelineError, Result};
use candle_core::Device;
use std::path::PathBuf;
use tracing::{info, warn};

pub const LOOKBACK: usize = 12;
pub const HORIZON: usize = 3;
/// Fraction of the date axis (for scaling) and of the window set (for the split)
/// treated as the training period.
pub const TRAIN_SPLIT: f64 = 0.8;
/// Guards zero-range symbols in min/max scaling.
pub const SCALE_EPS: f64 = 1e-7;
/// Rows handled per evaluator chunk before yielding back to the runtime.
pub const EVAL_BATCH_SIZE: usize = 256;
pub const EPOCHS: usize = 25;
pub const BATCH_SIZE: usize = 64;
pub const LEARNING_RATE: f64 = 1e-3;
pub const WEIGHT_DECAY: f64 = 0.01;
pub const GRU_UNITS_1: usize = 64;
pub const GRU_UNITS_2: usize = 32;
/// Prediction threshold for turning sigmoid outputs into directional calls.
pub const DECISION_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MODEL_ID: &str = "gru-stock";

/// Window geometry and split fraction shared by every pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineConfig {
    pub lookback: usize,
    pub horizon: usize,
    pub train_fraction: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookback: LOOKBACK,
            horizon: HORIZON,
            train_fraction: TRAIN_SPLIT,
        }
    }
}

impl PipelineConfig {
    pub fn with_train_fraction(train_fraction: f64) -> Self {
        Self { train_fraction, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lookback == 0 || self.horizon == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "lookback and horizon must be positive (got lookback={}, horizon={})",
                self.lookback, self.horizon
            )));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction <= 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "train fraction must be in (0, 1], got {}",
                self.train_fraction
            )));
        }
        Ok(())
    }

    /// Number of leading items (dates or windows) that belong to the training period.
    pub fn train_len(&self, n: usize) -> usize {
        (n as f64 * self.train_fraction).floor() as usize
    }
}

pub fn validate_batch_size(batch_size: usize, context: &str) -> Result<()> {
    if batch_size == 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "{} batch size must be positive",
            context
        )));
    }
    Ok(())
}

/// Directory holding saved model artifacts. `PANELGRU_MODEL_DIR` overrides the default.
pub fn model_dir() -> PathBuf {
    match std::env::var("PANELGRU_MODEL_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => PathBuf::from("models"),
    }
}

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }

    #[cfg(feature = "mkl")]
    info!("Using CPU device with Intel MKL BLAS acceleration");

    #[cfg(not(feature = "mkl"))]
    info!("Using CPU device");

    info!("CPU threads available: {}", num_cpus::get());

    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = PipelineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.lookback, 12);
        assert_eq!(cfg.horizon, 3);
    }

    #[test]
    fn test_train_fraction_bounds() {
        assert!(PipelineConfig::with_train_fraction(0.0).validate().is_err());
        assert!(PipelineConfig::with_train_fraction(1.5).validate().is_err());
        assert!(PipelineConfig::with_train_fraction(f64::NAN).validate().is_err());
        assert!(PipelineConfig::with_train_fraction(1.0).validate().is_ok());
    }

    #[test]
    fn test_train_len_floors() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.train_len(6), 4);
        assert_eq!(cfg.train_len(20), 16);
        assert_eq!(cfg.train_len(0), 0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(validate_batch_size(0, "eval").is_err());
        assert!(validate_batch_size(1, "eval").is_ok());
    }
}
