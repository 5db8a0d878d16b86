use crate::config::{GRU_UNITS_1, GRU_UNITS_2};
use crate::error::{PipelineError, Result};
use crate::model_artifacts::{self, ModelMeta};
use crate::models::gru::GruNet;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use tracing::info;

/// Directional classifier over `[lookback, 2 * symbols]` windows. Outputs one
/// probability per (symbol, horizon day) in the dataset's label layout.
pub struct SequenceModel {
    pub(crate) varmap: VarMap,
    pub(crate) net: GruNet,
    pub(crate) device: Device,
    symbols: Vec<String>,
    lookback: usize,
    horizon: usize,
}

impl SequenceModel {
    pub fn build(symbols: &[String], lookback: usize, horizon: usize, device: &Device) -> Result<Self> {
        if symbols.is_empty() {
            return Err(PipelineError::InvalidConfig("cannot build a model for zero symbols".to_string()));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = GruNet::new(
            2 * symbols.len(),
            GRU_UNITS_1,
            GRU_UNITS_2,
            horizon * symbols.len(),
            vb.pp("model"),
        )?;
        info!(
            "Built GRU model: input [{}, {}], output {}",
            lookback,
            2 * symbols.len(),
            horizon * symbols.len()
        );
        Ok(Self {
            varmap,
            net,
            device: device.clone(),
            symbols: symbols.to_vec(),
            lookback,
            horizon,
        })
    }

    #[allow(dead_code)]
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    #[allow(dead_code)]
    pub fn lookback(&self) -> usize {
        self.lookback
    }

    #[allow(dead_code)]
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn feature_width(&self) -> usize {
        2 * self.symbols.len()
    }

    pub fn output_width(&self) -> usize {
        self.horizon * self.symbols.len()
    }

    /// Stacks flattened feature rows into `[n, lookback, feature_width]`.
    pub(crate) fn features_tensor(&self, rows: &[&[f32]]) -> Result<Tensor> {
        let expected = self.lookback * self.feature_width();
        let mut flat = Vec::with_capacity(rows.len() * expected);
        for row in rows {
            if row.len() != expected {
                return Err(PipelineError::ShapeMismatch {
                    expected: format!("feature rows of length {}", expected),
                    actual: format!("length {}", row.len()),
                });
            }
            flat.extend_from_slice(row);
        }
        Ok(Tensor::from_vec(flat, (rows.len(), self.lookback, self.feature_width()), &self.device)?)
    }

    pub(crate) fn labels_tensor(&self, rows: &[&[f32]]) -> Result<Tensor> {
        let width = self.output_width();
        let mut flat = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(PipelineError::ShapeMismatch {
                    expected: format!("label rows of length {}", width),
                    actual: format!("length {}", row.len()),
                });
            }
            flat.extend_from_slice(row);
        }
        Ok(Tensor::from_vec(flat, (rows.len(), width), &self.device)?)
    }

    /// Up-move probabilities in [0, 1], shape `[rows.len(), horizon * symbols]`.
    pub fn predict(&self, rows: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<&[f32]> = rows.iter().map(Vec::as_slice).collect();
        let x = self.features_tensor(&rows)?;
        let logits = self.net.forward(&x)?;
        let probs = candle_nn::ops::sigmoid(&logits)?;
        Ok(probs.to_vec2::<f32>()?)
    }

    pub fn save(&self, dir: &Path, id: &str) -> Result<()> {
        let meta = ModelMeta {
            symbols: self.symbols.clone(),
            lookback: self.lookback,
            horizon: self.horizon,
        };
        model_artifacts::save_model_artifacts(&self.varmap, &meta, dir, id)
    }

    /// Loads a saved model and checks it was trained on the same symbol
    /// columns and window shape as the data it will score.
    pub fn load(
        dir: &Path,
        id: &str,
        symbols: &[String],
        lookback: usize,
        horizon: usize,
        device: &Device,
    ) -> Result<Self> {
        let meta = model_artifacts::read_model_meta(dir, id)?;
        if meta.symbols != symbols || meta.lookback != lookback || meta.horizon != horizon {
            return Err(PipelineError::InvalidConfig(format!(
                "model '{}' was trained on {:?} (lookback {}, horizon {}), data has {:?} (lookback {}, horizon {})",
                id, meta.symbols, meta.lookback, meta.horizon, symbols, lookback, horizon
            )));
        }
        let mut model = Self::build(&meta.symbols, meta.lookback, meta.horizon, device)?;
        model_artifacts::load_model_weights(&mut model.varmap, dir, id)?;
        Ok(model)
    }
}
