use crate::error::{PipelineError, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Sidecar stored next to the weights so a model can be rebuilt with the
/// column layout it was trained on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub symbols: Vec<String>,
    pub lookback: usize,
    pub horizon: usize,
}

pub fn weights_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.safetensors", id))
}

pub fn meta_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id))
}

fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok && !id.starts_with('.') {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!("invalid model id '{}'", id)))
    }
}

pub fn save_model_artifacts(varmap: &VarMap, meta: &ModelMeta, dir: &Path, id: &str) -> Result<()> {
    validate_id(id)?;
    std::fs::create_dir_all(dir)?;

    let weights = weights_path(dir, id);
    varmap.save(&weights)?;
    info!("Saved safetensors checkpoint: {}", weights.display());

    let meta_file = meta_path(dir, id);
    let writer = std::io::BufWriter::new(std::fs::File::create(&meta_file)?);
    serde_json::to_writer_pretty(writer, meta)?;
    info!("Saved model metadata: {}", meta_file.display());

    Ok(())
}

pub fn read_model_meta(dir: &Path, id: &str) -> Result<ModelMeta> {
    validate_id(id)?;
    let reader = std::io::BufReader::new(std::fs::File::open(meta_path(dir, id))?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn load_model_weights(varmap: &mut VarMap, dir: &Path, id: &str) -> Result<()> {
    validate_id(id)?;
    let weights = weights_path(dir, id);
    varmap.load(&weights)?;
    info!("Loaded safetensors checkpoint: {}", weights.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SequenceModel;
    use candle_core::Device;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("panelgru_{}_{}", tag, std::process::id()))
    }

    #[test]
    fn test_save_load_round_trip_preserves_predictions() {
        let dir = temp_dir("artifacts");
        let symbols = vec!["AAA".to_string(), "BBB".to_string()];
        let model = SequenceModel::build(&symbols, 12, 3, &Device::Cpu).unwrap();
        model.save(&dir, "unit-test").unwrap();

        let loaded = SequenceModel::load(&dir, "unit-test", &symbols, 12, 3, &Device::Cpu).unwrap();
        assert_eq!(loaded.symbols(), symbols.as_slice());
        assert_eq!((loaded.lookback(), loaded.horizon()), (12, 3));

        let rows: Vec<Vec<f32>> = (0..3).map(|i| vec![i as f32 * 0.1; 12 * 4]).collect();
        assert_eq!(model.predict(&rows).unwrap(), loaded.predict(&rows).unwrap());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_artifacts_fail() {
        let dir = temp_dir("missing");
        let symbols = vec!["AAA".to_string()];
        assert!(SequenceModel::load(&dir, "nope", &symbols, 12, 3, &Device::Cpu).is_err());
    }

    #[test]
    fn test_load_rejects_different_symbols_or_shape() {
        let dir = temp_dir("mismatch");
        let trained = vec!["AAA".to_string(), "BBB".to_string()];
        SequenceModel::build(&trained, 12, 3, &Device::Cpu)
            .unwrap()
            .save(&dir, "pair")
            .unwrap();

        let other = vec!["AAA".to_string(), "CCC".to_string()];
        let err = SequenceModel::load(&dir, "pair", &other, 12, 3, &Device::Cpu).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidConfig(_)), "got {err:?}");

        let err = SequenceModel::load(&dir, "pair", &trained, 10, 3, &Device::Cpu).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidConfig(_)), "got {err:?}");

        assert!(SequenceModel::load(&dir, "pair", &trained, 12, 3, &Device::Cpu).is_ok());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_path_like_ids_are_rejected() {
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("").is_err());
        assert!(validate_id("gru-stock_v2").is_ok());
    }
}
