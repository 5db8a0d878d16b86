use candle_core::{Module, Result, Tensor};
use candle_nn::{GRU, GRUConfig, Linear, RNN, VarBuilder};

/// Two stacked GRUs and a dense head producing one logit per (symbol, horizon day).
pub struct GruNet {
    gru_1: GRU,
    gru_2: GRU,
    head: Linear,
}

impl GruNet {
    pub fn new(
        input_dim: usize,
        hidden_1: usize,
        hidden_2: usize,
        output_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gru_1 = candle_nn::gru(input_dim, hidden_1, GRUConfig::default(), vb.pp("gru_1"))?;
        let gru_2 = candle_nn::gru(hidden_1, hidden_2, GRUConfig::default(), vb.pp("gru_2"))?;
        let head = candle_nn::linear(hidden_2, output_dim, vb.pp("head"))?;
        Ok(Self { gru_1, gru_2, head })
    }

    /// x: [batch, seq_len, input_dim] -> logits [batch, output_dim]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let states = self.gru_1.seq(x)?;
        let hidden_seq: Vec<Tensor> = states.iter().map(|s| s.h.clone()).collect();
        let hidden_seq = Tensor::stack(&hidden_seq, 1)?;

        let states = self.gru_2.seq(&hidden_seq)?;
        let h_t = states
            .last()
            .ok_or_else(|| candle_core::Error::Msg("Empty GRU sequence".into()))?
            .h
            .clone();
        self.head.forward(&h_t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = GruNet::new(4, 8, 6, 9, vb)?;

        let x = Tensor::rand(0.0f32, 1.0f32, (5, 12, 4), &device)?;
        let logits = net.forward(&x)?;
        assert_eq!(logits.dims(), &[5, 9]);
        Ok(())
    }

    #[test]
    fn test_forward_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = GruNet::new(4, 8, 6, 9, vb)?;

        let x = Tensor::rand(0.0f32, 1.0f32, (3, 12, 4), &device)?;
        assert_eq!(net.forward(&x)?.to_vec2::<f32>()?, net.forward(&x)?.to_vec2::<f32>()?);
        Ok(())
    }
}
