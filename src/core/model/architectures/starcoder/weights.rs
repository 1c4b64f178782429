use crate::core::model::Hyperparameters;
use crate::core::tensor::Tensor;
use crate::error::{Error, Result};
use crate::infra::weights::WeightStore;

pub struct LayerWeights {
    pub attn_norm_w: Tensor,
    pub attn_norm_b: Tensor,
    pub attn_qkv_w: Tensor,
    pub attn_qkv_b: Tensor,
    pub attn_out_w: Tensor,
    pub attn_out_b: Tensor,
    pub ffn_norm_w: Tensor,
    pub ffn_norm_b: Tensor,
    pub ffn_up_w: Tensor,
    pub ffn_up_b: Tensor,
    pub ffn_down_w: Tensor,
    pub ffn_down_b: Tensor,
}

pub struct StarcoderWeights {
    pub token_embd: Tensor,
    pub position_embd: Tensor,
    pub output_norm_w: Tensor,
    pub output_norm_b: Tensor,
    /// Absent when the output projection is tied to the token embedding.
    output: Option<Tensor>,
    pub layers: Vec<LayerWeights>,
}

impl StarcoderWeights {
    /// Move every tensor the architecture needs out of `store`, checking each
    /// against the shape `hp` implies. Shapes are in ggml order: `[row_len, rows]`.
    pub fn from_store(mut store: WeightStore, hp: &Hyperparameters) -> Result<Self> {
        let n_embd = hp.n_embd;
        let qkv = n_embd + 2 * hp.kv_dim();
        let has_output = store.try_get("output.weight").is_some();

        let mut take = |name: &str, dims: &[usize]| -> Result<Tensor> {
            let tensor = store.take(name)?;
            if tensor.shape().dims() != dims {
                return Err(Error::format(format!(
                    "tensor '{}' has shape {:?}, expected {:?}",
                    name,
                    tensor.shape().dims(),
                    dims
                )));
            }
            Ok(tensor)
        };

        let token_embd = take("token_embd.weight", &[n_embd, hp.n_vocab])?;
        let position_embd = take("position_embd.weight", &[n_embd, hp.n_ctx])?;
        let output_norm_w = take("output_norm.weight", &[n_embd])?;
        let output_norm_b = take("output_norm.bias", &[n_embd])?;

        let mut layers = Vec::with_capacity(hp.n_layer);
        for i in 0..hp.n_layer {
            let name = |suffix: &str| format!("blk.{}.{}", i, suffix);
            layers.push(LayerWeights {
                attn_norm_w: take(&name("attn_norm.weight"), &[n_embd])?,
                attn_norm_b: take(&name("attn_norm.bias"), &[n_embd])?,
                attn_qkv_w: take(&name("attn_qkv.weight"), &[n_embd, qkv])?,
                attn_qkv_b: take(&name("attn_qkv.bias"), &[qkv])?,
                attn_out_w: take(&name("attn_output.weight"), &[n_embd, n_embd])?,
                attn_out_b: take(&name("attn_output.bias"), &[n_embd])?,
                ffn_norm_w: take(&name("ffn_norm.weight"), &[n_embd])?,
                ffn_norm_b: take(&name("ffn_norm.bias"), &[n_embd])?,
                ffn_up_w: take(&name("ffn_up.weight"), &[n_embd, hp.n_ff])?,
                ffn_up_b: take(&name("ffn_up.bias"), &[hp.n_ff])?,
                ffn_down_w: take(&name("ffn_down.weight"), &[hp.n_ff, n_embd])?,
                ffn_down_b: take(&name("ffn_down.bias"), &[n_embd])?,
            });
        }

        let output = if has_output {
            Some(take("output.weight", &[n_embd, hp.n_vocab])?)
        } else {
            None
        };

        Ok(Self {
            token_embd,
            position_embd,
            output_norm_w,
            output_norm_b,
            output,
            layers,
        })
    }

    pub fn lm_head(&self) -> &Tensor {
        self.output.as_ref().unwrap_or(&self.token_embd)
    }

    pub fn is_tied(&self) -> bool {
        self.output.is_none()
    }
}
