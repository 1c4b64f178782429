//! Single-token f32 forward pass for GPT-BigCode blocks: learned absolute
//! positions, pre-norm layers, multi-query attention and a GELU MLP.

use super::weights::StarcoderWeights;
use crate::core::cache::{CausalKVCache, KVCache};
use crate::core::model::{Hyperparameters, TokenId};
use crate::core::tensor::ops::{add_inplace, dot, gelu_inplace, layer_norm, softmax_inplace};
use crate::core::tensor::TensorOps;
use crate::error::{try_alloc_f32, Error, Result};

/// Activation buffers reused across tokens.
pub struct Scratch {
    x: Vec<f32>,
    norm: Vec<f32>,
    qkv: Vec<f32>,
    attn: Vec<f32>,
    proj: Vec<f32>,
    ff: Vec<f32>,
    scores: Vec<f32>,
    pub logits: Vec<f32>,
}

impl Scratch {
    pub fn new(hp: &Hyperparameters) -> Result<Self> {
        let n_embd = hp.n_embd;
        Ok(Self {
            x: try_alloc_f32(n_embd)?,
            norm: try_alloc_f32(n_embd)?,
            qkv: try_alloc_f32(n_embd + 2 * hp.kv_dim())?,
            attn: try_alloc_f32(n_embd)?,
            proj: try_alloc_f32(n_embd)?,
            ff: try_alloc_f32(hp.n_ff)?,
            scores: try_alloc_f32(hp.n_ctx)?,
            logits: try_alloc_f32(hp.n_vocab)?,
        })
    }

    /// Bytes `new` allocates for `hp`.
    pub fn bytes(hp: &Hyperparameters) -> u64 {
        let floats = [5 * hp.n_embd as u64, 2 * hp.kv_dim() as u64, hp.n_ff as u64, hp.n_ctx as u64, hp.n_vocab as u64]
            .iter()
            .fold(0u64, |acc, &n| acc.saturating_add(n));
        floats.saturating_mul(4)
    }
}

/// Run `token` at `pos` through every block, writing its keys and values into
/// `cache`. The final hidden state is left in the scratch buffers.
pub fn eval_token(
    hp: &Hyperparameters,
    w: &StarcoderWeights,
    cache: &mut CausalKVCache,
    scratch: &mut Scratch,
    token: TokenId,
    pos: usize,
) -> Result<()> {
    let n_embd = hp.n_embd;
    let kv_dim = hp.kv_dim();

    let tok = token
        .index()
        .and_then(|i| w.token_embd.row(i))
        .ok_or_else(|| Error::Config(format!("token {} outside vocabulary", token)))?;
    let wpe = w.position_embd.row(pos).ok_or(Error::ContextOverflow {
        n_past: pos,
        requested: 1,
        n_ctx: hp.n_ctx,
    })?;

    let Scratch { x, norm, qkv, attn, proj, ff, scores, .. } = scratch;

    for ((dst, &t), &p) in x.iter_mut().zip(tok).zip(wpe) {
        *dst = t + p;
    }

    for (il, layer) in w.layers.iter().enumerate() {
        layer_norm(x, &layer.attn_norm_w, &layer.attn_norm_b, hp.norm_eps, norm);
        layer.attn_qkv_w.matvec(norm, Some(&layer.attn_qkv_b), qkv)?;

        let (q, kv) = qkv.split_at(n_embd);
        let (k, v) = kv.split_at(kv_dim);
        cache.write(il, pos, k, v)?;

        attention(
            hp,
            q,
            cache.keys(il, pos + 1),
            cache.values(il, pos + 1),
            &mut scores[..pos + 1],
            attn,
        );

        layer.attn_out_w.matvec(attn, Some(&layer.attn_out_b), proj)?;
        add_inplace(x, proj);

        layer_norm(x, &layer.ffn_norm_w, &layer.ffn_norm_b, hp.norm_eps, norm);
        layer.ffn_up_w.matvec(norm, Some(&layer.ffn_up_b), ff)?;
        gelu_inplace(ff);
        layer.ffn_down_w.matvec(ff, Some(&layer.ffn_down_b), proj)?;
        add_inplace(x, proj);
    }

    Ok(())
}

/// Final norm and vocabulary projection of the last hidden state into `scratch.logits`.
pub fn project_logits(hp: &Hyperparameters, w: &StarcoderWeights, scratch: &mut Scratch) -> Result<()> {
    let Scratch { x, norm, logits, .. } = scratch;
    layer_norm(x, &w.output_norm_w, &w.output_norm_b, hp.norm_eps, norm);
    w.lm_head().matvec(norm, None, logits)
}

/// Causal multi-query attention for one query row. Query head `h` reads kv
/// head `h / (n_head / n_head_kv)`.
fn attention(
    hp: &Hyperparameters,
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    scores: &mut [f32],
    out: &mut [f32],
) {
    let head_dim = hp.head_dim();
    let kv_dim = hp.kv_dim();
    let group = hp.n_head / hp.n_head_kv;
    let scale = 1.0 / (head_dim as f32).sqrt();

    out.fill(0.0);
    for h in 0..hp.n_head {
        let kv_off = (h / group) * head_dim;
        let q_h = &q[h * head_dim..(h + 1) * head_dim];

        for (t, s) in scores.iter_mut().enumerate() {
            let k = &keys[t * kv_dim + kv_off..t * kv_dim + kv_off + head_dim];
            *s = dot(q_h, k) * scale;
        }
        softmax_inplace(scores);

        let out_h = &mut out[h * head_dim..(h + 1) * head_dim];
        for (t, &s) in scores.iter().enumerate() {
            let v = &values[t * kv_dim + kv_off..t * kv_dim + kv_off + head_dim];
            for (o, &vi) in out_h.iter_mut().zip(v) {
                *o += s * vi;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_position_attention_returns_value() {
        let hp = Hyperparameters::builder()
            .embedding_length(4)
            .num_heads(2)
            .num_kv_heads(1)
            .build();
        let q = [1.0, 0.0, 0.0, 1.0];
        let keys = [0.3, -0.2];
        let values = [5.0, -7.0];
        let mut scores = [0.0];
        let mut out = [0.0; 4];

        attention(&hp, &q, &keys, &values, &mut scores, &mut out);
        assert_eq!(out, [5.0, -7.0, 5.0, -7.0]);
    }

    #[test]
    fn test_attention_weights_sum_to_one() {
        let hp = Hyperparameters::builder()
            .embedding_length(2)
            .num_heads(1)
            .num_kv_heads(1)
            .build();
        let q = [0.5, -1.0];
        let keys = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let values = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let mut scores = [0.0; 3];
        let mut out = [0.0; 2];

        attention(&hp, &q, &keys, &values, &mut scores, &mut out);
        assert!((scores.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!((out[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_scratch_bytes_matches_allocation() {
        let hp = Hyperparameters::builder()
            .vocab_size(3)
            .context_length(8)
            .embedding_length(8)
            .num_heads(2)
            .num_kv_heads(1)
            .feed_forward_length(16)
            .build();
        let s = Scratch::new(&hp).unwrap();
        let floats = s.x.len() + s.norm.len() + s.qkv.len() + s.attn.len()
            + s.proj.len() + s.ff.len() + s.scores.len() + s.logits.len();
        assert_eq!(Scratch::bytes(&hp), floats as u64 * 4);
    }
}
