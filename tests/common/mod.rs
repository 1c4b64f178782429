#![allow(dead_code)]

use llmodel::{Backend, GgufWriter, SeededRng, StarcoderBackend};
use std::path::PathBuf;
use tempfile::TempDir;

pub const VOCAB: [&str; 3] = ["a", "b", "</s>"];
pub const TOKEN_A: llmodel::TokenId = llmodel::TokenId(0);
pub const TOKEN_B: llmodel::TokenId = llmodel::TokenId(1);
pub const TOKEN_END: llmodel::TokenId = llmodel::TokenId(2);

#[derive(Debug, Clone)]
pub struct ToyOptions {
    pub n_layer: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_head_kv: usize,
    pub n_ff: usize,
    pub tied_output: bool,
    pub f16: bool,
    pub weight_seed: u64,
    /// Extra normal tokens appended after the base vocabulary.
    pub filler_tokens: usize,
    pub filler_merges: usize,
    pub eos_id: u64,
}

impl Default for ToyOptions {
    fn default() -> Self {
        Self {
            n_layer: 4,
            n_ctx: 16,
            n_embd: 8,
            n_head: 2,
            n_head_kv: 1,
            // enough rows for the matvec to go parallel
            n_ff: 64,
            tied_output: false,
            f16: false,
            weight_seed: 1234,
            filler_tokens: 0,
            filler_merges: 0,
            eos_id: TOKEN_END.0 as u64,
        }
    }
}

/// A StarCoder model file in a temporary directory that lives as long as this value.
pub struct ToyModel {
    pub dir: TempDir,
    pub path: PathBuf,
    pub options: ToyOptions,
}

pub fn toy_model() -> ToyModel {
    toy_model_with(ToyOptions::default())
}

pub fn toy_model_with(options: ToyOptions) -> ToyModel {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("toy-starcoder.gguf");
    write_toy(&path, &options);
    ToyModel { dir, path, options }
}

pub fn loaded_backend(model: &ToyModel, seed: u64) -> StarcoderBackend {
    let mut backend = StarcoderBackend::new();
    backend.load_model(&model.path).expect("toy model loads");
    backend.set_seed(seed);
    backend
}

fn write_toy(path: &std::path::Path, o: &ToyOptions) {
    let mut vocab: Vec<String> = VOCAB.iter().map(|t| t.to_string()).collect();
    vocab.extend((0..o.filler_tokens).map(|i| format!("t{}", i)));
    let mut token_types = vec![1, 1, 3];
    token_types.resize(vocab.len(), 1);
    let merges: Vec<String> = (0..o.filler_merges).map(|i| format!("x{} y{}", i, i)).collect();
    let n_vocab = vocab.len();
    let head_dim = o.n_embd / o.n_head;
    let kv_dim = o.n_head_kv * head_dim;
    let qkv = o.n_embd + 2 * kv_dim;

    let mut rng = SeededRng::new(o.weight_seed);
    let mut random = |n: usize| -> Vec<f32> { (0..n).map(|_| rng.gen_range(-0.5..0.5) as f32).collect() };

    let mut w = GgufWriter::new();
    w.add_string("general.architecture", "starcoder");
    w.add_string("general.name", "toy");
    w.add_u32("starcoder.context_length", o.n_ctx as u32);
    w.add_u32("starcoder.embedding_length", o.n_embd as u32);
    w.add_u32("starcoder.feed_forward_length", o.n_ff as u32);
    w.add_u32("starcoder.block_count", o.n_layer as u32);
    w.add_u32("starcoder.attention.head_count", o.n_head as u32);
    w.add_u32("starcoder.attention.head_count_kv", o.n_head_kv as u32);
    w.add_f32("starcoder.attention.layer_norm_epsilon", 1e-5);
    w.add_string("tokenizer.ggml.model", "gpt2");
    w.add_string_array("tokenizer.ggml.tokens", &vocab);
    w.add_i32_array("tokenizer.ggml.token_type", &token_types);
    w.add_string_array("tokenizer.ggml.merges", &merges);
    w.add_u32("tokenizer.ggml.bos_token_id", TOKEN_END.0 as u32);
    w.add_u64("tokenizer.ggml.eos_token_id", o.eos_id);

    let mut tensors: Vec<(String, Vec<u64>, Vec<f32>)> = Vec::new();
    let mut push = |name: String, dims: &[usize], data: Vec<f32>| {
        tensors.push((name, dims.iter().map(|&d| d as u64).collect(), data));
    };

    push("token_embd.weight".into(), &[o.n_embd, n_vocab], random(o.n_embd * n_vocab));
    push("position_embd.weight".into(), &[o.n_embd, o.n_ctx], random(o.n_embd * o.n_ctx));
    for i in 0..o.n_layer {
        let name = |s: &str| format!("blk.{}.{}", i, s);
        push(name("attn_norm.weight"), &[o.n_embd], vec![1.0; o.n_embd]);
        push(name("attn_norm.bias"), &[o.n_embd], vec![0.0; o.n_embd]);
        push(name("attn_qkv.weight"), &[o.n_embd, qkv], random(o.n_embd * qkv));
        push(name("attn_qkv.bias"), &[qkv], random(qkv));
        push(name("attn_output.weight"), &[o.n_embd, o.n_embd], random(o.n_embd * o.n_embd));
        push(name("attn_output.bias"), &[o.n_embd], random(o.n_embd));
        push(name("ffn_norm.weight"), &[o.n_embd], vec![1.0; o.n_embd]);
        push(name("ffn_norm.bias"), &[o.n_embd], vec![0.0; o.n_embd]);
        push(name("ffn_up.weight"), &[o.n_embd, o.n_ff], random(o.n_embd * o.n_ff));
        push(name("ffn_up.bias"), &[o.n_ff], random(o.n_ff));
        push(name("ffn_down.weight"), &[o.n_ff, o.n_embd], random(o.n_ff * o.n_embd));
        push(name("ffn_down.bias"), &[o.n_embd], random(o.n_embd));
    }
    push("output_norm.weight".into(), &[o.n_embd], vec![1.0; o.n_embd]);
    push("output_norm.bias".into(), &[o.n_embd], vec![0.0; o.n_embd]);
    if !o.tied_output {
        push("output.weight".into(), &[o.n_embd, n_vocab], random(o.n_embd * n_vocab));
    }

    for (name, dims, data) in &tensors {
        if o.f16 {
            w.add_tensor_f16(name, dims, data);
        } else {
            w.add_tensor_f32(name, dims, data);
        }
    }

    w.write_to_path(path).expect("write toy model");
}
