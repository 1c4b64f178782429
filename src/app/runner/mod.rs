//! Architecture-agnostic generation loop over a [`Backend`].

use crate::core::model::{Backend, PromptContext, TokenId};
use crate::envconfig::EnvConfig;
use crate::error::{Error, Result};
use crate::sample::SamplingParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::iter::FusedIterator;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub n_batch: usize,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    /// Fraction of the history to drop when the context fills; `None` stops instead.
    pub context_erase: Option<f32>,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            n_batch: 9,
            sampling: SamplingParams::default(),
            context_erase: None,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Overlay request options onto the defaults. Unknown keys and values of
    /// the wrong type are ignored.
    pub fn from_map(m: &HashMap<String, serde_json::Value>) -> Self {
        let mut cfg = Self::default();

        if let Some(n) = m.get("num_predict").or_else(|| m.get("max_tokens")).and_then(|v| v.as_u64()) {
            cfg.max_tokens = n as usize;
        }
        if let Some(n) = m.get("batch_size").or_else(|| m.get("n_batch")).and_then(|v| v.as_u64()) {
            cfg.n_batch = n as usize;
        }
        if let Some(n) = m.get("temperature").and_then(|v| v.as_f64()) {
            cfg.sampling.temperature = n as f32;
        }
        if let Some(n) = m.get("top_k").and_then(|v| v.as_u64()) {
            cfg.sampling.top_k = n as usize;
        }
        if let Some(n) = m.get("top_p").and_then(|v| v.as_f64()) {
            cfg.sampling.top_p = n as f32;
        }
        if let Some(n) = m.get("repeat_penalty").and_then(|v| v.as_f64()) {
            cfg.sampling.repeat_penalty = n as f32;
        }
        if let Some(n) = m.get("repeat_last_n").and_then(|v| v.as_u64()) {
            cfg.sampling.repeat_last_n = n as usize;
        }
        if let Some(n) = m.get("context_erase").and_then(|v| v.as_f64()) {
            cfg.context_erase = Some(n as f32);
        }
        if let Some(n) = m.get("seed").and_then(|v| v.as_u64()) {
            cfg.seed = Some(n);
        }

        cfg
    }

    /// Environment settings fill in what the config leaves at its defaults.
    pub fn with_env(mut self, env: &EnvConfig) -> Self {
        if self.seed.is_none() {
            self.seed = env.seed;
        }
        if let Some(n) = env.max_tokens {
            if self.max_tokens == Self::default().max_tokens {
                self.max_tokens = n;
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()?;
        if self.n_batch == 0 {
            return Err(Error::Config("n_batch must be at least 1".into()));
        }
        if let Some(f) = self.context_erase {
            if !(f > 0.0 && f < 1.0) {
                return Err(Error::Config(format!("context_erase {} outside (0, 1)", f)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndToken,
    MaxTokens,
    ContextFull,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub recycled: usize,
    pub stop_reason: Option<StopReason>,
}

/// Lazy sequence of text fragments. Each `next` samples one token, evaluates it
/// and yields its text; bytes of a character split across tokens are held back
/// until the character is complete.
pub struct Generation<'a> {
    backend: &'a mut dyn Backend,
    ctx: &'a mut PromptContext,
    max_tokens: usize,
    generated: Vec<TokenId>,
    pending: Vec<u8>,
    stats: GenerationStats,
    done: bool,
}

/// Tokenize `prompt`, evaluate it on top of whatever `ctx` already holds and
/// return the generation that continues from it.
pub fn generate<'a>(
    backend: &'a mut dyn Backend,
    ctx: &'a mut PromptContext,
    prompt: &str,
    config: &GenerationConfig,
) -> Result<Generation<'a>> {
    prepare(backend, ctx, config)?;
    if let Some(seed) = config.seed {
        backend.set_seed(seed);
    }

    let tokens = backend.tokenize(ctx, prompt)?;
    if tokens.is_empty() && ctx.n_past == 0 {
        return Err(Error::Config("prompt produced no tokens".into()));
    }
    if ctx.n_past + tokens.len() > ctx.n_ctx && ctx.context_erase.is_none() {
        return Err(Error::ContextOverflow {
            n_past: ctx.n_past,
            requested: tokens.len(),
            n_ctx: ctx.n_ctx,
        });
    }

    info!(prompt_tokens = tokens.len(), n_past = ctx.n_past, "generation started");

    let mut recycled = 0;
    let n_batch = ctx.n_batch;
    for chunk in tokens.chunks(n_batch) {
        if ctx.n_past + chunk.len() > ctx.n_ctx {
            recycled += recycle(backend, ctx, chunk.len())?;
        }
        backend.eval_tokens(ctx, chunk)?;
    }

    let mut generation = Generation::new(backend, ctx, config.max_tokens);
    generation.stats.prompt_tokens = tokens.len();
    generation.stats.recycled = recycled;
    Ok(generation)
}

fn prepare(backend: &dyn Backend, ctx: &mut PromptContext, config: &GenerationConfig) -> Result<()> {
    if !backend.is_model_loaded() {
        return Err(Error::NotLoaded);
    }
    config.validate()?;

    ctx.n_ctx = backend.context_length();
    ctx.n_batch = config.n_batch;
    ctx.sampling = config.sampling;
    ctx.context_erase = config.context_erase;
    Ok(())
}

/// Drop the oldest part of the history so `incoming` more tokens fit, then
/// rebuild the backend state from what is kept. Returns the number dropped.
fn recycle(backend: &mut dyn Backend, ctx: &mut PromptContext, incoming: usize) -> Result<usize> {
    let fraction = ctx.context_erase.ok_or(Error::ContextOverflow {
        n_past: ctx.n_past,
        requested: incoming,
        n_ctx: ctx.n_ctx,
    })?;
    if incoming > ctx.n_ctx {
        return Err(Error::ContextOverflow {
            n_past: 0,
            requested: incoming,
            n_ctx: ctx.n_ctx,
        });
    }

    let by_fraction = (ctx.n_past as f32 * fraction).ceil() as usize;
    let needed = (ctx.n_past + incoming).saturating_sub(ctx.n_ctx);
    let drop = by_fraction.max(needed).min(ctx.n_past);

    let kept = ctx.tokens[drop..].to_vec();
    info!(dropped = drop, kept = kept.len(), "context full, recycling");

    backend.reset_state()?;
    ctx.clear();
    for chunk in kept.chunks(ctx.n_batch.max(1)) {
        backend.eval_tokens(ctx, chunk)?;
    }
    Ok(drop)
}

impl<'a> Generation<'a> {
    fn new(backend: &'a mut dyn Backend, ctx: &'a mut PromptContext, max_tokens: usize) -> Self {
        let max_tokens = if ctx.context_erase.is_some() {
            max_tokens
        } else {
            max_tokens.min(ctx.remaining())
        };
        Self {
            backend,
            ctx,
            max_tokens,
            generated: Vec::new(),
            pending: Vec::new(),
            stats: GenerationStats::default(),
            done: false,
        }
    }

    /// Continue from state already in the backend, typically after [`resume`].
    /// The prompt is not re-evaluated and the seed in `config` is not applied,
    /// so a restored generator picks up exactly where it was captured.
    pub fn resume(
        backend: &'a mut dyn Backend,
        ctx: &'a mut PromptContext,
        config: &GenerationConfig,
    ) -> Result<Self> {
        prepare(backend, ctx, config)?;
        if ctx.n_past != backend.evaluated_tokens().len() {
            return Err(Error::Config(format!(
                "context at position {} but backend holds {} tokens",
                ctx.n_past,
                backend.evaluated_tokens().len()
            )));
        }
        Ok(Self::new(backend, ctx, config.max_tokens))
    }

    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    /// Tokens sampled so far, excluding any end token.
    pub fn generated_tokens(&self) -> &[TokenId] {
        &self.generated
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn finish(&mut self, reason: StopReason) -> Option<Result<String>> {
        self.done = true;
        self.stats.stop_reason = Some(reason);
        info!(
            generated = self.stats.generated_tokens,
            reason = ?reason,
            "generation finished"
        );

        if self.pending.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(Ok(tail))
    }

    fn fail(&mut self, err: Error) -> Option<Result<String>> {
        warn!(error = %err, "generation stopped by error");
        self.done = true;
        self.stats.stop_reason = Some(StopReason::Error);
        Some(Err(err))
    }

    fn step(&mut self) -> Result<Option<TokenId>> {
        let token = self.backend.sample_token(self.ctx)?;
        if self.backend.end_tokens().contains(&token) {
            return Ok(None);
        }

        if self.ctx.remaining() == 0 {
            self.stats.recycled += recycle(self.backend, self.ctx, 1)?;
        }
        self.backend.eval_tokens(self.ctx, &[token])?;
        Ok(Some(token))
    }
}

impl Iterator for Generation<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.stats.generated_tokens >= self.max_tokens {
                let reason = if self.ctx.remaining() == 0 {
                    StopReason::ContextFull
                } else {
                    StopReason::MaxTokens
                };
                return self.finish(reason);
            }

            let token = match self.step() {
                Ok(Some(token)) => token,
                Ok(None) => return self.finish(StopReason::EndToken),
                Err(e) => return self.fail(e),
            };

            self.generated.push(token);
            self.stats.generated_tokens += 1;
            self.pending.extend(self.backend.token_bytes(token));

            let text = drain_utf8(&mut self.pending);
            if !text.is_empty() {
                return Some(Ok(text));
            }
            debug!(token = token.0, "holding partial character");
        }
    }
}

impl FusedIterator for Generation<'_> {}

/// Take the longest decodable prefix of `pending`, replacing invalid bytes the
/// way `String::from_utf8_lossy` does. An incomplete trailing sequence stays.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(n) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + n);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// Snapshot the backend's evaluation state into a fresh buffer.
pub fn capture(backend: &dyn Backend) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; backend.state_size()];
    let n = backend.save_state(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Restore a snapshot and bring `ctx` in line with it.
pub fn resume(backend: &mut dyn Backend, ctx: &mut PromptContext, buf: &[u8]) -> Result<()> {
    backend.restore_state(buf)?;
    ctx.n_ctx = backend.context_length();
    ctx.sync_tokens(backend.evaluated_tokens());
    Ok(())
}
