use super::{Backend, TokenId};
use crate::sample::SamplingParams;

/// Per-generation state: the token history a backend has evaluated, and the
/// knobs that steer sampling for it.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub tokens: Vec<TokenId>,
    pub n_past: usize,
    pub n_ctx: usize,
    /// Prompt tokens evaluated per call during ingestion.
    pub n_batch: usize,
    pub sampling: SamplingParams,
    /// Fraction of the history dropped when the context fills up. `None`
    /// stops generation at the context limit instead.
    pub context_erase: Option<f32>,
}

impl PromptContext {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            tokens: Vec::new(),
            n_past: 0,
            n_ctx,
            n_batch: 9,
            sampling: SamplingParams::default(),
            context_erase: None,
        }
    }

    pub fn for_backend(backend: &dyn Backend) -> Self {
        Self::new(backend.context_length())
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch.max(1);
        self
    }

    pub fn remaining(&self) -> usize {
        self.n_ctx.saturating_sub(self.n_past)
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.n_past = 0;
    }

    /// Keep only the first `len` tokens.
    pub fn truncate(&mut self, len: usize) {
        self.tokens.truncate(len);
        self.n_past = self.tokens.len();
    }

    /// Adopt `tokens` as the evaluated history, e.g. after restoring a snapshot.
    pub fn sync_tokens(&mut self, tokens: &[TokenId]) {
        self.tokens.clear();
        self.tokens.extend_from_slice(tokens);
        self.n_past = tokens.len();
    }

    /// The trailing window the repetition penalty looks at.
    pub fn repeat_window(&self) -> &[TokenId] {
        let n = self.sampling.repeat_last_n.min(self.tokens.len());
        &self.tokens[self.tokens.len() - n..]
    }
}
