use super::{Hyperparameters, MemoryUsage, PromptContext, TokenId};
use crate::error::Result;
use std::path::Path;

/// Lifecycle and evaluation contract every architecture implements.
///
/// A backend moves from unloaded to loaded through [`Backend::load_model`] and
/// back through [`Backend::unload`] (or drop). Evaluation state lives inside the
/// backend; a [`PromptContext`] mirrors its position and token history.
pub trait Backend: Send {
    /// Architecture name as it appears in `general.architecture`.
    fn architecture(&self) -> &str;

    /// Load weights and vocabulary from `path`, releasing anything loaded before.
    /// On failure the backend is left unloaded.
    fn load_model(&mut self, path: &Path) -> Result<()>;

    fn is_model_loaded(&self) -> bool;

    fn unload(&mut self);

    /// Upper bound on the bytes `load_model(path)` holds at its peak, computed
    /// from the file header alone.
    fn required_memory(&self, path: &Path) -> Result<u64>;

    /// Pure function of `text` and the vocabulary. `ctx` is only read.
    fn tokenize(&self, ctx: &PromptContext, text: &str) -> Result<Vec<TokenId>>;

    /// Text a token stands for; empty for ids outside the vocabulary.
    fn token_to_string(&self, token: TokenId) -> String;

    /// Raw bytes of a token. A multi-byte character may be split across tokens.
    fn token_bytes(&self, token: TokenId) -> Vec<u8> {
        self.token_to_string(token).into_bytes()
    }

    /// Run `tokens` through the network in order, starting at `ctx.n_past`.
    fn eval_tokens(&mut self, ctx: &mut PromptContext, tokens: &[TokenId]) -> Result<()>;

    /// Draw the next token from the logits of the last evaluated token.
    fn sample_token(&mut self, ctx: &PromptContext) -> Result<TokenId>;

    /// Maximum sequence length; 0 while unloaded.
    fn context_length(&self) -> usize;

    fn end_tokens(&self) -> &[TokenId];

    /// Exact byte length `save_state` writes at the current position.
    fn state_size(&self) -> usize;

    /// Serialize the evaluation state into `buf`, returning the bytes written.
    fn save_state(&self, buf: &mut [u8]) -> Result<usize>;

    /// Replace the evaluation state with a snapshot, returning the bytes read.
    /// A rejected snapshot leaves the current state as it was.
    fn restore_state(&mut self, buf: &[u8]) -> Result<usize>;

    fn set_thread_count(&mut self, n: usize);
    fn thread_count(&self) -> usize;

    /// Drop all evaluated tokens, keeping the weights.
    fn reset_state(&mut self) -> Result<()>;

    /// Tokens held in the evaluation state, in order.
    fn evaluated_tokens(&self) -> &[TokenId];

    fn hyperparameters(&self) -> Option<&Hyperparameters>;

    fn set_seed(&mut self, seed: u64);

    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::default()
    }
}
