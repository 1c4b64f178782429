//! StarCoder / GPT-BigCode backend.

pub mod forward;
pub mod weights;

use self::forward::Scratch;
use self::weights::StarcoderWeights;
use crate::core::cache::{CausalKVCache, KVCache};
use crate::core::model::{Backend, Hyperparameters, MemoryUsage, PromptContext, TokenId};
use crate::core::state::{self, StateShape, StateView};
use crate::core::tokenizer::{create_tokenizer, TokenType, Tokenizer, TokenizerKind, Vocabulary};
use crate::error::{try_alloc_f32, Error, Result};
use crate::infra::gguf::{GgufFile, GgufMetadata, GgufParser};
use crate::infra::weights::WeightStore;
use crate::rng::SeededRng;
use crate::sample::Sampler;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const ARCHITECTURE: &str = "starcoder";

/// Read-only part of a loaded model; shareable between backends.
pub struct StarcoderModel {
    hparams: Hyperparameters,
    shape: StateShape,
    weights: StarcoderWeights,
    tokenizer: Box<dyn Tokenizer>,
    end_tokens: Vec<TokenId>,
    weight_bytes: u64,
    mapped_bytes: u64,
    table_bytes: u64,
}

struct EvalState {
    cache: CausalKVCache,
    tokens: Vec<TokenId>,
    logits: Vec<f32>,
    has_logits: bool,
    scratch: Scratch,
}

impl EvalState {
    fn new(hp: &Hyperparameters) -> Result<Self> {
        Ok(Self {
            cache: CausalKVCache::new(hp.n_layer, hp.kv_dim(), hp.n_ctx)?,
            tokens: Vec::with_capacity(hp.n_ctx),
            logits: try_alloc_f32(hp.n_vocab)?,
            has_logits: false,
            scratch: Scratch::new(hp)?,
        })
    }

    fn kv_bytes(hp: &Hyperparameters) -> u64 {
        CausalKVCache::allocation_bytes(hp.n_layer, hp.kv_dim(), hp.n_ctx)
    }

    /// Everything besides the cache: scratch, logits and the token history.
    fn working_bytes(hp: &Hyperparameters) -> u64 {
        Scratch::bytes(hp) + hp.n_vocab as u64 * 4 + hp.n_ctx as u64 * 4
    }

    fn position(&self) -> usize {
        self.tokens.len()
    }

    fn truncate(&mut self, len: usize) {
        if len < self.tokens.len() {
            self.tokens.truncate(len);
            self.cache.commit(len);
            self.has_logits = false;
        }
    }

    fn clear(&mut self) {
        self.tokens.clear();
        self.cache.clear();
        self.has_logits = false;
    }
}

pub struct StarcoderBackend {
    model: Option<Arc<StarcoderModel>>,
    state: Option<Box<EvalState>>,
    rng: SeededRng,
    n_threads: usize,
    pool: Option<rayon::ThreadPool>,
}

impl StarcoderBackend {
    pub fn new() -> Self {
        let n_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            model: None,
            state: None,
            rng: SeededRng::from_entropy(),
            n_threads,
            pool: None,
        }
    }

    /// Architecture names stored in `general.architecture` this backend reads.
    pub fn accepts(architecture: Option<&str>) -> bool {
        matches!(architecture, Some("starcoder" | "gpt_bigcode" | "bigcode"))
    }

    /// A second backend over the same weights with its own evaluation state.
    pub fn with_shared_weights(other: &StarcoderBackend) -> Result<Self> {
        let model = other.model.clone().ok_or(Error::NotLoaded)?;
        let state = EvalState::new(&model.hparams)?;
        Ok(Self {
            model: Some(model),
            state: Some(Box::new(state)),
            rng: SeededRng::from_entropy(),
            n_threads: other.n_threads,
            pool: None,
        })
    }

    pub fn shares_weights_with(&self, other: &StarcoderBackend) -> bool {
        match (&self.model, &other.model) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn read_header(path: &Path) -> Result<(GgufFile, Hyperparameters)> {
        let gguf = GgufParser::parse(path)?;
        let arch = gguf.metadata.architecture().map(str::to_string);
        if !Self::accepts(arch.as_deref()) {
            return Err(Error::format(format!(
                "{} is not a starcoder model (architecture {:?})",
                path.display(),
                arch
            )));
        }

        let prefix = arch.as_deref().unwrap_or(ARCHITECTURE);
        let mut hparams = Hyperparameters::from_gguf(&gguf.metadata, prefix)?;
        hparams.architecture = ARCHITECTURE.to_string();
        Ok((gguf, hparams))
    }

    fn load_tokenizer(metadata: &GgufMetadata, hp: &Hyperparameters) -> Result<Box<dyn Tokenizer>> {
        let kind = TokenizerKind::from_model_name(metadata.string("tokenizer.ggml.model").unwrap_or("gpt2"))?;

        let tokens = metadata.strings("tokenizer.ggml.tokens");
        if tokens.len() != hp.n_vocab {
            return Err(Error::format(format!(
                "vocabulary has {} tokens, model expects {}",
                tokens.len(),
                hp.n_vocab
            )));
        }

        let types = metadata
            .ints("tokenizer.ggml.token_type")
            .into_iter()
            .map(TokenType::from)
            .collect();
        let mut vocab = Vocabulary::new(tokens)
            .with_types(types)
            .with_merges(metadata.strings("tokenizer.ggml.merges"));

        if let Some(id) = Self::special_id(metadata, "tokenizer.ggml.bos_token_id", hp)? {
            vocab.bos_token = id;
        }
        if let Some(id) = Self::special_id(metadata, "tokenizer.ggml.eos_token_id", hp)? {
            vocab.eos_token = id;
        }

        Ok(create_tokenizer(kind, vocab))
    }

    fn special_id(metadata: &GgufMetadata, key: &str, hp: &Hyperparameters) -> Result<Option<TokenId>> {
        let Some(raw) = metadata.uint(key) else {
            return Ok(None);
        };
        i32::try_from(raw)
            .ok()
            .map(TokenId)
            .filter(|id| id.index().is_some_and(|i| i < hp.n_vocab))
            .map(Some)
            .ok_or_else(|| Error::format(format!("{} = {} outside vocabulary of {}", key, raw, hp.n_vocab)))
    }

    /// Heap held by the parsed header and the tokenizer tables built from it.
    fn table_bytes(gguf: &GgufFile) -> u64 {
        let (n_tokens, token_text) = gguf.metadata.string_stats("tokenizer.ggml.tokens");
        let (n_merges, merge_text) = gguf.metadata.string_stats("tokenizer.ggml.merges");
        gguf.heap_bound()
            .saturating_add(Vocabulary::heap_bound(n_tokens, token_text, n_merges, merge_text))
    }

    fn find_end_tokens(metadata: &GgufMetadata, tokenizer: &dyn Tokenizer) -> Vec<TokenId> {
        if metadata.uint("tokenizer.ggml.eos_token_id").is_some() {
            return vec![tokenizer.eos_token()];
        }
        ["<|endoftext|>", "</s>"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t))
            .into_iter()
            .collect()
    }

    fn ensure_pool(&mut self) -> Result<()> {
        if self.pool.is_none() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.n_threads)
                .thread_name(|i| format!("starcoder-{}", i))
                .build()
                .map_err(|e| Error::Config(format!("thread pool: {}", e)))?;
            self.pool = Some(pool);
        }
        Ok(())
    }

    fn loaded(&self) -> Result<(&StarcoderModel, &EvalState)> {
        match (&self.model, &self.state) {
            (Some(model), Some(state)) => Ok((model.as_ref(), state.as_ref())),
            _ => Err(Error::NotLoaded),
        }
    }
}

impl Default for StarcoderBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for StarcoderBackend {
    fn architecture(&self) -> &str {
        ARCHITECTURE
    }

    fn load_model(&mut self, path: &Path) -> Result<()> {
        self.unload();

        let (gguf, hparams) = Self::read_header(path)?;
        let table_bytes = Self::table_bytes(&gguf);
        let tokenizer = Self::load_tokenizer(&gguf.metadata, &hparams)?;
        let end_tokens = Self::find_end_tokens(&gguf.metadata, tokenizer.as_ref());

        let store = WeightStore::load(path, &gguf)?;
        let weight_bytes = store.resident_bytes();
        let mapped_bytes = store.mapped_bytes();
        let weights = StarcoderWeights::from_store(store, &hparams)?;
        let state = EvalState::new(&hparams)?;

        info!(
            n_layer = hparams.n_layer,
            n_embd = hparams.n_embd,
            n_ctx = hparams.n_ctx,
            n_vocab = hparams.n_vocab,
            tied_output = weights.is_tied(),
            "loaded starcoder model from {}",
            path.display()
        );

        self.model = Some(Arc::new(StarcoderModel {
            shape: StateShape::from_hparams(&hparams),
            hparams,
            weights,
            tokenizer,
            end_tokens,
            weight_bytes,
            mapped_bytes,
            table_bytes,
        }));
        self.state = Some(Box::new(state));
        Ok(())
    }

    fn is_model_loaded(&self) -> bool {
        self.model.is_some()
    }

    fn unload(&mut self) {
        if self.model.take().is_some() {
            debug!("starcoder model unloaded");
        }
        self.state = None;
    }

    fn required_memory(&self, path: &Path) -> Result<u64> {
        let (gguf, hparams) = Self::read_header(path)?;
        let file_len = std::fs::metadata(path)?.len();
        Ok(WeightStore::required_bytes(&gguf, file_len)
            .saturating_add(Self::table_bytes(&gguf))
            .saturating_add(EvalState::kv_bytes(&hparams))
            .saturating_add(EvalState::working_bytes(&hparams)))
    }

    fn tokenize(&self, _ctx: &PromptContext, text: &str) -> Result<Vec<TokenId>> {
        let (model, _) = self.loaded()?;
        Ok(model.tokenizer.encode(text))
    }

    fn token_to_string(&self, token: TokenId) -> String {
        String::from_utf8_lossy(&self.token_bytes(token)).into_owned()
    }

    fn token_bytes(&self, token: TokenId) -> Vec<u8> {
        self.model
            .as_ref()
            .map(|m| m.tokenizer.token_bytes(token))
            .unwrap_or_default()
    }

    fn eval_tokens(&mut self, ctx: &mut PromptContext, tokens: &[TokenId]) -> Result<()> {
        self.loaded()?;
        if tokens.is_empty() {
            return Ok(());
        }
        self.ensure_pool()?;

        let Self { model, state, pool, .. } = self;
        let (model, st) = match (model.as_ref(), state.as_mut()) {
            (Some(m), Some(s)) => (Arc::clone(m), s),
            _ => return Err(Error::NotLoaded),
        };
        let hp = &model.hparams;

        if ctx.n_past > st.position() {
            return Err(Error::Config(format!(
                "context is at position {} but only {} tokens were evaluated",
                ctx.n_past,
                st.position()
            )));
        }
        if ctx.n_past + tokens.len() > hp.n_ctx {
            return Err(Error::ContextOverflow {
                n_past: ctx.n_past,
                requested: tokens.len(),
                n_ctx: hp.n_ctx,
            });
        }
        if let Some(bad) = tokens.iter().find(|t| t.index().map_or(true, |i| i >= hp.n_vocab)) {
            return Err(Error::Config(format!("token {} outside vocabulary of {}", bad, hp.n_vocab)));
        }

        // A context behind the evaluated history rewinds it.
        st.truncate(ctx.n_past);
        let start = ctx.n_past;

        let pool = pool.as_ref().ok_or_else(|| Error::Config("thread pool missing".into()))?;
        let result = pool.install(|| -> Result<()> {
            for (i, &token) in tokens.iter().enumerate() {
                forward::eval_token(hp, &model.weights, &mut st.cache, &mut st.scratch, token, start + i)?;
                st.cache.commit(start + i + 1);
            }
            forward::project_logits(hp, &model.weights, &mut st.scratch)
        });

        if let Err(e) = result {
            st.cache.commit(start);
            return Err(e);
        }

        std::mem::swap(&mut st.logits, &mut st.scratch.logits);
        st.has_logits = true;
        st.tokens.extend_from_slice(tokens);

        ctx.tokens.truncate(start);
        ctx.tokens.extend_from_slice(tokens);
        ctx.n_past = st.position();
        Ok(())
    }

    fn sample_token(&mut self, ctx: &PromptContext) -> Result<TokenId> {
        let st = match (&self.model, &self.state) {
            (Some(_), Some(st)) => st,
            _ => return Err(Error::NotLoaded),
        };
        if !st.has_logits {
            return Err(Error::NotReady);
        }
        Sampler::new(&ctx.sampling).sample(&st.logits, ctx.repeat_window(), &mut self.rng)
    }

    fn context_length(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.hparams.n_ctx)
    }

    fn end_tokens(&self) -> &[TokenId] {
        self.model.as_ref().map(|m| m.end_tokens.as_slice()).unwrap_or(&[])
    }

    fn state_size(&self) -> usize {
        match self.loaded() {
            Ok((model, st)) => {
                let n_logits = if st.has_logits { model.hparams.n_vocab } else { 0 };
                model.shape.encoded_len(st.position(), n_logits)
            }
            Err(_) => 0,
        }
    }

    fn save_state(&self, buf: &mut [u8]) -> Result<usize> {
        let (model, st) = self.loaded()?;
        let n_logits = if st.has_logits { st.logits.len() } else { 0 };
        let view = StateView {
            rng_state: self.rng.state(),
            tokens: &st.tokens,
            logits: &st.logits[..n_logits],
            cache: &st.cache,
        };
        let written = state::encode(&model.shape, &view, buf)?;
        debug!(n_past = st.position(), bytes = written, "state saved");
        Ok(written)
    }

    fn restore_state(&mut self, buf: &[u8]) -> Result<usize> {
        let (model, _) = self.loaded()?;
        let (snapshot, used) = state::decode(&model.shape, buf)?;
        let n_layer = model.hparams.n_layer;

        let st = self.state.as_mut().ok_or(Error::NotLoaded)?;
        for layer in 0..n_layer {
            st.cache.load_prefix(layer, &snapshot.keys[layer], &snapshot.values[layer])?;
        }
        st.cache.commit(snapshot.tokens.len());
        st.tokens = snapshot.tokens;
        st.has_logits = !snapshot.logits.is_empty();
        if st.has_logits {
            st.logits.copy_from_slice(&snapshot.logits);
        }
        self.rng.set_state(snapshot.rng_state);

        debug!(n_past = st.position(), bytes = used, "state restored");
        Ok(used)
    }

    fn set_thread_count(&mut self, n: usize) {
        let n = n.max(1);
        if n != self.n_threads {
            self.n_threads = n;
            self.pool = None;
        }
    }

    fn thread_count(&self) -> usize {
        self.n_threads
    }

    fn reset_state(&mut self) -> Result<()> {
        let st = self.state.as_mut().ok_or(Error::NotLoaded)?;
        st.clear();
        Ok(())
    }

    fn evaluated_tokens(&self) -> &[TokenId] {
        self.state.as_ref().map(|st| st.tokens.as_slice()).unwrap_or(&[])
    }

    fn hyperparameters(&self) -> Option<&Hyperparameters> {
        self.model.as_ref().map(|m| &m.hparams)
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = SeededRng::new(seed);
    }

    fn memory_usage(&self) -> MemoryUsage {
        match &self.model {
            Some(model) => MemoryUsage {
                weights: model.weight_bytes,
                mapped: model.mapped_bytes,
                kv_cache: EvalState::kv_bytes(&model.hparams),
                scratch: EvalState::working_bytes(&model.hparams),
                tables: model.table_bytes,
            },
            None => MemoryUsage::default(),
        }
    }
}
