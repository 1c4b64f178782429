pub mod traits;
pub mod bpe;

pub use traits::{Tokenizer, TokenizerKind};
pub use bpe::BpeTokenizer;

use crate::core::TokenId;
use std::collections::HashMap;

/// Fixed per-entry cost of a token or merge across the vocabulary, its index,
/// the special-token list and the copies taken from the header.
const TABLE_ENTRY_BYTES: u64 = 320;

pub fn create_tokenizer(kind: TokenizerKind, vocab: Vocabulary) -> Box<dyn Tokenizer> {
    match kind {
        TokenizerKind::Bpe => Box::new(BpeTokenizer::new(vocab)),
    }
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub tokens: Vec<String>,
    pub types: Vec<TokenType>,
    pub merges: Vec<String>,
    pub bos_token: TokenId,
    pub eos_token: TokenId,
    index: HashMap<String, TokenId>,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>) -> Self {
        let len = tokens.len();
        let index = tokens.iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), TokenId(i as i32)))
            .collect();
        Self {
            tokens,
            types: vec![TokenType::Normal; len],
            merges: Vec::new(),
            bos_token: TokenId::BOS,
            eos_token: TokenId::EOS,
            index,
        }
    }

    pub fn with_types(mut self, types: Vec<TokenType>) -> Self {
        self.types = types;
        self.types.resize(self.tokens.len(), TokenType::Normal);
        self
    }

    pub fn with_merges(mut self, merges: Vec<String>) -> Self {
        self.merges = merges;
        self
    }

    /// Upper bound on the heap a tokenizer built from `n_tokens` tokens and
    /// `n_merges` merges holds, given the total text length of each.
    pub fn heap_bound(n_tokens: u64, token_text: u64, n_merges: u64, merge_text: u64) -> u64 {
        let tokens = n_tokens.saturating_mul(TABLE_ENTRY_BYTES).saturating_add(token_text.saturating_mul(3));
        let merges = n_merges.saturating_mul(TABLE_ENTRY_BYTES).saturating_add(merge_text.saturating_mul(2));
        tokens.saturating_add(merges)
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        usize::try_from(id.0).ok()
            .and_then(|i| self.tokens.get(i))
            .map(|s| s.as_str())
    }

    pub fn id(&self, token: &str) -> Option<TokenId> {
        self.index.get(token).copied()
    }

    pub fn token_type(&self, id: TokenId) -> TokenType {
        usize::try_from(id.0).ok()
            .and_then(|i| self.types.get(i))
            .copied()
            .unwrap_or(TokenType::Unknown)
    }

    /// Tokens matched literally in input text instead of going through BPE.
    pub fn special_tokens(&self) -> Vec<(String, TokenId)> {
        self.tokens.iter()
            .enumerate()
            .filter(|(i, t)| {
                !t.is_empty() && matches!(self.types.get(*i), Some(TokenType::Control | TokenType::UserDefined))
            })
            .map(|(i, t)| (t.clone(), TokenId(i as i32)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    UserDefined,
    Unused,
    Byte,
}

impl From<i64> for TokenType {
    fn from(v: i64) -> Self {
        // gguf token_type ids
        match v {
            1 => TokenType::Normal,
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            4 => TokenType::UserDefined,
            5 => TokenType::Unused,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }
}

impl TokenType {
    pub fn gguf_id(&self) -> i32 {
        match self {
            TokenType::Normal => 1,
            TokenType::Unknown => 2,
            TokenType::Control => 3,
            TokenType::UserDefined => 4,
            TokenType::Unused => 5,
            TokenType::Byte => 6,
        }
    }
}
