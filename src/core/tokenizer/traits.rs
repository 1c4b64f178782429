use crate::core::TokenId;
use crate::error::{Error, Result};

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Concatenated bytes of `tokens`, lossily decoded. Unknown ids contribute nothing.
    fn decode(&self, tokens: &[TokenId]) -> String {
        let bytes: Vec<u8> = tokens.iter().flat_map(|&t| self.token_bytes(t)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Raw bytes a token stands for; empty for ids outside the vocabulary.
    fn token_bytes(&self, id: TokenId) -> Vec<u8>;

    fn vocab_size(&self) -> usize;
    fn bos_token(&self) -> TokenId;
    fn eos_token(&self) -> TokenId;

    fn token_to_id(&self, token: &str) -> Option<TokenId>;
    fn id_to_token(&self, id: TokenId) -> Option<&str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenizerKind {
    /// GPT-2 style byte-level BPE (`tokenizer.ggml.model = "gpt2"`).
    Bpe,
}

impl TokenizerKind {
    pub fn from_model_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "gpt2" | "bpe" | "bytelevelbpe" => Ok(TokenizerKind::Bpe),
            other => Err(Error::format(format!("unsupported tokenizer model '{}'", other))),
        }
    }
}
