use crate::error::{Error, Result};
use crate::infra::gguf::{GgufMetadata, MetadataValue};

/// Largest value accepted for any size hyperparameter.
const MAX_HPARAM: usize = u32::MAX as usize;

/// Architecture hyperparameters read from a model header.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    pub architecture: String,
    pub n_vocab: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_head_kv: usize,
    pub n_layer: usize,
    pub n_ff: usize,
    pub norm_eps: f32,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        // starcoder-1b
        Self {
            architecture: "starcoder".to_string(),
            n_vocab: 49152,
            n_ctx: 8192,
            n_embd: 2048,
            n_head: 16,
            n_head_kv: 1,
            n_layer: 24,
            n_ff: 8192,
            norm_eps: 1e-5,
        }
    }
}

impl Hyperparameters {
    pub fn builder() -> HyperparametersBuilder {
        HyperparametersBuilder::new()
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Width of one key (or value) row in the cache.
    pub fn kv_dim(&self) -> usize {
        self.n_head_kv * self.head_dim()
    }

    pub fn from_gguf(metadata: &GgufMetadata, arch: &str) -> Result<Self> {
        let required = |name: &str| -> Result<usize> {
            let key = format!("{}.{}", arch, name);
            metadata
                .uint(&key)
                .map(|v| v as usize)
                .ok_or_else(|| Error::format(format!("missing hyperparameter '{}'", key)))
        };

        let n_embd = required("embedding_length")?;
        let n_head = required("attention.head_count")?;
        let n_head_kv = metadata
            .uint(&format!("{}.attention.head_count_kv", arch))
            .map(|v| v as usize)
            .unwrap_or(n_head);
        let n_ff = metadata
            .uint(&format!("{}.feed_forward_length", arch))
            .map(|v| v as usize)
            .unwrap_or(n_embd.saturating_mul(4));
        let norm_eps = metadata
            .float(&format!("{}.attention.layer_norm_epsilon", arch))
            .map(|v| v as f32)
            .unwrap_or(1e-5);

        let tokens = metadata
            .get("tokenizer.ggml.tokens")
            .and_then(MetadataValue::as_array)
            .map_or(0, <[MetadataValue]>::len);
        let n_vocab = metadata
            .uint(&format!("{}.vocab_size", arch))
            .map(|v| v as usize)
            .unwrap_or(tokens);

        let hp = Self {
            architecture: arch.to_string(),
            n_vocab,
            n_ctx: required("context_length")?,
            n_embd,
            n_head,
            n_head_kv,
            n_layer: required("block_count")?,
            n_ff,
            norm_eps,
        };
        hp.validate()?;
        Ok(hp)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_vocab", self.n_vocab),
            ("n_ctx", self.n_ctx),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_head_kv", self.n_head_kv),
            ("n_layer", self.n_layer),
            ("n_ff", self.n_ff),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::format(format!("hyperparameter {} is zero", name)));
        }
        if let Some((name, v)) = positive.iter().find(|(_, v)| *v > MAX_HPARAM) {
            return Err(Error::format(format!("hyperparameter {} = {} is too large", name, v)));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(Error::format(format!(
                "embedding width {} not divisible by {} heads", self.n_embd, self.n_head
            )));
        }
        if self.n_head % self.n_head_kv != 0 {
            return Err(Error::format(format!(
                "{} heads not divisible by {} kv heads", self.n_head, self.n_head_kv
            )));
        }
        Ok(())
    }
}

pub struct HyperparametersBuilder {
    hp: Hyperparameters,
}

impl HyperparametersBuilder {
    pub fn new() -> Self {
        Self {
            hp: Hyperparameters::default(),
        }
    }

    pub fn architecture(mut self, arch: impl Into<String>) -> Self {
        self.hp.architecture = arch.into();
        self
    }

    pub fn vocab_size(mut self, n: usize) -> Self {
        self.hp.n_vocab = n;
        self
    }

    pub fn context_length(mut self, n: usize) -> Self {
        self.hp.n_ctx = n;
        self
    }

    pub fn embedding_length(mut self, n: usize) -> Self {
        self.hp.n_embd = n;
        self
    }

    pub fn num_heads(mut self, n: usize) -> Self {
        self.hp.n_head = n;
        self
    }

    pub fn num_kv_heads(mut self, n: usize) -> Self {
        self.hp.n_head_kv = n;
        self
    }

    pub fn num_layers(mut self, n: usize) -> Self {
        self.hp.n_layer = n;
        self
    }

    pub fn feed_forward_length(mut self, n: usize) -> Self {
        self.hp.n_ff = n;
        self
    }

    pub fn norm_eps(mut self, eps: f32) -> Self {
        self.hp.norm_eps = eps;
        self
    }

    pub fn build(self) -> Hyperparameters {
        self.hp
    }
}

impl Default for HyperparametersBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let hp = Hyperparameters::builder()
            .embedding_length(64)
            .num_heads(4)
            .num_kv_heads(1)
            .num_layers(2)
            .context_length(32)
            .build();

        assert_eq!(hp.head_dim(), 16);
        assert_eq!(hp.kv_dim(), 16);
        assert!(hp.validate().is_ok());
    }

    #[test]
    fn test_from_gguf() {
        let mut meta = GgufMetadata::new();
        for (k, v) in [
            ("starcoder.context_length", 16u64),
            ("starcoder.embedding_length", 8),
            ("starcoder.block_count", 2),
            ("starcoder.attention.head_count", 2),
            ("starcoder.attention.head_count_kv", 1),
        ] {
            meta.kv.insert(k.to_string(), MetadataValue::Uint(v));
        }
        meta.kv.insert(
            "tokenizer.ggml.tokens".to_string(),
            MetadataValue::Array(vec![MetadataValue::String("a".into()); 5]),
        );

        let hp = Hyperparameters::from_gguf(&meta, "starcoder").unwrap();
        assert_eq!(hp.n_ctx, 16);
        assert_eq!(hp.n_ff, 32);
        assert_eq!(hp.n_vocab, 5);
        assert_eq!(hp.kv_dim(), 4);
    }

    #[test]
    fn test_missing_key_is_format_mismatch() {
        let meta = GgufMetadata::new();
        assert!(matches!(
            Hyperparameters::from_gguf(&meta, "starcoder"),
            Err(Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_oversized_values_rejected() {
        let mut meta = GgufMetadata::new();
        for (k, v) in [
            ("starcoder.context_length", 1u64 << 40),
            ("starcoder.embedding_length", u64::MAX),
            ("starcoder.block_count", 2),
            ("starcoder.attention.head_count", 1),
            ("starcoder.vocab_size", 3),
        ] {
            meta.kv.insert(k.to_string(), MetadataValue::Uint(v));
        }
        assert!(matches!(
            Hyperparameters::from_gguf(&meta, "starcoder"),
            Err(Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_bad_head_split() {
        let hp = Hyperparameters::builder().embedding_length(10).num_heads(3).build();
        assert!(hp.validate().is_err());
    }
}
