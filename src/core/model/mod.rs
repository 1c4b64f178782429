pub mod traits;
pub mod config;
pub mod context;
pub mod registry;
pub mod architectures;

pub use traits::Backend;
pub use config::{Hyperparameters, HyperparametersBuilder};
pub use context::PromptContext;
pub use registry::{BackendRegistry, select_backend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub i32);

impl TokenId {
    pub const BOS: Self = Self(1);
    pub const EOS: Self = Self(2);

    pub fn index(&self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bytes held by a loaded backend, as accounted at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub weights: u64,
    pub mapped: u64,
    pub kv_cache: u64,
    pub scratch: u64,
    /// Parsed header metadata and tokenizer tables.
    pub tables: u64,
}

impl MemoryUsage {
    /// Everything counted as live at once, which over-approximates the real peak.
    pub fn peak(&self) -> u64 {
        self.weights + self.mapped + self.kv_cache + self.scratch + self.tables
    }
}
