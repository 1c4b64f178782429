pub mod model;
pub mod tokenizer;
pub mod cache;
pub mod tensor;
pub mod state;

pub use model::{
    Backend, BackendRegistry, Hyperparameters, MemoryUsage, PromptContext, TokenId,
    select_backend,
};
pub use model::architectures::StarcoderBackend;
pub use tokenizer::{Tokenizer, TokenizerKind, Vocabulary};
pub use cache::{CausalKVCache, KVCache};
pub use tensor::{DType, Shape, Tensor, TensorOps};
pub use state::{StateShape, StateSnapshot};

pub use crate::error::Result;
