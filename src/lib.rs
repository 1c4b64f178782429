pub mod core;
pub mod infra;
pub mod app;
pub mod sample;
pub mod envconfig;
pub mod error;
pub mod rng;

pub use error::{Error, Result};
pub use rng::SeededRng;

pub use crate::core::{
    Backend, BackendRegistry, Hyperparameters, MemoryUsage, PromptContext, StarcoderBackend,
    TokenId, select_backend,
};

pub use crate::infra::{GgufFile, GgufParser, GgufWriter, ModelHeader, WeightStore};

pub use crate::app::{capture, generate, resume, Generation, GenerationConfig, GenerationStats, StopReason};

pub use sample::SamplingParams;
pub use envconfig::EnvConfig;
