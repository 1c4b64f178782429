pub mod runner;

pub use runner::{capture, generate, resume, Generation, GenerationConfig, GenerationStats, StopReason};
