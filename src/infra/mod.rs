pub mod gguf;
pub mod weights;

pub use gguf::{GgufFile, GgufParser, GgufWriter, ModelHeader};
pub use weights::WeightStore;
