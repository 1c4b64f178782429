pub mod starcoder;

pub use starcoder::StarcoderBackend;
