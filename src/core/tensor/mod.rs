pub mod ops;

pub use ops::TensorOps;

/// Element type a tensor was stored as on disk. In memory every tensor is f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn bytes_per_element(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self { dims }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty() || self.dims.iter().all(|&d| d == 0)
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Dense row-major f32 tensor. Dimensions follow the ggml convention:
/// `dims[0]` is the contiguous (row) length, so a `[n_in, n_out]` weight holds
/// `n_out` rows of `n_in` values.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
    source: DType,
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.numel());
        Self {
            data,
            shape,
            source: DType::F32,
        }
    }

    pub fn with_source(mut self, source: DType) -> Self {
        self.source = source;
        self
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn source_dtype(&self) -> DType {
        self.source
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Length of one row (`dims[0]`).
    pub fn row_len(&self) -> usize {
        self.shape.dims().first().copied().unwrap_or(0)
    }

    pub fn rows(&self) -> usize {
        match self.row_len() {
            0 => 0,
            n => self.numel() / n,
        }
    }

    pub fn size_in_bytes(&self) -> u64 {
        (self.data.len() as u64) * 4
    }
}
