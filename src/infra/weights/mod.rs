//! Weight Store: materializes a GGUF file's tensors as owned f32 tensors.
//!
//! The file is memory-mapped for the duration of the load only. Once loaded
//! the store is immutable and can be shared behind an `Arc`.

use crate::core::tensor::{DType, Shape, Tensor};
use crate::error::{try_alloc_f32, Error, Result};
use crate::infra::gguf::{GgmlType, GgufFile, TensorInfo};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use tracing::debug;

pub struct WeightStore {
    tensors: HashMap<String, Tensor>,
    resident_bytes: u64,
    mapped_bytes: u64,
}

impl WeightStore {
    pub fn load<P: AsRef<Path>>(path: P, gguf: &GgufFile) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the map is read-only and dropped before this function returns;
        // every slice taken from it is bounds-checked against its length.
        let mmap = unsafe { Mmap::map(&file)? };
        let mapped_bytes = mmap.len() as u64;

        let mut tensors = HashMap::with_capacity(gguf.tensors.len());
        let mut resident_bytes = 0u64;

        for info in &gguf.tensors {
            let raw = Self::tensor_slice(&mmap, gguf.data_offset, info)?;
            let tensor = Self::dequantize(info, raw)?;
            resident_bytes += tensor.size_in_bytes();
            tensors.insert(info.name.clone(), tensor);
        }

        debug!(
            tensors = tensors.len(),
            resident_bytes,
            mapped_bytes,
            "weights loaded from {}",
            path.as_ref().display()
        );

        Ok(Self {
            tensors,
            resident_bytes,
            mapped_bytes,
        })
    }

    /// Upper bound on what `load` holds at once: the mapped file plus the f32 copies.
    pub fn required_bytes(gguf: &GgufFile, file_len: u64) -> u64 {
        file_len.saturating_add(gguf.tensor_elements().saturating_mul(4))
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::format(format!("missing tensor '{}'", name)))
    }

    pub fn try_get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Move a tensor out of the store.
    pub fn take(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .remove(name)
            .ok_or_else(|| Error::format(format!("missing tensor '{}'", name)))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_bytes
    }

    fn tensor_slice<'a>(mmap: &'a Mmap, data_offset: u64, info: &TensorInfo) -> Result<&'a [u8]> {
        let start = data_offset
            .checked_add(info.offset)
            .ok_or_else(|| Error::format(format!("tensor '{}' offset overflows", info.name)))?;
        let end = start
            .checked_add(info.size_in_bytes())
            .ok_or_else(|| Error::format(format!("tensor '{}' size overflows", info.name)))?;

        if end > mmap.len() as u64 {
            return Err(Error::format(format!(
                "tensor '{}' data [{}, {}) past end of file ({} bytes)",
                info.name, start, end, mmap.len()
            )));
        }
        Ok(&mmap[start as usize..end as usize])
    }

    fn dequantize(info: &TensorInfo, raw: &[u8]) -> Result<Tensor> {
        let n = info.num_elements() as usize;
        let mut data = try_alloc_f32(n)?;

        let source = match info.dtype {
            GgmlType::F32 => {
                for (dst, chunk) in data.iter_mut().zip(raw.chunks_exact(4)) {
                    *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                DType::F32
            }
            GgmlType::F16 => {
                for (dst, chunk) in data.iter_mut().zip(raw.chunks_exact(2)) {
                    *dst = half::f16::from_le_bytes([chunk[0], chunk[1]]).to_f32();
                }
                DType::F16
            }
            GgmlType::BF16 => {
                for (dst, chunk) in data.iter_mut().zip(raw.chunks_exact(2)) {
                    *dst = half::bf16::from_le_bytes([chunk[0], chunk[1]]).to_f32();
                }
                DType::BF16
            }
            other => {
                return Err(Error::format(format!(
                    "tensor '{}' has unsupported type {:?}", info.name, other
                )));
            }
        };

        let dims = info.dims.iter().map(|&d| d as usize).collect();
        Ok(Tensor::new(data, Shape::new(dims)).with_source(source))
    }
}
