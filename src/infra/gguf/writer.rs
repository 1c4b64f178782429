use super::{GgmlType, DEFAULT_ALIGNMENT, GGUF_MAGIC};
use crate::error::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{BufWriter, Write};
use std::path::Path;

enum Value {
    U32(u32),
    U64(u64),
    F32(f32),
    Bool(bool),
    Str(String),
    StrArray(Vec<String>),
    I32Array(Vec<i32>),
}

impl Value {
    fn type_id(&self) -> u32 {
        match self {
            Value::U32(_) => 4,
            Value::F32(_) => 6,
            Value::Bool(_) => 7,
            Value::Str(_) => 8,
            Value::StrArray(_) | Value::I32Array(_) => 9,
            Value::U64(_) => 10,
        }
    }
}

struct PendingTensor {
    name: String,
    dims: Vec<u64>,
    dtype: GgmlType,
    data: Vec<u8>,
}

/// Writes GGUF v3 files. Keys and tensors are emitted in insertion order.
pub struct GgufWriter {
    kv: Vec<(String, Value)>,
    tensors: Vec<PendingTensor>,
    alignment: u64,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self {
            kv: Vec::new(),
            tensors: Vec::new(),
            alignment: DEFAULT_ALIGNMENT,
        }
    }

    pub fn add_u32(&mut self, key: &str, value: u32) -> &mut Self {
        self.kv.push((key.to_string(), Value::U32(value)));
        self
    }

    pub fn add_u64(&mut self, key: &str, value: u64) -> &mut Self {
        self.kv.push((key.to_string(), Value::U64(value)));
        self
    }

    pub fn add_f32(&mut self, key: &str, value: f32) -> &mut Self {
        self.kv.push((key.to_string(), Value::F32(value)));
        self
    }

    pub fn add_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.kv.push((key.to_string(), Value::Bool(value)));
        self
    }

    pub fn add_string(&mut self, key: &str, value: &str) -> &mut Self {
        self.kv.push((key.to_string(), Value::Str(value.to_string())));
        self
    }

    pub fn add_string_array<S: AsRef<str>>(&mut self, key: &str, values: &[S]) -> &mut Self {
        let values = values.iter().map(|s| s.as_ref().to_string()).collect();
        self.kv.push((key.to_string(), Value::StrArray(values)));
        self
    }

    pub fn add_i32_array(&mut self, key: &str, values: &[i32]) -> &mut Self {
        self.kv.push((key.to_string(), Value::I32Array(values.to_vec())));
        self
    }

    /// `dims` in ggml order: row length first.
    pub fn add_tensor_f32(&mut self, name: &str, dims: &[u64], values: &[f32]) -> &mut Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for &v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        self.add_tensor_raw(name, dims, GgmlType::F32, data)
    }

    pub fn add_tensor_f16(&mut self, name: &str, dims: &[u64], values: &[f32]) -> &mut Self {
        let mut data = Vec::with_capacity(values.len() * 2);
        for &v in values {
            data.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
        }
        self.add_tensor_raw(name, dims, GgmlType::F16, data)
    }

    pub fn add_tensor_raw(&mut self, name: &str, dims: &[u64], dtype: GgmlType, data: Vec<u8>) -> &mut Self {
        self.tensors.push(PendingTensor {
            name: name.to_string(),
            dims: dims.to_vec(),
            dtype,
            data,
        });
        self
    }

    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(std::fs::File::create(path)?);
        self.write(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut header = Vec::new();
        header.write_u32::<LittleEndian>(GGUF_MAGIC)?;
        header.write_u32::<LittleEndian>(3)?;
        header.write_u64::<LittleEndian>(self.tensors.len() as u64)?;
        header.write_u64::<LittleEndian>(self.kv.len() as u64)?;

        for (key, value) in &self.kv {
            write_string(&mut header, key)?;
            header.write_u32::<LittleEndian>(value.type_id())?;
            write_value(&mut header, value)?;
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            write_string(&mut header, &tensor.name)?;
            header.write_u32::<LittleEndian>(tensor.dims.len() as u32)?;
            for &d in &tensor.dims {
                header.write_u64::<LittleEndian>(d)?;
            }
            header.write_u32::<LittleEndian>(tensor.dtype.id())?;
            header.write_u64::<LittleEndian>(offset)?;
            offsets.push(offset);
            offset = align(offset + tensor.data.len() as u64, self.alignment);
        }

        let padded = align(header.len() as u64, self.alignment) as usize;
        header.resize(padded, 0);
        out.write_all(&header)?;

        let mut written = 0u64;
        for (tensor, &start) in self.tensors.iter().zip(&offsets) {
            out.write_all(&vec![0u8; (start - written) as usize])?;
            out.write_all(&tensor.data)?;
            written = start + tensor.data.len() as u64;
        }

        Ok(())
    }
}

impl Default for GgufWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn align(n: u64, alignment: u64) -> u64 {
    n.div_ceil(alignment) * alignment
}

fn write_string<W: Write>(out: &mut W, s: &str) -> Result<()> {
    out.write_u64::<LittleEndian>(s.len() as u64)?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn write_value<W: Write>(out: &mut W, value: &Value) -> Result<()> {
    match value {
        Value::U32(v) => out.write_u32::<LittleEndian>(*v)?,
        Value::U64(v) => out.write_u64::<LittleEndian>(*v)?,
        Value::F32(v) => out.write_f32::<LittleEndian>(*v)?,
        Value::Bool(v) => out.write_u8(u8::from(*v))?,
        Value::Str(s) => write_string(out, s)?,
        Value::StrArray(items) => {
            out.write_u32::<LittleEndian>(8)?;
            out.write_u64::<LittleEndian>(items.len() as u64)?;
            for s in items {
                write_string(out, s)?;
            }
        }
        Value::I32Array(items) => {
            out.write_u32::<LittleEndian>(5)?;
            out.write_u64::<LittleEndian>(items.len() as u64)?;
            for &v in items {
                out.write_i32::<LittleEndian>(v)?;
            }
        }
    }
    Ok(())
}
