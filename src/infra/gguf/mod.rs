pub mod writer;

pub use writer::GgufWriter;

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;

pub const GGUF_MAGIC: u32 = 0x46554747;
pub const DEFAULT_ALIGNMENT: u64 = 32;

/// Bytes read from the front of a file when probing its format. Only keys that
/// end inside this prefix are seen, so a file that stores a large array (such
/// as the token list) ahead of `general.architecture` probes without an
/// architecture and no backend claims it. Conventional writers put `general.*`
/// keys first.
pub const HEADER_PROBE_BYTES: usize = 64 * 1024;

/// Parser buffers and small fixed tables allocated alongside a header.
const HEADER_BASE_BYTES: u64 = 1024 * 1024;

const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;
const MAX_ARRAY_LEN: u64 = 64 * 1024 * 1024;
const MAX_DIMS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
    I64,
    F64,
    BF16,
}

impl GgmlType {
    pub fn from_id(id: u32) -> Result<Self> {
        Ok(match id {
            0 => GgmlType::F32,
            1 => GgmlType::F16,
            2 => GgmlType::Q4_0,
            3 => GgmlType::Q4_1,
            6 => GgmlType::Q5_0,
            7 => GgmlType::Q5_1,
            8 => GgmlType::Q8_0,
            9 => GgmlType::Q8_1,
            10 => GgmlType::Q2_K,
            11 => GgmlType::Q3_K,
            12 => GgmlType::Q4_K,
            13 => GgmlType::Q5_K,
            14 => GgmlType::Q6_K,
            15 => GgmlType::Q8_K,
            24 => GgmlType::I8,
            25 => GgmlType::I16,
            26 => GgmlType::I32,
            27 => GgmlType::I64,
            28 => GgmlType::F64,
            30 => GgmlType::BF16,
            _ => return Err(Error::format(format!("unknown ggml type {}", id))),
        })
    }

    pub fn id(&self) -> u32 {
        match self {
            GgmlType::F32 => 0,
            GgmlType::F16 => 1,
            GgmlType::Q4_0 => 2,
            GgmlType::Q4_1 => 3,
            GgmlType::Q5_0 => 6,
            GgmlType::Q5_1 => 7,
            GgmlType::Q8_0 => 8,
            GgmlType::Q8_1 => 9,
            GgmlType::Q2_K => 10,
            GgmlType::Q3_K => 11,
            GgmlType::Q4_K => 12,
            GgmlType::Q5_K => 13,
            GgmlType::Q6_K => 14,
            GgmlType::Q8_K => 15,
            GgmlType::I8 => 24,
            GgmlType::I16 => 25,
            GgmlType::I32 => 26,
            GgmlType::I64 => 27,
            GgmlType::F64 => 28,
            GgmlType::BF16 => 30,
        }
    }

    /// Elements per quantization block.
    pub fn block_size(&self) -> u64 {
        match self {
            GgmlType::Q4_0 | GgmlType::Q4_1 | GgmlType::Q5_0 | GgmlType::Q5_1 |
            GgmlType::Q8_0 | GgmlType::Q8_1 => 32,
            GgmlType::Q2_K | GgmlType::Q3_K | GgmlType::Q4_K |
            GgmlType::Q5_K | GgmlType::Q6_K | GgmlType::Q8_K => 256,
            _ => 1,
        }
    }

    /// Bytes per block.
    pub fn type_size(&self) -> u64 {
        match self {
            GgmlType::F32 | GgmlType::I32 => 4,
            GgmlType::F16 | GgmlType::BF16 | GgmlType::I16 => 2,
            GgmlType::I8 => 1,
            GgmlType::I64 | GgmlType::F64 => 8,
            GgmlType::Q4_0 => 18,
            GgmlType::Q4_1 => 20,
            GgmlType::Q5_0 => 22,
            GgmlType::Q5_1 => 24,
            GgmlType::Q8_0 => 34,
            GgmlType::Q8_1 => 36,
            GgmlType::Q2_K => 84,
            GgmlType::Q3_K => 110,
            GgmlType::Q4_K => 144,
            GgmlType::Q5_K => 176,
            GgmlType::Q6_K => 210,
            GgmlType::Q8_K => 292,
        }
    }

    pub fn bytes_for(&self, elements: u64) -> u64 {
        elements.div_ceil(self.block_size()).saturating_mul(self.type_size())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Uint(u64),
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Array(Vec<MetadataValue>),
}

impl MetadataValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            MetadataValue::Uint(n) => Some(*n),
            MetadataValue::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(n) => Some(*n),
            MetadataValue::Uint(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(n) => Some(*n),
            MetadataValue::Int(n) => Some(*n as f64),
            MetadataValue::Uint(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[MetadataValue]> {
        match self {
            MetadataValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Upper bound on the heap this value holds, its own slot included.
    /// Strings count twice their length and array elements three slots each,
    /// covering the copies and growth made while parsing.
    pub fn heap_bound(&self) -> u64 {
        let slot = std::mem::size_of::<MetadataValue>() as u64;
        match self {
            MetadataValue::String(s) => slot + 2 * s.len() as u64,
            MetadataValue::Array(items) => items
                .iter()
                .fold(slot, |acc, v| acc.saturating_add(v.heap_bound() + 2 * slot)),
            _ => slot,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GgufMetadata {
    pub kv: HashMap<String, MetadataValue>,
}

impl GgufMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.kv.get(key)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    pub fn uint(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(MetadataValue::as_u64)
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(MetadataValue::as_f64)
    }

    pub fn strings(&self, key: &str) -> Vec<String> {
        self.get(key)
            .and_then(MetadataValue::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }

    pub fn ints(&self, key: &str) -> Vec<i64> {
        self.get(key)
            .and_then(MetadataValue::as_array)
            .map(|arr| arr.iter().filter_map(MetadataValue::as_i64).collect())
            .unwrap_or_default()
    }

    /// Count and total byte length of the strings in an array value.
    pub fn string_stats(&self, key: &str) -> (u64, u64) {
        self.get(key)
            .and_then(MetadataValue::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(MetadataValue::as_str)
                    .fold((0, 0), |(n, bytes), s| (n + 1, bytes + s.len() as u64))
            })
            .unwrap_or((0, 0))
    }

    pub fn heap_bound(&self) -> u64 {
        let entry = std::mem::size_of::<(String, MetadataValue)>() as u64;
        self.kv.iter().fold(0u64, |acc, (key, value)| {
            acc.saturating_add(4 * entry + 2 * key.len() as u64 + value.heap_bound())
        })
    }

    pub fn architecture(&self) -> Option<&str> {
        self.string("general.architecture")
    }

    pub fn alignment(&self) -> u64 {
        self.uint("general.alignment")
            .filter(|a| *a > 0 && a.is_power_of_two())
            .unwrap_or(DEFAULT_ALIGNMENT)
    }
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub dtype: GgmlType,
    /// Offset relative to the start of the tensor data section.
    pub offset: u64,
}

impl TensorInfo {
    /// Saturates instead of overflowing; parsed headers never reach the limit.
    pub fn num_elements(&self) -> u64 {
        self.dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d))
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.dtype.bytes_for(self.num_elements())
    }
}

#[derive(Debug)]
pub struct GgufFile {
    pub version: u32,
    pub metadata: GgufMetadata,
    pub tensors: Vec<TensorInfo>,
    /// Absolute file offset where tensor data begins.
    pub data_offset: u64,
}

impl GgufFile {
    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Upper bound on the heap held by the parsed header, including the
    /// per-tensor bookkeeping the weight store keeps by name.
    pub fn heap_bound(&self) -> u64 {
        let info = std::mem::size_of::<TensorInfo>() as u64;
        self.tensors
            .iter()
            .fold(HEADER_BASE_BYTES + self.metadata.heap_bound(), |acc, t| {
                acc.saturating_add(8 * info + 4 * t.name.len() as u64 + 8 * t.dims.len() as u64)
            })
    }

    pub fn tensor_elements(&self) -> u64 {
        self.tensors
            .iter()
            .fold(0u64, |acc, t| acc.saturating_add(t.num_elements()))
    }
}

/// Just enough of a file's front matter to decide which backend owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHeader {
    pub magic: u32,
    pub version: u32,
    pub architecture: Option<String>,
}

impl ModelHeader {
    /// Reads at most [`HEADER_PROBE_BYTES`] from the front of `path`. A header
    /// that is not GGUF still probes successfully, with `architecture` unset.
    pub fn probe<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut prefix = Vec::with_capacity(HEADER_PROBE_BYTES);
        file.take(HEADER_PROBE_BYTES as u64).read_to_end(&mut prefix)?;
        Ok(Self::from_prefix(&prefix))
    }

    pub fn from_prefix(prefix: &[u8]) -> Self {
        let mut reader = Cursor::new(prefix);
        let magic = reader.read_u32::<LittleEndian>().unwrap_or(0);
        let version = reader.read_u32::<LittleEndian>().unwrap_or(0);

        let architecture = if magic == GGUF_MAGIC {
            Self::scan_architecture(&mut reader).ok().flatten()
        } else {
            None
        };

        Self { magic, version, architecture }
    }

    pub fn is_gguf(&self) -> bool {
        self.magic == GGUF_MAGIC && matches!(self.version, 2 | 3)
    }

    fn scan_architecture<R: Read>(reader: &mut R) -> Result<Option<String>> {
        let _tensor_count = reader.read_u64::<LittleEndian>()?;
        let kv_count = reader.read_u64::<LittleEndian>()?;
        for _ in 0..kv_count {
            let key = GgufParser::read_string(reader)?;
            let value = GgufParser::read_metadata_value(reader)?;
            if key == "general.architecture" {
                return Ok(value.as_str().map(String::from));
            }
        }
        Ok(None)
    }
}

pub struct GgufParser;

impl GgufParser {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<GgufFile> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::parse_reader(&mut reader)
    }

    pub fn parse_reader<R: Read + Seek>(reader: &mut R) -> Result<GgufFile> {
        Self::parse_inner(reader).map_err(|e| match e {
            Error::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                Error::format("truncated gguf header")
            }
            other => other,
        })
    }

    fn parse_inner<R: Read + Seek>(reader: &mut R) -> Result<GgufFile> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            return Err(Error::format(format!(
                "invalid gguf magic: expected 0x{:08X}, got 0x{:08X}", GGUF_MAGIC, magic
            )));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if !matches!(version, 2 | 3) {
            return Err(Error::format(format!("unsupported gguf version {}", version)));
        }

        let tensor_count = reader.read_u64::<LittleEndian>()?;
        let metadata_kv_count = reader.read_u64::<LittleEndian>()?;

        let mut metadata = GgufMetadata::new();
        for _ in 0..metadata_kv_count {
            let key = Self::read_string(reader)?;
            let value = Self::read_metadata_value(reader)?;
            metadata.kv.insert(key, value);
        }

        let mut tensors = Vec::new();
        let mut total_elements = 0u64;
        for _ in 0..tensor_count {
            let name = Self::read_string(reader)?;
            let n_dims = reader.read_u32::<LittleEndian>()?;
            if n_dims == 0 || n_dims > MAX_DIMS {
                return Err(Error::format(format!("tensor '{}' has {} dimensions", name, n_dims)));
            }

            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(reader.read_u64::<LittleEndian>()?);
            }

            let dtype = GgmlType::from_id(reader.read_u32::<LittleEndian>()?)?;
            let offset = reader.read_u64::<LittleEndian>()?;

            // element counts, and their f32 size, must stay addressable
            total_elements = dims
                .iter()
                .try_fold(1u64, |acc, &d| acc.checked_mul(d))
                .and_then(|n| total_elements.checked_add(n))
                .filter(|&total| total.checked_mul(4).is_some())
                .ok_or_else(|| Error::format(format!("tensor '{}' dimensions {:?} overflow", name, dims)))?;

            tensors.push(TensorInfo { name, dims, dtype, offset });
        }

        let alignment = metadata.alignment();
        let position = reader.stream_position()?;
        let data_offset = position.div_ceil(alignment) * alignment;

        Ok(GgufFile {
            version,
            metadata,
            tensors,
            data_offset,
        })
    }

    pub(crate) fn read_string<R: Read>(reader: &mut R) -> Result<String> {
        let len = reader.read_u64::<LittleEndian>()?;
        if len > MAX_STRING_LEN {
            return Err(Error::format(format!("string too large: {} bytes", len)));
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub(crate) fn read_metadata_value<R: Read>(reader: &mut R) -> Result<MetadataValue> {
        let vtype = reader.read_u32::<LittleEndian>()?;
        Self::read_value_of_type(reader, vtype)
    }

    fn read_value_of_type<R: Read>(reader: &mut R, vtype: u32) -> Result<MetadataValue> {
        Ok(match vtype {
            0 => MetadataValue::Uint(reader.read_u8()? as u64),
            1 => MetadataValue::Int(reader.read_i8()? as i64),
            2 => MetadataValue::Uint(reader.read_u16::<LittleEndian>()? as u64),
            3 => MetadataValue::Int(reader.read_i16::<LittleEndian>()? as i64),
            4 => MetadataValue::Uint(reader.read_u32::<LittleEndian>()? as u64),
            5 => MetadataValue::Int(reader.read_i32::<LittleEndian>()? as i64),
            6 => MetadataValue::Float(reader.read_f32::<LittleEndian>()? as f64),
            7 => MetadataValue::Bool(reader.read_u8()? != 0),
            8 => MetadataValue::String(Self::read_string(reader)?),
            9 => {
                let element_type = reader.read_u32::<LittleEndian>()?;
                let len = reader.read_u64::<LittleEndian>()?;
                if len > MAX_ARRAY_LEN {
                    return Err(Error::format(format!("array too large: {} elements", len)));
                }
                let mut arr = Vec::new();
                for _ in 0..len {
                    arr.push(Self::read_value_of_type(reader, element_type)?);
                }
                MetadataValue::Array(arr)
            }
            10 => MetadataValue::Uint(reader.read_u64::<LittleEndian>()?),
            11 => MetadataValue::Int(reader.read_i64::<LittleEndian>()?),
            12 => MetadataValue::Float(reader.read_f64::<LittleEndian>()?),
            _ => return Err(Error::format(format!("unknown metadata value type {}", vtype))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> Vec<u8> {
        let mut writer = GgufWriter::new();
        writer.add_string("general.architecture", "toy");
        writer.add_u32("toy.context_length", 16);
        writer.add_string_array("tokenizer.ggml.tokens", &["a", "b"]);
        writer.add_tensor_f32("w", &[2, 3], &[0.0; 6]);
        let mut buf = Vec::new();
        writer.write(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_parse_written_file() {
        let bytes = sample_file();
        let gguf = GgufParser::parse_reader(&mut Cursor::new(&bytes)).unwrap();

        assert_eq!(gguf.version, 3);
        assert_eq!(gguf.metadata.architecture(), Some("toy"));
        assert_eq!(gguf.metadata.uint("toy.context_length"), Some(16));
        assert_eq!(gguf.metadata.strings("tokenizer.ggml.tokens"), vec!["a", "b"]);

        let w = gguf.tensor("w").unwrap();
        assert_eq!(w.dims, vec![2, 3]);
        assert_eq!(w.size_in_bytes(), 24);
        assert_eq!(gguf.data_offset % DEFAULT_ALIGNMENT, 0);
        assert_eq!(gguf.data_offset + 24, bytes.len() as u64);
    }

    #[test]
    fn test_bad_magic() {
        let err = GgufParser::parse_reader(&mut Cursor::new(b"GGML\x01\0\0\0")).unwrap_err();
        assert!(matches!(err, Error::FormatMismatch(_)));
    }

    #[test]
    fn test_truncated_is_format_mismatch() {
        let bytes = sample_file();
        let err = GgufParser::parse_reader(&mut Cursor::new(&bytes[..20])).unwrap_err();
        assert!(matches!(err, Error::FormatMismatch(_)));
    }

    #[test]
    fn test_probe_prefix() {
        let bytes = sample_file();
        let header = ModelHeader::from_prefix(&bytes);
        assert!(header.is_gguf());
        assert_eq!(header.architecture.as_deref(), Some("toy"));

        let foreign = ModelHeader::from_prefix(b"\x7fELF\x02\x01");
        assert!(!foreign.is_gguf());
        assert_eq!(foreign.architecture, None);
    }

    #[test]
    fn test_overflowing_dims_rejected() {
        let mut writer = GgufWriter::new();
        writer.add_string("general.architecture", "toy");
        writer.add_tensor_raw("huge", &[1 << 40, 1 << 40], GgmlType::F32, Vec::new());
        let mut buf = Vec::new();
        writer.write(&mut buf).unwrap();

        let err = GgufParser::parse_reader(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, Error::FormatMismatch(_)));
    }

    #[test]
    fn test_total_elements_overflow_rejected() {
        let mut writer = GgufWriter::new();
        for name in ["a", "b", "c", "d", "e"] {
            writer.add_tensor_raw(name, &[1 << 30, 1 << 30], GgmlType::F32, Vec::new());
        }
        let mut buf = Vec::new();
        writer.write(&mut buf).unwrap();

        assert!(matches!(
            GgufParser::parse_reader(&mut Cursor::new(&buf)),
            Err(Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_architecture_beyond_prefix_is_unseen() {
        let tokens: Vec<String> = (0..10_000).map(|i| format!("token{:05}", i)).collect();
        let mut writer = GgufWriter::new();
        writer.add_string_array("tokenizer.ggml.tokens", &tokens);
        writer.add_string("general.architecture", "toy");
        let mut buf = Vec::new();
        writer.write(&mut buf).unwrap();
        assert!(buf.len() > HEADER_PROBE_BYTES);

        assert_eq!(ModelHeader::from_prefix(&buf).architecture.as_deref(), Some("toy"));
        let header = ModelHeader::from_prefix(&buf[..HEADER_PROBE_BYTES]);
        assert!(header.is_gguf());
        assert_eq!(header.architecture, None);
    }

    #[test]
    fn test_heap_bound_covers_strings() {
        let bytes = sample_file();
        let gguf = GgufParser::parse_reader(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(gguf.metadata.string_stats("tokenizer.ggml.tokens"), (2, 2));
        assert_eq!(gguf.metadata.string_stats("missing"), (0, 0));
        assert!(gguf.heap_bound() > HEADER_BASE_BYTES + gguf.metadata.heap_bound());
        assert!(gguf.metadata.heap_bound() > 2 * 3 * std::mem::size_of::<MetadataValue>() as u64);
    }

    #[test]
    fn test_quantized_sizes() {
        assert_eq!(GgmlType::Q4_0.bytes_for(64), 36);
        assert_eq!(GgmlType::F16.bytes_for(10), 20);
        assert_eq!(GgmlType::from_id(GgmlType::BF16.id()).unwrap(), GgmlType::BF16);
        assert!(GgmlType::from_id(99).is_err());
    }
}
