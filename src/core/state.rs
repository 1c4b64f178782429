//! Versioned binary snapshot of a backend's evaluation state.
//!
//! Layout (little endian):
//!
//! ```text
//! magic      b"LMST"
//! version    u32
//! arch       u32 length + utf8 bytes
//! hparams    u32 n_layer, n_ctx, n_embd, kv_dim, n_vocab
//! rng        u64
//! n_past     u32
//! tokens     n_past x i32
//! logits     u32 count (0 or n_vocab) + count x f32
//! kv         per layer: n_past x kv_dim keys, then n_past x kv_dim values
//! digest     SHA-256 of everything above
//! ```

use crate::core::cache::KVCache;
use crate::core::model::{Hyperparameters, TokenId};
use crate::error::{try_alloc_f32, Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Write};

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"LMST";
pub const SNAPSHOT_VERSION: u32 = 1;
const DIGEST_LEN: usize = 32;

/// The parts of a model's geometry a snapshot must agree with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateShape {
    pub architecture: String,
    pub n_layer: usize,
    pub n_ctx: usize,
    pub n_embd: usize,
    pub kv_dim: usize,
    pub n_vocab: usize,
}

impl StateShape {
    pub fn from_hparams(hp: &Hyperparameters) -> Self {
        Self {
            architecture: hp.architecture.clone(),
            n_layer: hp.n_layer,
            n_ctx: hp.n_ctx,
            n_embd: hp.n_embd,
            kv_dim: hp.kv_dim(),
            n_vocab: hp.n_vocab,
        }
    }

    fn header_len(&self) -> usize {
        4 + 4 + 4 + self.architecture.len() + 5 * 4 + 8 + 4
    }

    /// Exact encoded size for `n_past` tokens and `n_logits` stored logits.
    pub fn encoded_len(&self, n_past: usize, n_logits: usize) -> usize {
        self.header_len()
            + n_past * 4
            + 4
            + n_logits * 4
            + self.n_layer * 2 * n_past * self.kv_dim * 4
            + DIGEST_LEN
    }
}

/// Borrowed view of live state, for encoding.
pub struct StateView<'a> {
    pub rng_state: u64,
    pub tokens: &'a [TokenId],
    /// Empty when nothing has been evaluated.
    pub logits: &'a [f32],
    pub cache: &'a dyn KVCache,
}

/// Owned, fully validated contents of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub rng_state: u64,
    pub tokens: Vec<TokenId>,
    pub logits: Vec<f32>,
    pub keys: Vec<Vec<f32>>,
    pub values: Vec<Vec<f32>>,
}

pub fn encode(shape: &StateShape, view: &StateView<'_>, buf: &mut [u8]) -> Result<usize> {
    let n_past = view.tokens.len();
    let total = shape.encoded_len(n_past, view.logits.len());
    if buf.len() < total {
        return Err(Error::Config(format!(
            "snapshot buffer holds {} bytes, state needs {}", buf.len(), total
        )));
    }
    if view.cache.len() != n_past {
        return Err(Error::corrupt(format!(
            "cache holds {} positions but history has {}", view.cache.len(), n_past
        )));
    }

    let mut w = Cursor::new(&mut buf[..total]);
    w.write_all(SNAPSHOT_MAGIC)?;
    w.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;
    w.write_u32::<LittleEndian>(shape.architecture.len() as u32)?;
    w.write_all(shape.architecture.as_bytes())?;
    for v in [shape.n_layer, shape.n_ctx, shape.n_embd, shape.kv_dim, shape.n_vocab] {
        w.write_u32::<LittleEndian>(v as u32)?;
    }
    w.write_u64::<LittleEndian>(view.rng_state)?;
    w.write_u32::<LittleEndian>(n_past as u32)?;
    for t in view.tokens {
        w.write_i32::<LittleEndian>(t.0)?;
    }
    w.write_u32::<LittleEndian>(view.logits.len() as u32)?;
    for &l in view.logits {
        w.write_f32::<LittleEndian>(l)?;
    }
    for layer in 0..shape.n_layer {
        for &k in view.cache.keys(layer, n_past) {
            w.write_f32::<LittleEndian>(k)?;
        }
        for &v in view.cache.values(layer, n_past) {
            w.write_f32::<LittleEndian>(v)?;
        }
    }

    let body = w.position() as usize;
    let digest = Sha256::digest(&buf[..body]);
    buf[body..body + DIGEST_LEN].copy_from_slice(&digest);
    Ok(total)
}

/// Parse and verify a snapshot against `shape`. Returns the snapshot and the
/// number of bytes it occupied. Nothing is allocated for the bulk data until
/// the digest has been checked.
pub fn decode(shape: &StateShape, buf: &[u8]) -> Result<(StateSnapshot, usize)> {
    decode_inner(shape, buf).map_err(|e| match e {
        Error::Io(io) => Error::corrupt(format!("truncated snapshot: {}", io)),
        other => other,
    })
}

fn decode_inner(shape: &StateShape, buf: &[u8]) -> Result<(StateSnapshot, usize)> {
    let mut r = Cursor::new(buf);

    let mut magic = [0u8; 4];
    std::io::Read::read_exact(&mut r, &mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(Error::corrupt("bad magic"));
    }

    let version = r.read_u32::<LittleEndian>()?;
    if version != SNAPSHOT_VERSION {
        return Err(Error::corrupt(format!("unsupported snapshot version {}", version)));
    }

    let arch_len = r.read_u32::<LittleEndian>()? as usize;
    if arch_len != shape.architecture.len() {
        return Err(Error::corrupt("architecture mismatch"));
    }
    let mut arch = vec![0u8; arch_len];
    std::io::Read::read_exact(&mut r, &mut arch)?;
    if arch != shape.architecture.as_bytes() {
        return Err(Error::corrupt(format!(
            "snapshot for '{}', backend is '{}'",
            String::from_utf8_lossy(&arch),
            shape.architecture
        )));
    }

    let expected = [shape.n_layer, shape.n_ctx, shape.n_embd, shape.kv_dim, shape.n_vocab];
    for (name, want) in ["n_layer", "n_ctx", "n_embd", "kv_dim", "n_vocab"].iter().zip(expected) {
        let got = r.read_u32::<LittleEndian>()? as usize;
        if got != want {
            return Err(Error::corrupt(format!("{} is {} in snapshot, {} in model", name, got, want)));
        }
    }

    let rng_state = r.read_u64::<LittleEndian>()?;
    let n_past = r.read_u32::<LittleEndian>()? as usize;
    if n_past > shape.n_ctx {
        return Err(Error::corrupt(format!("position {} beyond context {}", n_past, shape.n_ctx)));
    }

    let logits_at = shape.header_len() + n_past * 4;
    let n_logits = buf
        .get(logits_at..logits_at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| Error::corrupt("truncated before logits"))?;
    if n_logits != 0 && n_logits != shape.n_vocab {
        return Err(Error::corrupt(format!("{} logits for vocabulary of {}", n_logits, shape.n_vocab)));
    }
    if (n_past == 0) != (n_logits == 0) {
        return Err(Error::corrupt("logits present without evaluated tokens"));
    }

    let total = shape.encoded_len(n_past, n_logits);
    if buf.len() < total {
        return Err(Error::corrupt(format!("snapshot is {} bytes, expected {}", buf.len(), total)));
    }
    let body = total - DIGEST_LEN;
    if Sha256::digest(&buf[..body]).as_slice() != &buf[body..total] {
        return Err(Error::corrupt("digest mismatch"));
    }

    let mut tokens = Vec::new();
    tokens.try_reserve_exact(n_past)?;
    for _ in 0..n_past {
        tokens.push(TokenId(r.read_i32::<LittleEndian>()?));
    }
    if let Some(bad) = tokens.iter().find(|t| t.index().map_or(true, |i| i >= shape.n_vocab)) {
        return Err(Error::corrupt(format!("token {} outside vocabulary", bad)));
    }

    r.read_u32::<LittleEndian>()?;
    let mut logits = try_alloc_f32(n_logits)?;
    r.read_f32_into::<LittleEndian>(&mut logits)?;

    let per_layer = n_past * shape.kv_dim;
    let mut keys = Vec::with_capacity(shape.n_layer);
    let mut values = Vec::with_capacity(shape.n_layer);
    for _ in 0..shape.n_layer {
        let mut k = try_alloc_f32(per_layer)?;
        r.read_f32_into::<LittleEndian>(&mut k)?;
        let mut v = try_alloc_f32(per_layer)?;
        r.read_f32_into::<LittleEndian>(&mut v)?;
        keys.push(k);
        values.push(v);
    }

    Ok((
        StateSnapshot {
            rng_state,
            tokens,
            logits,
            keys,
            values,
        },
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::CausalKVCache;

    fn shape() -> StateShape {
        StateShape {
            architecture: "starcoder".to_string(),
            n_layer: 2,
            n_ctx: 4,
            n_embd: 8,
            kv_dim: 2,
            n_vocab: 3,
        }
    }

    fn filled_cache(n_past: usize) -> CausalKVCache {
        let mut cache = CausalKVCache::new(2, 2, 4).unwrap();
        for layer in 0..2 {
            for pos in 0..n_past {
                let k = [layer as f32, pos as f32];
                let v = [-(pos as f32), 0.5];
                cache.write(layer, pos, &k, &v).unwrap();
            }
        }
        cache.commit(n_past);
        cache
    }

    fn encoded(n_past: usize) -> Vec<u8> {
        let cache = filled_cache(n_past);
        let tokens: Vec<TokenId> = (0..n_past).map(|i| TokenId((i % 3) as i32)).collect();
        let logits = if n_past == 0 { vec![] } else { vec![0.1, 0.2, 0.3] };
        let view = StateView {
            rng_state: 99,
            tokens: &tokens,
            logits: &logits,
            cache: &cache,
        };
        let mut buf = vec![0u8; shape().encoded_len(n_past, logits.len())];
        let n = encode(&shape(), &view, &mut buf).unwrap();
        assert_eq!(n, buf.len());
        buf
    }

    #[test]
    fn test_decode_recovers_fields() {
        let buf = encoded(3);
        let (snap, used) = decode(&shape(), &buf).unwrap();

        assert_eq!(used, buf.len());
        assert_eq!(snap.rng_state, 99);
        assert_eq!(snap.tokens, vec![TokenId(0), TokenId(1), TokenId(2)]);
        assert_eq!(snap.logits, vec![0.1, 0.2, 0.3]);
        assert_eq!(snap.keys[1], vec![1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        assert_eq!(snap.values[0], vec![0.0, 0.5, -1.0, 0.5, -2.0, 0.5]);
    }

    #[test]
    fn test_empty_state() {
        let buf = encoded(0);
        let (snap, _) = decode(&shape(), &buf).unwrap();
        assert!(snap.tokens.is_empty());
        assert!(snap.logits.is_empty());
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let mut buf = encoded(2);
        let at = buf.len() - DIGEST_LEN - 1;
        buf[at] ^= 0x40;
        assert!(matches!(decode(&shape(), &buf), Err(Error::CorruptState(_))));
    }

    #[test]
    fn test_shape_mismatch_is_corrupt() {
        let buf = encoded(2);
        let other = StateShape { n_vocab: 4, ..shape() };
        assert!(matches!(decode(&other, &buf), Err(Error::CorruptState(_))));

        let arch = StateShape { architecture: "gpt2".to_string(), ..shape() };
        assert!(matches!(decode(&arch, &buf), Err(Error::CorruptState(_))));
    }

    #[test]
    fn test_truncated_is_corrupt() {
        let buf = encoded(2);
        for cut in [0, 3, 10, buf.len() - 1] {
            assert!(matches!(decode(&shape(), &buf[..cut]), Err(Error::CorruptState(_))));
        }
    }

    #[test]
    fn test_small_buffer_rejected() {
        let cache = filled_cache(1);
        let view = StateView {
            rng_state: 0,
            tokens: &[TokenId(0)],
            logits: &[0.0; 3],
            cache: &cache,
        };
        let mut buf = vec![0u8; 8];
        assert!(matches!(encode(&shape(), &view, &mut buf), Err(Error::Config(_))));
    }
}
