pub mod traits;

pub use traits::KVCache;

use crate::error::{try_alloc_f32, Error, Result};

/// Fully pre-allocated cache: `layer_count × max_seq_len × row_width` floats for
/// keys and the same for values, so its footprint never grows during decoding.
pub struct CausalKVCache {
    layer_count: usize,
    row_width: usize,
    max_seq_len: usize,
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    seq_len: usize,
}

impl CausalKVCache {
    pub fn new(layer_count: usize, row_width: usize, max_seq_len: usize) -> Result<Self> {
        let per_layer = row_width * max_seq_len;
        let mut keys = Vec::with_capacity(layer_count);
        let mut values = Vec::with_capacity(layer_count);
        for _ in 0..layer_count {
            keys.push(try_alloc_f32(per_layer)?);
            values.push(try_alloc_f32(per_layer)?);
        }

        Ok(Self {
            layer_count,
            row_width,
            max_seq_len,
            keys,
            values,
            seq_len: 0,
        })
    }

    /// Bytes `new` allocates for the given geometry.
    pub fn allocation_bytes(layer_count: usize, row_width: usize, max_seq_len: usize) -> u64 {
        [row_width, max_seq_len, 2, 4]
            .iter()
            .fold(layer_count as u64, |acc, &n| acc.saturating_mul(n as u64))
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }
}

impl KVCache for CausalKVCache {
    fn write(&mut self, layer: usize, position: usize, key: &[f32], value: &[f32]) -> Result<()> {
        if layer >= self.layer_count {
            return Err(Error::Config(format!("cache layer {} out of {}", layer, self.layer_count)));
        }
        if position >= self.max_seq_len {
            return Err(Error::ContextOverflow {
                n_past: position,
                requested: 1,
                n_ctx: self.max_seq_len,
            });
        }
        if key.len() != self.row_width || value.len() != self.row_width {
            return Err(Error::Config(format!(
                "cache row width {} but got key {} / value {}",
                self.row_width, key.len(), value.len()
            )));
        }

        let start = position * self.row_width;
        let end = start + self.row_width;
        self.keys[layer][start..end].copy_from_slice(key);
        self.values[layer][start..end].copy_from_slice(value);
        Ok(())
    }

    fn keys(&self, layer: usize, len: usize) -> &[f32] {
        &self.keys[layer][..len * self.row_width]
    }

    fn values(&self, layer: usize, len: usize) -> &[f32] {
        &self.values[layer][..len * self.row_width]
    }

    fn commit(&mut self, len: usize) {
        self.seq_len = len.min(self.max_seq_len);
    }

    fn len(&self) -> usize {
        self.seq_len
    }

    fn capacity(&self) -> usize {
        self.max_seq_len
    }

    fn layer_count(&self) -> usize {
        self.layer_count
    }

    fn row_width(&self) -> usize {
        self.row_width
    }

    fn load_prefix(&mut self, layer: usize, keys: &[f32], values: &[f32]) -> Result<()> {
        if layer >= self.layer_count
            || keys.len() != values.len()
            || keys.len() % self.row_width.max(1) != 0
            || keys.len() > self.keys[layer].len()
        {
            return Err(Error::corrupt(format!("cache prefix does not fit layer {}", layer)));
        }

        self.keys[layer][..keys.len()].copy_from_slice(keys);
        self.values[layer][..values.len()].copy_from_slice(values);
        Ok(())
    }

    fn clear(&mut self) {
        // Stale rows past seq_len are never read, so only the length resets.
        self.seq_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_prefix() {
        let mut cache = CausalKVCache::new(2, 3, 4).unwrap();
        cache.write(1, 0, &[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();
        cache.write(1, 1, &[7.0, 8.0, 9.0], &[0.0, 1.0, 2.0]).unwrap();
        cache.commit(2);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys(1, 2), &[1.0, 2.0, 3.0, 7.0, 8.0, 9.0]);
        assert_eq!(cache.values(1, 1), &[4.0, 5.0, 6.0]);
        assert_eq!(cache.prefix_bytes(), 2 * 2 * 3 * 2 * 4);
    }

    #[test]
    fn test_write_past_capacity() {
        let mut cache = CausalKVCache::new(1, 2, 2).unwrap();
        let err = cache.write(0, 2, &[0.0, 0.0], &[0.0, 0.0]).unwrap_err();
        assert!(matches!(err, Error::ContextOverflow { .. }));
    }

    #[test]
    fn test_clear() {
        let mut cache = CausalKVCache::new(1, 2, 2).unwrap();
        cache.commit(2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 2);
    }

    #[test]
    fn test_allocation_bytes() {
        assert_eq!(CausalKVCache::allocation_bytes(4, 8, 16), 4 * 8 * 16 * 2 * 4);
    }
}
