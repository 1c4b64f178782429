use crate::error::Result;

/// Per-layer key/value storage indexed by position.
pub trait KVCache: Send + Sync {
    /// Store the key and value rows produced for `position` in `layer`.
    fn write(&mut self, layer: usize, position: usize, key: &[f32], value: &[f32]) -> Result<()>;

    /// Keys for positions `0..len` of `layer`, row-major.
    fn keys(&self, layer: usize, len: usize) -> &[f32];
    fn values(&self, layer: usize, len: usize) -> &[f32];

    /// Mark positions `0..len` as valid.
    fn commit(&mut self, len: usize);

    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
    fn layer_count(&self) -> usize;
    fn row_width(&self) -> usize;

    /// Overwrite positions `0..len` of `layer` and make them the valid prefix.
    fn load_prefix(&mut self, layer: usize, keys: &[f32], values: &[f32]) -> Result<()>;

    fn clear(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of cache content a snapshot of the valid prefix occupies.
    fn prefix_bytes(&self) -> usize {
        self.layer_count() * self.len() * self.row_width() * 2 * 4
    }
}
