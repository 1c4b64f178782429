use super::architectures::StarcoderBackend;
use super::Backend;
use crate::error::{Error, Result};
use crate::infra::gguf::ModelHeader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub type HeaderProbe = Arc<dyn Fn(&ModelHeader) -> bool + Send + Sync>;
pub type BackendCreator = Arc<dyn Fn() -> Box<dyn Backend> + Send + Sync>;

struct Entry {
    name: String,
    probe: HeaderProbe,
    create: BackendCreator,
}

/// Ordered list of architectures. Selection offers a header to each entry in
/// registration order and the first one that accepts it wins.
pub struct BackendRegistry {
    entries: Vec<Entry>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "starcoder",
            |header: &ModelHeader| {
                header.is_gguf() && StarcoderBackend::accepts(header.architecture.as_deref())
            },
            || Box::new(StarcoderBackend::new()) as Box<dyn Backend>,
        );
        registry
    }

    pub fn register<N, P, C>(&mut self, name: N, probe: P, create: C)
    where
        N: Into<String>,
        P: Fn(&ModelHeader) -> bool + Send + Sync + 'static,
        C: Fn() -> Box<dyn Backend> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            name: name.into(),
            probe: Arc::new(probe),
            create: Arc::new(create),
        });
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Name of the first entry accepting `header`.
    pub fn match_header(&self, header: &ModelHeader) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| (entry.probe)(header))
            .map(|entry| entry.name.as_str())
    }

    /// Probe the header of `path` and construct an unloaded backend for it.
    pub fn select<P: AsRef<Path>>(&self, path: P) -> Result<Box<dyn Backend>> {
        let path = path.as_ref();
        let header = ModelHeader::probe(path)?;

        for entry in &self.entries {
            if (entry.probe)(&header) {
                info!(backend = %entry.name, "selected backend for {}", path.display());
                return Ok((entry.create)());
            }
            debug!(backend = %entry.name, "header rejected");
        }

        Err(Error::NoMatch(path.to_path_buf()))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub static REGISTRY: once_cell::sync::Lazy<BackendRegistry> =
    once_cell::sync::Lazy::new(BackendRegistry::with_defaults);

pub fn select_backend<P: AsRef<Path>>(path: P) -> Result<Box<dyn Backend>> {
    REGISTRY.select(path)
}
