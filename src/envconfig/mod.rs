use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_MODELS_DIR: &str = "~/.cache/llmodel/models";

/// Settings read from `LLMODEL_*` environment variables. Unset or unparsable
/// values fall back to defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    pub threads: Option<usize>,
    pub seed: Option<u64>,
    pub model_paths: Vec<PathBuf>,
    pub max_tokens: Option<usize>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            threads: lookup("LLMODEL_THREADS")
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0),
            seed: lookup("LLMODEL_SEED").and_then(|v| v.parse().ok()),
            model_paths: lookup("LLMODEL_MODELS")
                .unwrap_or_else(|| DEFAULT_MODELS_DIR.to_string())
                .split(':')
                .filter(|p| !p.is_empty())
                .map(expand_home)
                .collect(),
            max_tokens: lookup("LLMODEL_MAX_TOKENS").and_then(|v| v.parse().ok()),
        }
    }

    /// `name` as given if it exists, otherwise the first model directory
    /// holding `name` or `name.gguf`.
    pub fn resolve_model(&self, name: &str) -> Option<PathBuf> {
        let direct = Path::new(name);
        if direct.is_file() {
            return Some(direct.to_path_buf());
        }

        self.model_paths.iter().find_map(|dir| {
            [dir.join(name), dir.join(format!("{}.gguf", name))]
                .into_iter()
                .find(|p| p.is_file())
        })
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
