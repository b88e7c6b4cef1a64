use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    pack::DecoderOptions,
    refs::{RefUpdateMode, DEFAULT_HEAD},
};

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for git-ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Directory of the filesystem store
    #[serde(default = "defaults::store_dir")]
    pub store_dir: PathBuf,
    /// Byte budget for bases held while their deltas resolve
    #[serde(default = "defaults::delta_cache_bytes")]
    pub delta_cache_bytes: usize,
    #[serde(default = "defaults::max_delta_depth")]
    pub max_delta_depth: usize,
    /// Size of the writes a push forwards into the ingestion sink
    #[serde(default = "defaults::ingest_chunk_size")]
    pub ingest_chunk_size: usize,
    /// Apply reference batches all-or-nothing
    #[serde(default)]
    pub atomic_ref_updates: bool,
    /// Branch HEAD points at in new repositories
    #[serde(default = "defaults::default_head")]
    pub default_head: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_dir: defaults::store_dir(),
            delta_cache_bytes: defaults::delta_cache_bytes(),
            max_delta_depth: defaults::max_delta_depth(),
            ingest_chunk_size: defaults::ingest_chunk_size(),
            atomic_ref_updates: false,
            default_head: defaults::default_head(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the config file (if any) and environment variables
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        tracing::debug!("loading git-ledger config from {:?}", config_path);
        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| env::var(name).ok())?;
        Ok(config)
    }

    /// Apply `GIT_LEDGER_*` overrides looked up through `var`
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = var("GIT_LEDGER_STORE_DIR") {
            self.store_dir = expand_tilde(&PathBuf::from(path));
        }

        if let Some(bytes) = var("GIT_LEDGER_DELTA_CACHE_BYTES") {
            self.delta_cache_bytes = bytes
                .parse()
                .context("Failed to parse GIT_LEDGER_DELTA_CACHE_BYTES as usize")?;
        }

        if let Some(depth) = var("GIT_LEDGER_MAX_DELTA_DEPTH") {
            self.max_delta_depth = depth
                .parse()
                .context("Failed to parse GIT_LEDGER_MAX_DELTA_DEPTH as usize")?;
        }

        if let Some(size) = var("GIT_LEDGER_INGEST_CHUNK_SIZE") {
            self.ingest_chunk_size = size
                .parse()
                .context("Failed to parse GIT_LEDGER_INGEST_CHUNK_SIZE as usize")?;
        }

        if let Some(atomic) = var("GIT_LEDGER_ATOMIC_REF_UPDATES") {
            self.atomic_ref_updates = match atomic.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => anyhow::bail!(
                    "Failed to parse GIT_LEDGER_ATOMIC_REF_UPDATES: '{}' is not a boolean",
                    other
                ),
            };
        }
        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: ServiceConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.store_dir = expand_tilde(&config.store_dir);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/git-ledger/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    pub fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions {
            cache_capacity: self.delta_cache_bytes,
            max_delta_depth: self.max_delta_depth,
        }
    }

    pub fn ref_update_mode(&self) -> RefUpdateMode {
        if self.atomic_ref_updates {
            RefUpdateMode::Atomic
        } else {
            RefUpdateMode::Sequential
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    pub(crate) fn store_dir() -> PathBuf {
        super::expand_tilde(&PathBuf::from("~/.local/share/git-ledger"))
    }

    pub(crate) fn delta_cache_bytes() -> usize {
        crate::pack::cache::DEFAULT_CAPACITY_BYTES
    }

    pub(crate) fn max_delta_depth() -> usize {
        crate::pack::decode::DEFAULT_MAX_DELTA_DEPTH
    }

    pub(crate) fn ingest_chunk_size() -> usize {
        crate::pack::receive::DEFAULT_CHUNK_SIZE
    }

    pub(crate) fn default_head() -> String {
        super::DEFAULT_HEAD.to_string()
    }
}
