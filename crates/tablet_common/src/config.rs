use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level node configuration (`tablet-copy.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub fs: FsConfig,
    #[serde(default)]
    pub copy: TabletCopyConfig,
}

/// Local filesystem layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Root directory holding blocks, WAL directories and tablet metadata.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
}

fn default_root_dir() -> String {
    "./tablet-data".to_string()
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
        }
    }
}

/// Tablet copy client tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletCopyConfig {
    /// Maximum payload bytes requested per chunk (default: 4 MiB).
    #[serde(default = "default_transfer_chunk_size_bytes")]
    pub transfer_chunk_size_bytes: u64,
    /// Number of blocks fetched concurrently within one session (default: 1).
    /// Chunks of a single block are always fetched sequentially.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
}

fn default_transfer_chunk_size_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_max_concurrent_downloads() -> usize {
    1
}

impl Default for TabletCopyConfig {
    fn default() -> Self {
        Self {
            transfer_chunk_size_bytes: default_transfer_chunk_size_bytes(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
        }
    }
}

impl TabletCopyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.transfer_chunk_size_bytes == 0 {
            return Err("transfer_chunk_size_bytes must be >= 1".into());
        }
        if self.max_concurrent_downloads == 0 {
            return Err("max_concurrent_downloads must be >= 1".into());
        }
        Ok(())
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.fs.root_dir.is_empty() {
            return Err("fs.root_dir must be set".into());
        }
        self.copy.validate()
    }

    /// Load a config file, falling back to defaults when it is missing or
    /// fails to parse.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config {}: {}, using defaults",
                        path.display(),
                        e
                    );
                    NodeConfig::default()
                }
            },
            Err(_) => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                NodeConfig::default()
            }
        }
    }
}
