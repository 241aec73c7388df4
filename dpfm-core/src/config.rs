//! `src/config.rs`
//! ============================================================================
//! # Config: Application Configuration Loader and Saver
//!
//! Manages user-editable settings for the cache engine. Loads and saves
//! settings as TOML from the cross-platform config path using the
//! [`directories`](https://docs.rs/directories) crate, defaulting (and
//! writing the default file) when none exists.
//!
//! The byte budget default is derived from installed memory and clamped,
//! so a fresh install behaves sensibly on both small and large machines.

use bytesize::ByteSize;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use tokio::fs as TokioFs;

/// Lower clamp for the derived byte budget.
const MIN_CACHE_BYTES: u64 = 32 * 1024 * 1024;
/// Upper clamp for the derived byte budget.
const MAX_CACHE_BYTES: u64 = 512 * 1024 * 1024;
/// Fraction of installed memory granted to the listing cache.
const MEMORY_FRACTION: u64 = 16;

/// Runtime limits handed to the cache store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Aggregate snapshot byte budget; `0` disables eviction.
    pub max_bytes: u64,

    /// Global cap on simultaneously active change-watchers.
    pub max_watchers: usize,

    /// How many non-pinned most-recently-used folders may hold a watcher.
    pub mru_watched: usize,
}

/// Cache configuration with sensible defaults - embedded in main Config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum bytes of cached listings (0 = unbounded)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Maximum simultaneously watched folders
    #[serde(default = "default_max_watchers")]
    pub max_watchers: usize,

    /// Non-pinned MRU folders eligible for a watcher
    #[serde(default = "default_mru_watched")]
    pub mru_watched: usize,
}

/// Derive the default budget from installed memory, clamped.
///
/// Falls back to the minimum when the probe fails (containers without
/// /proc, exotic platforms).
fn default_max_bytes() -> u64 {
    let derived = sys_info::mem_info()
        .map(|mem| (mem.total * 1024) / MEMORY_FRACTION)
        .unwrap_or(MIN_CACHE_BYTES);

    derived.clamp(MIN_CACHE_BYTES, MAX_CACHE_BYTES)
}

const fn default_max_watchers() -> usize {
    8
}

const fn default_mru_watched() -> usize {
    4
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            max_watchers: default_max_watchers(),
            mru_watched: default_mru_watched(),
        }
    }
}

impl From<&CacheConfig> for CacheLimits {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            max_bytes: cfg.max_bytes,
            max_watchers: cfg.max_watchers,
            mru_watched: cfg.mru_watched,
        }
    }
}

/// Main configuration struct for the cache engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Loads config from the TOML file at the XDG-compliant app config dir,
    /// or returns (and persists) defaults.
    pub async fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            info!("Loading config from {}", path.display());
            let text = TokioFs::read_to_string(&path).await?;
            let cfg: Self = toml::from_str(&text)?;

            Ok(cfg)
        } else {
            info!(
                "No config file found at {}, using default configuration. Creating it now.",
                path.display()
            );

            let default_config = Self::default();
            default_config.save().await?;

            Ok(default_config)
        }
    }

    /// Saves config to the TOML file at the XDG-compliant app config dir.
    pub async fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;

        info!(
            "Saving config to {} (budget {})",
            path.display(),
            ByteSize::b(self.cache.max_bytes)
        );

        if let Some(parent) = path.parent() {
            TokioFs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        TokioFs::write(&path, toml_str).await?;

        Ok(())
    }

    /// Returns the canonical config file path using `directories::ProjectDirs`.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "dpfm", "dpfm")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory."))?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
