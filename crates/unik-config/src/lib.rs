//! # unik-config
//!
//! Configuration management for unik.
//!
//! Loads configuration from:
//! 1. `~/.unik/config.toml` (global)
//! 2. `.unik/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Default tfs format version written by `mkfs`
pub const DEFAULT_TFS_VERSION: u32 = 4;

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mkfs: MkfsConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.unik/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Project config (.unik/config.toml) overrides global
        let project_path = Path::new(".unik/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::from_file(project_path)?;
            config.merge(project_config);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file without layering
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.unik/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".unik/config.toml"))
    }

    /// Merge another config (project overrides). Only values the project
    /// file actually sets replace the current ones.
    pub fn merge(&mut self, other: Config) {
        let defaults = MkfsConfig::default();
        if other.mkfs.label != defaults.label {
            self.mkfs.label = other.mkfs.label;
        }
        if other.mkfs.size.is_some() {
            self.mkfs.size = other.mkfs.size;
        }
        if other.mkfs.boot.is_some() {
            self.mkfs.boot = other.mkfs.boot;
        }
        if other.mkfs.uefi.is_some() {
            self.mkfs.uefi = other.mkfs.uefi;
        }
        if other.mkfs.klib_dir.is_some() {
            self.mkfs.klib_dir = other.mkfs.klib_dir;
        }
        if other.mkfs.target_root.is_some() {
            self.mkfs.target_root = other.mkfs.target_root;
        }
        if other.mkfs.tfs_version != defaults.tfs_version {
            self.mkfs.tfs_version = other.mkfs.tfs_version;
        }
        if other.log.level != LogConfig::default().level {
            self.log.level = other.log.level;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("UNIK_KLIB_DIR") {
            self.mkfs.klib_dir = Some(PathBuf::from(dir));
        }
        if let Ok(root) = std::env::var("UNIK_TARGET_ROOT") {
            self.mkfs.target_root = Some(PathBuf::from(root));
        }
        if let Ok(boot) = std::env::var("UNIK_BOOT") {
            self.mkfs.boot = Some(PathBuf::from(boot));
        }
        if let Ok(size) = std::env::var("UNIK_IMAGE_SIZE") {
            self.mkfs.size = Some(size);
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        Config::default()
            .to_toml()
            .unwrap_or_else(|_| String::from("[mkfs]\n\n[log]\n"))
    }

    /// Serialize this config as pretty TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Image build defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MkfsConfig {
    /// Root filesystem label
    pub label: String,
    /// Total image size, e.g. "64m" (None = as small as the content allows)
    pub size: Option<String>,
    /// Boot-loader blob prepended to partitioned images
    pub boot: Option<PathBuf>,
    /// UEFI loader (bootx64.efi / bootaa64.efi) placed in an EFI System Partition
    pub uefi: Option<PathBuf>,
    /// Host directory holding kernel libraries
    pub klib_dir: Option<PathBuf>,
    /// Alternate root used to resolve host paths
    pub target_root: Option<PathBuf>,
    /// tfs format version (4 or 5)
    pub tfs_version: u32,
}

impl Default for MkfsConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            size: None,
            boot: None,
            uefi: None,
            klib_dir: None,
            target_root: None,
            tfs_version: DEFAULT_TFS_VERSION,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when neither UNIK_LOG nor RUST_LOG is set
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
