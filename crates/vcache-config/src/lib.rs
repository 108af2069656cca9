//! # vcache-config
//!
//! Configuration management for Velo Cache.
//!
//! Loads configuration from:
//! 1. an explicit file (`--config`), or
//! 2. `~/.vcache/config.toml` (global), then `.vcache/config.toml`
//!    (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)
//!
//! Zero or out-of-range values are replaced by their defaults in
//! [`Config::validate`], which reports what it changed.

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Process-wide config, loaded on first use from the standard locations
static CONFIG: Lazy<Config> = Lazy::new(|| {
    let mut config = Config::load().unwrap_or_default();
    config.validate();
    config
});

/// Get global config (read-only)
pub fn config() -> &'static Config {
    &CONFIG
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML parse error in {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        // 1. Global config (~/.vcache/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                merge_tables(&mut merged, read_table(&global_path)?);
            }
        }

        // 2. Project config (.vcache/config.toml) - overrides global
        let project_path = Path::new(".vcache/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            merge_tables(&mut merged, read_table(project_path)?);
        }

        let mut config = Self::from_table(merged, Path::new("<merged>"))?;

        // 3. Environment variable overrides
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load a single config file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {:?}", path);
        let mut config = Self::from_table(read_table(path)?, path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: ~/.vcache/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".vcache/config.toml"))
    }

    fn from_table(table: toml::Table, origin: &Path) -> Result<Self, ConfigError> {
        Config::deserialize(toml::Value::Table(table)).map_err(|source| ConfigError::Toml {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("VCACHE_SOCKET") {
            self.server.socket_path = PathBuf::from(path);
        }
        if let Ok(workers) = std::env::var("VCACHE_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.server.num_workers = n;
            }
        }
    }

    /// Replace invalid values by their defaults. Returns one message per
    /// replaced value so the caller can log them once logging is up.
    pub fn validate(&mut self) -> Vec<String> {
        let server = ServerConfig::default();
        let store = StoreConfig::default();
        let mut warnings = Vec::new();

        let mut check = |name: &str, value: &mut usize, default: usize| {
            if *value == 0 {
                warnings.push(format!("{} must be positive, using default {}", name, default));
                *value = default;
            }
        };
        check("server.num_workers", &mut self.server.num_workers, server.num_workers);
        check("server.max_clients", &mut self.server.max_clients, server.max_clients);
        check(
            "server.queue_capacity",
            &mut self.server.queue_capacity,
            server.queue_capacity,
        );
        check(
            "server.max_frame_bytes",
            &mut self.server.max_frame_bytes,
            server.max_frame_bytes,
        );
        check(
            "store.max_capacity_slots",
            &mut self.store.max_capacity_slots,
            store.max_capacity_slots,
        );

        if self.store.max_capacity_mb == 0 {
            warnings.push(format!(
                "store.max_capacity_mb must be positive, using default {}",
                store.max_capacity_mb
            ));
            self.store.max_capacity_mb = store.max_capacity_mb;
        }
        if self.server.socket_path.as_os_str().is_empty() {
            warnings.push(format!(
                "server.socket_path is empty, using default {}",
                server.socket_path.display()
            ));
            self.server.socket_path = server.socket_path;
        }

        warnings
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    contents.parse::<toml::Table>().map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })
}

/// Overlay `other` onto `base`, descending into nested tables.
fn merge_tables(base: &mut toml::Table, other: toml::Table) {
    for (key, value) in other {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Server / transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket path
    pub socket_path: PathBuf,
    /// Worker threads
    pub num_workers: usize,
    /// Concurrent sessions accepted
    pub max_clients: usize,
    /// Slots in the dispatcher -> worker queue
    pub queue_capacity: usize,
    /// Receive buffer; larger request frames are rejected
    pub max_frame_bytes: usize,
    /// Compress file content in replies when it shrinks
    pub compression: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(vcache_ipc::DEFAULT_SOCKET_PATH),
            num_workers: 2,
            max_clients: 8,
            queue_capacity: 16,
            max_frame_bytes: vcache_ipc::DEFAULT_MAX_FRAME,
            compression: false,
        }
    }
}

/// File store capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Total content bytes, in MiB. A read-N reply is cut short at the
    /// client frame limit (16 MiB), so larger stores are read in parts.
    pub max_capacity_mb: u64,
    pub max_capacity_slots: usize,
    pub table_size: TableSize,
}

impl StoreConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_capacity_mb * 1024 * 1024
    }

    /// Initial hash table bucket count
    pub fn bucket_count(&self) -> usize {
        self.table_size.bucket_count(self.max_capacity_slots)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_capacity_mb: 16,
            max_capacity_slots: 32,
            table_size: TableSize::default(),
        }
    }
}

/// Hash table sizing relative to the slot capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableSize {
    Smallest,
    Small,
    #[default]
    Medium,
    Big,
    Biggest,
}

impl TableSize {
    const BASE_BUCKETS: usize = 4096;

    pub fn ratio(self) -> usize {
        match self {
            TableSize::Smallest => 0,
            TableSize::Small => 2,
            TableSize::Medium => 3,
            TableSize::Big => 4,
            TableSize::Biggest => 6,
        }
    }

    pub fn bucket_count(self, slots: usize) -> usize {
        Self::BASE_BUCKETS + slots.saturating_mul(self.ratio())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: logging::LogLevel,
    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.socket_path, PathBuf::from("/tmp/vcache.sock"));
        assert_eq!(config.server.num_workers, 2);
        assert_eq!(config.server.queue_capacity, 16);
        assert_eq!(config.store.max_bytes(), 16 * 1024 * 1024);
        assert_eq!(config.store.table_size, TableSize::Medium);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[store]"));
        assert!(toml_str.contains("table_size = \"medium\""));
    }

    #[test]
    fn test_bucket_count() {
        assert_eq!(TableSize::Smallest.bucket_count(100), 4096);
        assert_eq!(TableSize::Medium.bucket_count(100), 4396);
        assert_eq!(TableSize::Biggest.bucket_count(100), 4696);
    }

    #[test]
    fn test_validate_replaces_zero_values() {
        let mut config = Config::default();
        config.server.num_workers = 0;
        config.store.max_capacity_mb = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert_eq!(config.server.num_workers, 2);
        assert_eq!(config.store.max_capacity_mb, 16);
    }

    #[test]
    fn test_merge_tables_overrides_per_key() {
        let mut base: toml::Table = "[server]\nnum_workers = 4\nmax_clients = 3\n"
            .parse()
            .unwrap();
        let overlay: toml::Table = "[server]\nnum_workers = 9\n".parse().unwrap();
        merge_tables(&mut base, overlay);
        let config = Config::from_table(base, Path::new("test")).unwrap();
        assert_eq!(config.server.num_workers, 9);
        assert_eq!(config.server.max_clients, 3);
    }
}
