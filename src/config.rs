//! Configuration management for Ferry Server

use std::env;
use std::path::PathBuf;

/// Default request body ceiling for a single chunk upload: 256 MiB
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_disabled: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of the local backing store
    pub root: PathBuf,
    /// Directory holding staging files and their metadata records
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub completion_workers: usize,
    pub completion_queue_capacity: usize,
    pub max_chunk_bytes: usize,
    pub staging_ttl_hours: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 16321,
                cors_disabled: false,
            },
            storage: StorageConfig {
                root: PathBuf::from("./data"),
                staging_dir: PathBuf::from("./staging"),
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            completion_workers: default_workers(),
            completion_queue_capacity: 64,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            staging_ttl_hours: 24,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port)?,
                cors_disabled: parse_var("CORS_DISABLED", defaults.server.cors_disabled)?,
            },
            storage: StorageConfig {
                root: env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.root),
                staging_dir: env::var("STAGING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.staging_dir),
            },
            upload: UploadConfig {
                completion_workers: parse_var(
                    "COMPLETION_WORKERS",
                    defaults.upload.completion_workers,
                )?
                .max(1),
                completion_queue_capacity: parse_var(
                    "COMPLETION_QUEUE_CAPACITY",
                    defaults.upload.completion_queue_capacity,
                )?
                .max(1),
                max_chunk_bytes: parse_var("MAX_CHUNK_BYTES", defaults.upload.max_chunk_bytes)?,
                staging_ttl_hours: parse_var(
                    "STAGING_TTL_HOURS",
                    defaults.upload.staging_ttl_hours,
                )?,
            },
        })
    }
}

/// One completion worker per available processor
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}
