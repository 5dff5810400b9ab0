use crate::core::errors::ConfigError;
use crate::services::archive::ArchiveLimits;
use crate::services::segmentation::MaskValues;
use std::env;
use std::path::{Path, PathBuf};
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    /// Overrides the origin derived from the request's Host header
    pub public_base_url: Option<String>,
}

/// Segmentation model configuration
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_path: String,
    pub input_name: String,
    pub output_name: String,
    pub mask_values: MaskValues,
    pub inference_backend: Option<String>,
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub media_root: PathBuf,
    pub media_url: String,
    /// Parent directory for archive scratch areas (system temp dir when unset)
    pub scratch_dir: Option<PathBuf>,
}

/// Request limits
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_upload_mb: usize,
    /// Entries allowed in one uploaded archive
    pub max_archive_entries: usize,
    /// Total uncompressed size allowed for one uploaded archive
    pub max_archive_mb: u64,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with every path rooted under `media_root`. Used by tests and tools.
    pub fn with_media_root(media_root: impl AsRef<Path>) -> Self {
        Self {
            server: ServerConfig {
                port: 8000,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
                public_base_url: None,
            },
            model: ModelConfig {
                model_path: "models/unet.onnx".to_string(),
                input_name: "input".to_string(),
                output_name: "output".to_string(),
                mask_values: MaskValues::default(),
                inference_backend: None,
            },
            storage: StorageConfig {
                media_root: media_root.as_ref().to_path_buf(),
                media_url: "/media/".to_string(),
                scratch_dir: None,
            },
            limits: LimitsConfig {
                max_upload_mb: 200,
                max_archive_entries: 10_000,
                max_archive_mb: 1024,
            },
        }
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let mask_values = match env::var("MASK_VALUES") {
            Ok(raw) if !raw.trim().is_empty() => MaskValues::from_json(&raw)?,
            _ => MaskValues::default(),
        };

        let port = match env::var("SERVER_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::EnvVarError(format!("SERVER_PORT={}", raw)))?,
            Err(_) => 8000,
        };

        Ok(Self {
            server: ServerConfig {
                port,
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .ok()
                    .map(|s| s.trim().trim_end_matches('/').to_string())
                    .filter(|s| !s.is_empty()),
            },
            model: ModelConfig {
                model_path: env::var("MODEL_PATH")
                    .unwrap_or_else(|_| "models/unet.onnx".to_string()),
                input_name: env::var("MODEL_INPUT_NAME").unwrap_or_else(|_| "input".to_string()),
                output_name: env::var("MODEL_OUTPUT_NAME")
                    .unwrap_or_else(|_| "output".to_string()),
                mask_values,
                inference_backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
            },
            storage: StorageConfig {
                media_root: env::var("MEDIA_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("media")),
                media_url: env::var("MEDIA_URL").unwrap_or_else(|_| "/media/".to_string()),
                scratch_dir: env::var("SCRATCH_DIR")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from),
            },
            limits: LimitsConfig {
                max_upload_mb: env::var("MAX_UPLOAD_MB")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(200),
                max_archive_entries: env::var("MAX_ARCHIVE_ENTRIES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10_000),
                max_archive_mb: env::var("MAX_ARCHIVE_MB")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1024),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.input_name.trim().is_empty() || self.model.output_name.trim().is_empty() {
            return Err(ConfigError::InvalidModelConfig(
                "model input/output names must not be empty".to_string(),
            ));
        }

        if self.model.mask_values.is_empty() {
            return Err(ConfigError::InvalidMaskValues(
                "at least one class value is required".to_string(),
            ));
        }

        let media_url = &self.storage.media_url;
        if media_url.len() < 3 || !media_url.starts_with('/') || !media_url.ends_with('/') {
            return Err(ConfigError::InvalidStorageConfig(format!(
                "MEDIA_URL must be a non-root path starting and ending with '/', got {}",
                self.storage.media_url
            )));
        }

        if let Some(scratch) = &self.storage.scratch_dir {
            if !scratch.is_dir() {
                return Err(ConfigError::InvalidStorageConfig(format!(
                    "SCRATCH_DIR does not exist: {}",
                    scratch.display()
                )));
            }
        }

        if let Some(base) = &self.server.public_base_url {
            url::Url::parse(base).map_err(|e| {
                ConfigError::InvalidStorageConfig(format!("PUBLIC_BASE_URL {}: {}", base, e))
            })?;
        }

        if self.limits.max_upload_mb == 0 {
            return Err(ConfigError::InvalidUploadLimit(self.limits.max_upload_mb));
        }

        if self.limits.max_archive_entries == 0 {
            return Err(ConfigError::InvalidArchiveLimit(
                "MAX_ARCHIVE_ENTRIES=0".to_string(),
            ));
        }
        if self.limits.max_archive_mb == 0 {
            return Err(ConfigError::InvalidArchiveLimit("MAX_ARCHIVE_MB=0".to_string()));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn media_root(&self) -> &Path {
        &self.storage.media_root
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.limits.max_upload_mb * 1024 * 1024
    }

    pub fn archive_limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_entries: self.limits.max_archive_entries,
            max_total_bytes: self.limits.max_archive_mb.saturating_mul(1024 * 1024),
        }
    }
}
