use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/service.yaml";
pub const CONFIG_PATH_VAR: &str = "SIGNATURE_API_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidOverride { key: &'static str, value: String },
    #[error("match_threshold must be within [0, 1], got {0}")]
    ThresholdOutOfRange(f32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub models: ModelsConfig,
    pub match_threshold: f32,
    pub placeholder: PlaceholderConfig,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub cleaning_model_path: PathBuf,
    pub matching_model_path: PathBuf,
    /// Continue on placeholders when a model is missing or fails to load.
    pub error_bypass: bool,
    /// CUDA device index; negative selects the CPU.
    pub gpu_id: i64,
}

/// Simulated latency of the placeholder paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderConfig {
    pub clean_delay_ms: u64,
    pub match_delay_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            models: ModelsConfig::default(),
            match_threshold: 0.6,
            placeholder: PlaceholderConfig::default(),
            max_payload_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cleaning_model_path: PathBuf::from("models_weights/cyclegan_model.pth"),
            matching_model_path: PathBuf::from("models_weights/siamese_transformer.pth"),
            error_bypass: false,
            gpu_id: -1,
        }
    }
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            clean_delay_ms: 500,
            match_delay_ms: 200,
        }
    }
}

impl ServiceConfig {
    /// Reads the YAML file named by `SIGNATURE_API_CONFIG` (or the default
    /// path when it exists), then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR)
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });

        let mut config = match path {
            Some(path) => {
                log::info!("Loading service configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(config_str)?)
    }

    /// Applies environment-style overrides; `lookup` returns the raw value
    /// for a variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(flag) = lookup("MODEL_ERROR_BYPASS_FLAG") {
            self.models.error_bypass = flag.trim().eq_ignore_ascii_case("true");
        }
        if let Some(path) = lookup("CLEANING_MODEL_PATH") {
            self.models.cleaning_model_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("MATCHING_MODEL_PATH") {
            self.models.matching_model_path = PathBuf::from(path);
        }
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse_override("PORT", port)?;
        }
        if let Some(threshold) = lookup("MATCH_THRESHOLD") {
            self.match_threshold = parse_override("MATCH_THRESHOLD", threshold)?;
        }
        if let Some(gpu_id) = lookup("GPU_ID") {
            self.models.gpu_id = parse_override("GPU_ID", gpu_id)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.match_threshold));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_override<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride { key, value })
}
