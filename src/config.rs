// src/config.rs
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MODEL_FILE: &str = "digit_cnn.onnx";
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

const DEFAULT_ADDR: &str = "[::1]:50051";
const DEFAULT_MODEL_DIR: &str = "model";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FETCH_MAX_BYTES: usize = 8 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed model config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// What the classifier's output tensor holds.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Raw scores, softmax is applied after inference.
    #[default]
    Logits,
    /// Already a probability distribution.
    Probabilities,
}

/// Optional `model_config.json` next to the ONNX file.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub input_name: String,
    /// First graph output when unset.
    pub output_name: Option<String>,
    pub output_kind: OutputKind,
    pub model_version: String,
    /// Defaults to the number of CPUs.
    pub intra_threads: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_name: "input".to_string(),
            output_name: None,
            output_kind: OutputKind::Logits,
            model_version: "digit-cnn-v1".to_string(),
            intra_threads: None,
        }
    }
}

impl ModelConfig {
    /// Reads `model_config.json` from `model_dir`, falling back to defaults
    /// only when the file does not exist. Any other read failure is an error.
    pub fn load(model_dir: &Path) -> Result<Self, ConfigError> {
        let path = model_dir.join(MODEL_CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }
}

/// Process settings taken from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub model_dir: PathBuf,
    /// Whole-request deadline for `image_url` downloads.
    pub fetch_timeout: Duration,
    /// Largest image body accepted from an `image_url`.
    pub fetch_max_bytes: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr = lookup("DIGIT_ADDR")
            .unwrap_or_else(|| DEFAULT_ADDR.to_string())
            .parse()?;
        let model_dir = lookup("MODEL_DIR").unwrap_or_else(|| DEFAULT_MODEL_DIR.to_string());
        let fetch_timeout_secs = parse_or(&lookup, "DIGIT_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS)?;
        let fetch_max_bytes = parse_or(&lookup, "DIGIT_FETCH_MAX_BYTES", DEFAULT_FETCH_MAX_BYTES)?;
        Ok(Self {
            addr,
            model_dir: PathBuf::from(model_dir),
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            fetch_max_bytes,
        })
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(MODEL_FILE)
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}
