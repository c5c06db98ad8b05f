use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the ragchat gateway.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Base URL of the RAG pipeline service that performs ingestion and question answering.
    pub rag_pipeline_url: String,
    /// Optional API key required to access the pipeline service.
    pub rag_pipeline_api_key: Option<String>,
    /// Directory holding the interaction journal.
    pub data_dir: PathBuf,
    /// Scratch directory for uploaded files awaiting ingestion.
    pub upload_dir: PathBuf,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            rag_pipeline_url: load_env("RAG_PIPELINE_URL")?,
            rag_pipeline_api_key: load_env_optional("RAG_PIPELINE_API_KEY"),
            data_dir: load_env_optional("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            upload_dir: load_env_optional("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tmp_uploads")),
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }

    /// Path of the JSON file backing the interaction journal.
    pub fn conversations_file(&self) -> PathBuf {
        self.data_dir.join("conversations.json")
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        pipeline_url = %config.rag_pipeline_url,
        data_dir = %config.data_dir.display(),
        upload_dir = %config.upload_dir.display(),
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
