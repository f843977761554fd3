use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

/// Prefix for environment overrides, e.g. `IMAGE_INDEXER__PINECONE__API_KEY`
const ENV_PREFIX: &str = "IMAGE_INDEXER";

/// Worker configuration, loaded once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default = "default_ollama")]
    pub ollama: OllamaConfig,

    #[serde(default = "default_embeddings")]
    pub embeddings: EmbeddingsConfig,

    #[serde(default = "default_pinecone")]
    pub pinecone: PineconeConfig,

    #[serde(default = "default_worker")]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Record store (SQLite) configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Database file shared with the upload service. Required.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Where uploaded files live on disk
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Base directory for relative record paths. The upload service stores
    /// paths relative to its own working directory.
    #[serde(default)]
    pub uploads_root: Option<PathBuf>,
}

/// Ollama configuration (vision model and embedding host)
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    /// Vision model used for captioning (e.g., llava, moondream)
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_caption_prompt")]
    pub caption_prompt: String,

    /// Upper bound on generated caption tokens
    #[serde(default = "default_max_caption_tokens")]
    pub max_caption_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Embeddings configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector length shared by the model, the index and the `embedding` column
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

/// Pinecone vector index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PineconeConfig {
    /// Required.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Required.
    #[serde(default)]
    pub index_name: Option<String>,

    /// Data-plane host. Resolved through the control plane when unset.
    #[serde(default)]
    pub index_host: Option<String>,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_control_plane_url")]
    pub control_plane_url: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_pinecone_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Poll loop delays
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Wait after the store could not be reached
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Wait between polls when no record is pending
    #[serde(default = "default_idle_delay_secs")]
    pub idle_delay_secs: u64,

    /// Wait after an unexpected failure in a poll cycle
    #[serde(default = "default_fault_delay_secs")]
    pub fault_delay_secs: u64,
}

impl WorkerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.idle_delay_secs)
    }

    pub fn fault_delay(&self) -> Duration {
        Duration::from_secs(self.fault_delay_secs)
    }
}

/// Log output configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the compact human format
    #[serde(default)]
    pub json: bool,
}

impl AppConfig {
    /// Load from `config.{toml,yaml,json}` (optional) and `IMAGE_INDEXER__*` env vars
    pub fn load() -> ServiceResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> ServiceResult<Self> {
        let config: AppConfig = builder
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build config: {}", e),
            })?
            .try_deserialize()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to deserialize config: {}", e),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations missing settings the worker cannot run without
    pub fn validate(&self) -> ServiceResult<()> {
        let mut missing = Vec::new();

        if self.store.database_path.is_none() {
            missing.push("store.database_path");
        }
        if is_blank(self.pinecone.api_key.as_deref()) {
            missing.push("pinecone.api_key");
        }
        if is_blank(self.pinecone.index_name.as_deref()) {
            missing.push("pinecone.index_name");
        }

        if !missing.is_empty() {
            return Err(ServiceError::Config {
                message: format!("Missing required settings: {}", missing.join(", ")),
            });
        }

        if self.embeddings.dimensions == 0 {
            return Err(ServiceError::Config {
                message: "embeddings.dimensions must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Database path; only valid after `validate`
    pub fn database_path(&self) -> ServiceResult<&Path> {
        self.store
            .database_path
            .as_deref()
            .ok_or_else(|| ServiceError::Config {
                message: "Missing required settings: store.database_path".to_string(),
            })
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

// ==================== Default Value Functions ====================

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_ollama() -> OllamaConfig {
    OllamaConfig {
        base_url: default_ollama_url(),
        vision_model: default_vision_model(),
        caption_prompt: default_caption_prompt(),
        max_caption_tokens: default_max_caption_tokens(),
        temperature: default_temperature(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_vision_model() -> String {
    "llava".to_string()
}

fn default_caption_prompt() -> String {
    "Describe this image in one short sentence. \
    Mention the main subject and what it is doing."
        .to_string()
}

fn default_max_caption_tokens() -> u32 {
    60
}

fn default_temperature() -> f32 {
    0.3
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_embeddings() -> EmbeddingsConfig {
    EmbeddingsConfig {
        model: default_embedding_model(),
        dimensions: default_dimensions(),
    }
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_dimensions() -> usize {
    768
}

fn default_pinecone() -> PineconeConfig {
    PineconeConfig {
        api_key: None,
        index_name: None,
        index_host: None,
        namespace: None,
        control_plane_url: default_control_plane_url(),
        api_version: default_api_version(),
        request_timeout_secs: default_pinecone_timeout_secs(),
    }
}

fn default_control_plane_url() -> String {
    "https://api.pinecone.io".to_string()
}

fn default_api_version() -> String {
    "2024-07".to_string()
}

fn default_pinecone_timeout_secs() -> u64 {
    30
}

fn default_worker() -> WorkerConfig {
    WorkerConfig {
        reconnect_delay_secs: default_reconnect_delay_secs(),
        idle_delay_secs: default_idle_delay_secs(),
        fault_delay_secs: default_fault_delay_secs(),
    }
}

fn default_reconnect_delay_secs() -> u64 {
    10
}

fn default_idle_delay_secs() -> u64 {
    2
}

fn default_fault_delay_secs() -> u64 {
    5
}
