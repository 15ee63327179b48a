//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.uwtriage.toml` files.

use crate::chunking::DEFAULT_MAX_CHUNK_BYTES;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = ".uwtriage.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Pretty-print unit output.
    #[serde(default)]
    pub pretty: bool,
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model for analysis, detection, scoring and triage.
    #[serde(default = "default_model")]
    pub name: String,

    /// Multimodal model for classification and extraction.
    #[serde(default = "default_vision_model")]
    pub vision_name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Upper bound on model turns per agent invocation.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Tool exchanges kept in context.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            vision_name: default_vision_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            max_iterations: default_max_iterations(),
            max_context_messages: default_max_context_messages(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_vision_model() -> String {
    "llama3.2-vision:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    900
}

fn default_max_iterations() -> usize {
    50
}

fn default_max_context_messages() -> usize {
    10
}

/// Where job records, blobs and rendered pages live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("uwtriage-data")
}

impl StorageConfig {
    /// SQLite database of job records.
    pub fn jobs_db(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    /// Root of pre-rendered page images, laid out by document key.
    pub fn pages_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pages per extraction batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Size bound for analysis and detection chunks.
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,

    /// Refuse status transitions that move backwards.
    #[serde(default)]
    pub strict_transitions: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_chunk_bytes: default_max_chunk_bytes(),
            strict_transitions: false,
        }
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_max_chunk_bytes() -> usize {
    DEFAULT_MAX_CHUNK_BYTES
}

/// Underwriting manual retrieval service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    /// Retrieval endpoint; lookups answer "not configured" when unset.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    1
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref vision) = args.vision_model {
            self.model.vision_name = vision.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(temperature) = args.temperature {
            self.model.temperature = temperature;
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }
        if let Some(ref data_dir) = args.data_dir {
            self.storage.data_dir = data_dir.clone();
        }
        if let Some(url) = args.kb_url.as_ref() {
            self.knowledge_base.url = Some(url.clone());
        }

        if args.strict {
            self.pipeline.strict_transitions = true;
        }
        if args.verbose {
            self.general.verbose = true;
        }
        if args.pretty {
            self.general.pretty = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
