use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the database path when no config file is given.
pub const ENV_DB_PATH: &str = "IDX_DB_PATH";
/// Environment variable holding the API key for the HTTP embedding provider.
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
/// Environment variable overriding the embeddings endpoint base URL.
pub const ENV_BASE_URL: &str = "IDX_EMBEDDINGS_BASE_URL";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

fn default_max_chunk_bytes() -> usize {
    2800
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of the BM25 signal in hybrid scoring: `α·bm25 + (1−α)·cos`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_k")]
    pub k: i64,
    #[serde(default = "default_bm25_k")]
    pub bm25_k: i64,
    #[serde(default = "default_vector_k")]
    pub vector_k: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            k: default_k(),
            bm25_k: default_bm25_k(),
            vector_k: default_vector_k(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_k() -> i64 {
    10
}
fn default_bm25_k() -> i64 {
    80
}
fn default_vector_k() -> i64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"local"` (deterministic, no network) or `"openai"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// OpenAI-compatible endpoint base URL; overridable via `IDX_EMBEDDINGS_BASE_URL`.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    128
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Config {
    /// Build a config from the environment alone: `IDX_DB_PATH` (default
    /// `./data/idx.sqlite`) plus defaults everywhere else. The embedding
    /// provider falls back to the local deterministic one when no API key
    /// is present.
    pub fn from_env() -> Self {
        let path = std::env::var(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/idx.sqlite"));

        let mut embedding = EmbeddingConfig::default();
        if std::env::var(ENV_API_KEY).is_ok() {
            embedding.provider = "openai".to_string();
            embedding.model = Some("text-embedding-3-small".to_string());
            embedding.dims = Some(1536);
        }

        Self {
            db: DbConfig { path },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding,
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_chunk_bytes == 0 {
        anyhow::bail!("chunking.max_chunk_bytes must be > 0");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.k < 1 {
        anyhow::bail!("retrieval.k must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "local" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local or openai.",
            other
        ),
    }

    if config.embedding.provider == "openai" {
        if config.embedding.model.is_none() {
            anyhow::bail!("embedding.model must be specified when provider is 'openai'");
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
        }
    }

    Ok(config)
}
