use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Workspace configuration, loaded from `config/embeddings.yml`.
///
/// Every section has serde defaults so a missing or partial file still
/// produces a usable configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub hub: Option<HubConfig>,
    #[serde(default)]
    pub oci: OciConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"http"` for a remote embedder, `"stub"` for the deterministic
    /// offline embedder (tests, air-gapped builds).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embed_url")]
    pub url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Required for the stub provider; for http it is learned from the
    /// first response and checked against the manifest.
    #[serde(default)]
    pub dim: Option<usize>,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Bounded worker pool for concurrent embed batches.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_embed_url(),
            model: default_model(),
            dim: None,
            max_seq_length: default_max_seq_length(),
            normalize: true,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
            workers: default_workers(),
        }
    }
}

fn default_provider() -> String {
    "http".to_string()
}
fn default_embed_url() -> String {
    "http://127.0.0.1:8876".to_string()
}
fn default_model() -> String {
    "jinaai/jina-embeddings-v2-base-code".to_string()
}
fn default_max_seq_length() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    120
}
fn default_workers() -> usize {
    8
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_tokens")]
    pub chunk_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_hard_cap_tokens")]
    pub hard_cap_tokens: usize,
    #[serde(default)]
    pub include_source_preamble: bool,
    #[serde(default)]
    pub hierarchical: bool,
    #[serde(default = "default_micro_chunk_tokens")]
    pub micro_chunk_tokens: usize,
    #[serde(default = "default_true")]
    pub emit_parent_chunks: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: default_chunk_tokens(),
            overlap_tokens: default_overlap_tokens(),
            hard_cap_tokens: default_hard_cap_tokens(),
            include_source_preamble: false,
            hierarchical: false,
            micro_chunk_tokens: default_micro_chunk_tokens(),
            emit_parent_chunks: true,
        }
    }
}

fn default_chunk_tokens() -> usize {
    256
}
fn default_overlap_tokens() -> usize {
    32
}
fn default_hard_cap_tokens() -> usize {
    512
}
fn default_micro_chunk_tokens() -> usize {
    64
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    /// `faiss-flatip`, `bm25`, or `hybrid-rrf`.
    #[serde(default = "default_indexer")]
    pub indexer: String,
    /// `none` or `token-diversity`.
    #[serde(default = "default_reranker")]
    pub reranker: String,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            indexer: default_indexer(),
            reranker: default_reranker(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_indexer() -> String {
    "faiss-flatip".to_string()
}
fn default_reranker() -> String {
    "none".to_string()
}
fn default_max_context_tokens() -> usize {
    6000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Byte quota for the content-addressed object cache.
    #[serde(default = "default_objects_quota")]
    pub objects_quota_bytes: u64,
    /// Byte quota for the workspace embedding cache.
    #[serde(default = "default_embed_quota")]
    pub embed_quota_bytes: u64,
    /// Enable the cross-packet workspace embedding cache.
    #[serde(default)]
    pub workspace_embed_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            objects_quota_bytes: default_objects_quota(),
            embed_quota_bytes: default_embed_quota(),
            workspace_embed_cache: false,
        }
    }
}

fn default_objects_quota() -> u64 {
    4 * 1024 * 1024 * 1024
}
fn default_embed_quota() -> u64 {
    512 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    pub url: String,
    #[serde(default)]
    pub enforce_remote_policy: bool,
    #[serde(default = "default_hub_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_hub_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OciConfig {
    /// Registry hosts allowed for `oci://` sources; empty means any.
    #[serde(default)]
    pub allowed_registries: Vec<String>,
    #[serde(default = "default_oci_timeout_secs")]
    pub timeout_secs: u64,
    /// Known signature issuers: keyid → shared verification key.
    #[serde(default)]
    pub issuers: std::collections::BTreeMap<String, String>,
    /// Use plain http instead of https (local test registries).
    #[serde(default)]
    pub insecure: bool,
}

fn default_oci_timeout_secs() -> u64 {
    300
}

/// Load configuration from a YAML file, falling back to defaults when the
/// file does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_tokens == 0 {
        anyhow::bail!("chunking.chunk_tokens must be > 0");
    }
    if config.chunking.hard_cap_tokens < config.chunking.chunk_tokens {
        anyhow::bail!("chunking.hard_cap_tokens must be >= chunking.chunk_tokens");
    }
    if config.chunking.overlap_tokens >= config.chunking.chunk_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.chunk_tokens");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.workers == 0 {
        anyhow::bail!("embedding.workers must be > 0");
    }
    match config.embedding.provider.as_str() {
        "http" => {}
        "stub" => {
            if config.embedding.dim.unwrap_or(0) == 0 {
                anyhow::bail!("embedding.dim must be > 0 when provider is 'stub'");
            }
        }
        other => anyhow::bail!("Unknown embedding provider: '{}'. Must be http or stub.", other),
    }
    match config.retrieval.indexer.as_str() {
        "faiss-flatip" | "bm25" | "hybrid-rrf" => {}
        other => anyhow::bail!(
            "Unknown indexer: '{}'. Must be faiss-flatip, bm25, or hybrid-rrf.",
            other
        ),
    }
    Ok(())
}
