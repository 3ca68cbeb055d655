//! Configuration parsing and validation.
//!
//! The harness is configured via a TOML file (default: `config/rag.toml`).
//! The config defines the HTTP bind address and base path, the AI provider
//! chain (primary + fallbacks, retry policy), chunking parameters, storage
//! paths, conversation limits, routing thresholds, feature toggles, and the
//! three external source families: live databases, MCP tool servers, and
//! watched folders.
//!
//! Options are immutable after load; every component receives a snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::DatabaseKind;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub ai: AiConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub databases: Vec<DatabaseConnectionConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub watched_folders: Vec<WatchedFolderConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

fn default_base_path() -> String {
    "/smartrag".to_string()
}

// ============ AI providers ============

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPolicyKind {
    Fixed,
    Linear,
    ExponentialBackoff,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AiProviderConfig {
    /// `"openai"` (any OpenAI-compatible endpoint) or `"ollama"`.
    pub provider: String,
    pub model: String,
    pub embedding_model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key, when the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub system_message: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Minimum spacing between embedding requests. 0 disables the limiter.
    #[serde(default)]
    pub embedding_min_interval_ms: u64,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AiConfig {
    #[serde(flatten)]
    pub primary: AiProviderConfig,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_policy")]
    pub retry_policy: RetryPolicyKind,
    #[serde(default)]
    pub enable_fallback_providers: bool,
    /// Tried in order, once each, after the primary exhausts its retries.
    #[serde(default)]
    pub fallback: Vec<AiProviderConfig>,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_embedding_batch_size() -> usize {
    64
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_retry_policy() -> RetryPolicyKind {
    RetryPolicyKind::ExponentialBackoff
}

// ============ Chunking ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// How far back from the hard window end a boundary may be found.
    #[serde(default = "default_boundary_lookback")]
    pub boundary_lookback: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            boundary_lookback: default_boundary_lookback(),
        }
    }
}

fn default_min_chunk_size() -> usize {
    100
}
fn default_max_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_boundary_lookback() -> usize {
    80
}

// ============ Storage / conversation ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConversationConfig {
    /// Histories longer than this lose their oldest turns.
    #[serde(default = "default_max_conversation_length")]
    pub max_conversation_length: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_conversation_length: default_max_conversation_length(),
        }
    }
}

fn default_max_conversation_length() -> usize {
    16_000
}

// ============ Routing ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RoutingConfig {
    /// Below this intent confidence, a query with no database rows routes to
    /// documents.
    #[serde(default = "default_confidence_threshold")]
    pub intent_confidence_threshold: f32,
    /// When the document-overlap check itself fails, assume documents can
    /// answer.
    #[serde(default = "default_true")]
    pub assume_documents_on_error: bool,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            intent_confidence_threshold: default_confidence_threshold(),
            assume_documents_on_error: true,
            max_results: default_max_results(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_confidence_threshold() -> f32 {
    0.6
}
fn default_true() -> bool {
    true
}
fn default_max_results() -> usize {
    5
}
fn default_query_timeout_secs() -> u64 {
    30
}

// ============ Features ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FeatureConfig {
    #[serde(default = "default_true")]
    pub documents: bool,
    #[serde(default = "default_true")]
    pub databases: bool,
    /// One switch for the MCP client and MCP search.
    #[serde(default)]
    pub mcp: bool,
    #[serde(default)]
    pub file_watcher: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            documents: true,
            databases: true,
            mcp: false,
            file_watcher: false,
        }
    }
}

// ============ External sources ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConnectionConfig {
    /// Auto-generated from `name` when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub kind: DatabaseKind,
    pub connection_string: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,
}

fn default_max_rows() -> u32 {
    100
}

impl DatabaseConnectionConfig {
    /// Stable identifier: the explicit id, or a slug of the name.
    pub fn effective_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| slugify(&self.name))
    }
}

/// Lowercase alphanumeric slug, non-alphanumeric runs collapsed to `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct McpServerConfig {
    pub server_id: String,
    /// Absolute HTTP(S) URL of the JSON-RPC endpoint.
    pub endpoint: String,
    #[serde(default)]
    pub auto_connect: bool,
    /// Opaque header values forwarded on every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchedFolderConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub subdirectories: bool,
    /// Lowercase extensions without the dot, e.g. `["pdf", "txt"]`.
    /// Empty means every supported extension.
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

// ============ Loading ============

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let c = &config.chunking;
    if c.max_chunk_size == 0 {
        anyhow::bail!("chunking.max_chunk_size must be > 0");
    }
    if c.chunk_overlap >= c.max_chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.max_chunk_size");
    }
    if c.min_chunk_size > c.max_chunk_size {
        anyhow::bail!("chunking.min_chunk_size must be <= chunking.max_chunk_size");
    }

    if !(0.0..=1.0).contains(&config.routing.intent_confidence_threshold) {
        anyhow::bail!("routing.intent_confidence_threshold must be in [0.0, 1.0]");
    }

    match config.ai.primary.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!("Unknown AI provider: '{}'. Must be openai or ollama.", other),
    }
    for fb in &config.ai.fallback {
        match fb.provider.as_str() {
            "openai" | "ollama" => {}
            other => anyhow::bail!("Unknown fallback provider: '{}'", other),
        }
    }

    let mut seen = std::collections::HashSet::new();
    for db in &config.databases {
        if db.name.trim().is_empty() {
            anyhow::bail!("databases entries need a non-empty name");
        }
        if !seen.insert(db.effective_id()) {
            anyhow::bail!("duplicate database id: {}", db.effective_id());
        }
    }

    for server in &config.mcp_servers {
        if server.server_id.trim().is_empty() {
            anyhow::bail!("mcp_servers entries need a server_id");
        }
    }

    Ok(())
}
