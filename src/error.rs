//! Error taxonomy shared by every subsystem.
//!
//! Failures are classified once, close to where they happen, so the HTTP
//! layer and the orchestrator can decide what is retryable, what aborts a
//! query, and what merely degrades one source. Per-source failures (a single
//! database, MCP server, or provider) stay inside their result sections and
//! never abort the whole query.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Bad input: missing session id, invalid SQL, path traversal. Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Document, session, or database unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient AI/DB/MCP failure, already past its retry budget.
    #[error("provider: {0}")]
    Provider(String),

    /// SQL failed catalog validation for one database.
    #[error("schema: {0}")]
    Schema(String),

    /// A per-database or per-probe deadline expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The file has no indexable content. Terminal, never retried.
    #[error("document skipped: {0}")]
    DocumentSkipped(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Unexpected orchestrator-level failure.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl HarnessError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }
}

impl From<reqwest::Error> for HarnessError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else {
            Self::Provider(e.to_string())
        }
    }
}
