//! Core data models used throughout the harness.
//!
//! These types represent the documents, chunks, conversation turns, query
//! intents, and answer provenance that flow through the ingestion and
//! retrieval pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved metadata keys on documents.
pub mod meta_keys {
    pub const FILE_HASH: &str = "FileHash";
    pub const FILE_PATH: &str = "FilePath";
    pub const COLLECTION_NAME: &str = "CollectionName";
    pub const DOCUMENT_TYPE: &str = "documentType";
    pub const DATABASE_TYPE: &str = "databaseType";
    pub const LANGUAGE: &str = "Language";

    /// `documentType` value that marks a catalog excerpt.
    pub const SCHEMA_DOCUMENT: &str = "Schema";
}

/// A stored document and its chunks. The document exclusively owns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub size_bytes: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Sorted by `index`; indices are contiguous from 0.
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

impl Document {
    pub fn is_schema_document(&self) -> bool {
        self.metadata.get(meta_keys::DOCUMENT_TYPE).map(String::as_str)
            == Some(meta_keys::SCHEMA_DOCUMENT)
    }
}

/// A contiguous span of a document's text, the unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// 0-based, contiguous within the document.
    pub index: i64,
    pub content: String,
    /// Character offset of the first character in the original text.
    pub start_position: usize,
    /// Character offset one past the last character. Always > `start_position`.
    pub end_position: usize,
    #[serde(default)]
    pub document_type: Option<String>,
    /// Empty when the embedding is missing or failed; such chunks are
    /// candidates for regeneration. Never partially assigned.
    #[serde(default)]
    pub embedding: Vec<f32>,
}

impl Chunk {
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }
}

/// Provenance record attached to an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    #[serde(flatten)]
    pub detail: SourceDetail,
    /// Relevance in `[0.0, 1.0]`.
    pub relevance: f32,
    /// Human-readable excerpt of the cited material.
    pub excerpt: String,
    /// Display location, e.g. `"chars 120-540"` or `"row 3"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceDetail {
    Document {
        document_id: Uuid,
        filename: String,
        chunk_index: i64,
        start_position: usize,
        end_position: usize,
    },
    Image {
        document_id: Uuid,
        filename: String,
        chunk_index: i64,
        start_position: usize,
        end_position: usize,
    },
    Audio {
        document_id: Uuid,
        filename: String,
        chunk_index: i64,
        /// `[start, end]` playback interval in seconds.
        seconds: [f32; 2],
    },
    Database {
        database_id: String,
        database_name: String,
        tables: Vec<String>,
        sql: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row: Option<u64>,
    },
    System {
        origin: String,
    },
}

impl Source {
    /// Stable identity used as the tie-break when relevance scores are equal.
    pub fn sort_id(&self) -> String {
        match &self.detail {
            SourceDetail::Document {
                document_id,
                chunk_index,
                ..
            }
            | SourceDetail::Image {
                document_id,
                chunk_index,
                ..
            }
            | SourceDetail::Audio {
                document_id,
                chunk_index,
                ..
            } => format!("{document_id}:{chunk_index:08}"),
            SourceDetail::Database { database_id, .. } => format!("db:{database_id}"),
            SourceDetail::System { origin } => format!("sys:{origin}"),
        }
    }
}

/// Sort sources by relevance descending, stable id tie-break.
pub fn sort_sources(sources: &mut [Source]) {
    sources.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.sort_id().cmp(&b.sort_id()))
    });
}

// ============ Database schema catalog ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseKind {
    #[serde(rename = "sqlite", alias = "SQLite")]
    Sqlite,
    #[serde(rename = "sqlserver", alias = "SqlServer", alias = "mssql")]
    SqlServer,
    #[serde(rename = "mysql", alias = "MySQL")]
    MySql,
    #[serde(rename = "postgresql", alias = "PostgreSQL", alias = "postgres")]
    PostgreSql,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Sqlite => "sqlite",
            DatabaseKind::SqlServer => "sqlserver",
            DatabaseKind::MySql => "mysql",
            DatabaseKind::PostgreSql => "postgresql",
        }
    }

    /// PostgreSQL resolves identifiers case-sensitively; the others do not.
    pub fn case_sensitive(&self) -> bool {
        matches!(self, DatabaseKind::PostgreSql)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    /// Case-preserved; matching rules depend on the dialect.
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyRef>,
    pub row_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_data: Option<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str, case_sensitive: bool) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| {
            if case_sensitive {
                c.name == name
            } else {
                c.name.eq_ignore_ascii_case(name)
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSchemaInfo {
    pub id: String,
    pub name: String,
    pub kind: DatabaseKind,
    pub analyzed_at: DateTime<Utc>,
    pub tables: Vec<TableSchema>,
    pub total_row_count: u64,
    pub status: AnalysisStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DatabaseSchemaInfo {
    /// Look a table up under the dialect's case rules.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        let sensitive = self.kind.case_sensitive();
        self.tables.iter().find(|t| {
            if sensitive {
                t.name == name
            } else {
                t.name.eq_ignore_ascii_case(name)
            }
        })
    }

    /// Case-insensitive lookup, for producing case-mismatch hints.
    pub fn table_any_case(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

// ============ Query intent ============

/// Per-database routing produced by the intent analyzer. SQL is filled in
/// later by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseQueryIntent {
    pub database_id: String,
    pub database_name: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub purpose: String,
    /// Higher first in the merged answer.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryIntent {
    pub query: String,
    pub understanding: String,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    pub reasoning: String,
    #[serde(default)]
    pub requires_cross_database_join: bool,
    #[serde(default)]
    pub databases: Vec<DatabaseQueryIntent>,
}

// ============ Responses ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub document_search_performed: bool,
    pub document_results_found: u64,
    pub database_search_performed: bool,
    pub database_results_found: u64,
    pub mcp_search_performed: bool,
    pub mcp_results_found: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    pub ai_provider: String,
    pub storage_provider: String,
    pub model: String,
}

/// The answer returned to the caller, with provenance and routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResponse {
    pub query: String,
    pub answer: String,
    pub sources: Vec<Source>,
    pub searched_at: DateTime<Utc>,
    pub configuration: ResponseConfig,
    pub search_metadata: SearchMetadata,
}

/// Session summary for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub turn_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_source(relevance: f32, id: Uuid, chunk: i64) -> Source {
        Source {
            detail: SourceDetail::Document {
                document_id: id,
                filename: "a.txt".into(),
                chunk_index: chunk,
                start_position: 0,
                end_position: 10,
            },
            relevance,
            excerpt: String::new(),
            location: None,
        }
    }

    #[test]
    fn test_sources_sorted_by_relevance_then_id() {
        let id_a = Uuid::nil();
        let id_b = Uuid::new_v4();
        let mut sources = vec![
            doc_source(0.5, id_b, 2),
            doc_source(0.9, id_a, 0),
            doc_source(0.5, id_a, 1),
        ];
        sort_sources(&mut sources);
        assert!((sources[0].relevance - 0.9).abs() < 1e-6);
        // Equal scores: nil UUID sorts before the random one.
        assert_eq!(sources[1].sort_id(), format!("{id_a}:{:08}", 1));
    }

    #[test]
    fn test_schema_table_case_rules() {
        let info = DatabaseSchemaInfo {
            id: "hr".into(),
            name: "HR".into(),
            kind: DatabaseKind::PostgreSql,
            analyzed_at: Utc::now(),
            tables: vec![TableSchema {
                name: "Users".into(),
                columns: vec![],
                primary_keys: vec![],
                foreign_keys: vec![],
                row_count: 0,
                sample_data: None,
            }],
            total_row_count: 0,
            status: AnalysisStatus::Completed,
            error: None,
        };
        assert!(info.table("users").is_none());
        assert!(info.table("Users").is_some());
        assert!(info.table_any_case("users").is_some());

        let mut insensitive = info.clone();
        insensitive.kind = DatabaseKind::MySql;
        assert!(insensitive.table("users").is_some());
    }

    #[test]
    fn test_schema_document_marker() {
        let mut doc = Document {
            id: Uuid::new_v4(),
            filename: "hr.schema.md".into(),
            content_type: "text/markdown".into(),
            uploaded_by: "system".into(),
            uploaded_at: Utc::now(),
            size_bytes: 0,
            metadata: HashMap::new(),
            chunks: vec![],
        };
        assert!(!doc.is_schema_document());
        doc.metadata.insert(
            meta_keys::DOCUMENT_TYPE.into(),
            meta_keys::SCHEMA_DOCUMENT.into(),
        );
        assert!(doc.is_schema_document());
    }
}
