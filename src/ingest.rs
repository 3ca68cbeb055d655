//! Upload pipeline shared by the HTTP surface and the file watcher:
//! extract text, chunk, embed, and store.
//!
//! Embedding failures are non-fatal: affected chunks are stored without
//! vectors and picked up by lexical search until regenerated. De-duplication
//! by `FileHash` is the caller's concern; this pipeline treats every call as
//! an ordinary insert.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::embed_chunks;
use crate::error::{HarnessError, Result};
use crate::extract::extract_text;
use crate::models::{meta_keys, Chunk, Document};
use crate::providers::AiGateway;
use crate::store::DocumentStore;

#[derive(Clone)]
pub struct Ingestor {
    store: DocumentStore,
    gateway: Arc<AiGateway>,
    chunking: ChunkingConfig,
}

impl Ingestor {
    pub fn new(store: DocumentStore, gateway: Arc<AiGateway>, chunking: ChunkingConfig) -> Self {
        Self {
            store,
            gateway,
            chunking,
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Ingest one file's bytes as a new document.
    pub async fn ingest_bytes(
        &self,
        filename: &str,
        bytes: &[u8],
        uploaded_by: &str,
        language: Option<&str>,
        extra_metadata: HashMap<String, String>,
    ) -> Result<Document> {
        if uploaded_by.trim().is_empty() {
            return Err(HarnessError::validation("uploadedBy must not be empty"));
        }

        let extracted = extract_text(filename, bytes)?;
        let spans = chunk_text(&extracted.content, &self.chunking);
        if spans.is_empty() {
            return Err(HarnessError::DocumentSkipped(
                "no chunks produced from file".to_string(),
            ));
        }

        let doc_id = Uuid::new_v4();
        let mut chunks: Vec<Chunk> = spans
            .into_iter()
            .map(|span| Chunk {
                id: Uuid::new_v4(),
                document_id: doc_id,
                index: span.index,
                content: span.content,
                start_position: span.start,
                end_position: span.end,
                document_type: None,
                embedding: Vec::new(),
            })
            .collect();

        let outcome = embed_chunks(&self.gateway, &mut chunks).await;

        let mut metadata = extra_metadata;
        if let Some(language) = language {
            metadata.insert(meta_keys::LANGUAGE.to_string(), language.to_string());
        }

        let document = Document {
            id: doc_id,
            filename: filename.to_string(),
            content_type: extracted.content_type,
            uploaded_by: uploaded_by.to_string(),
            uploaded_at: Utc::now(),
            size_bytes: bytes.len() as i64,
            metadata,
            chunks,
        };

        self.store.upsert(&document).await?;
        info!(
            document = %document.id,
            filename,
            chunks = document.chunks.len(),
            embedded = outcome.embedded,
            pending = outcome.pending,
            "document ingested"
        );
        Ok(document)
    }
}
