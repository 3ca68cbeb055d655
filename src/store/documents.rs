//! Document repository: upsert, retrieval, deletion, and chunk search.
//!
//! Search is semantic when a query embedding is available (cosine similarity
//! over stored vectors, ties broken by `(document_id, chunk_index)`
//! ascending) and falls back to lexical token matching with OCR-tolerant
//! variants otherwise. Hybrid callers run semantic first and fill with
//! lexical hits.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{HarnessError, Result};
use crate::models::{meta_keys, Chunk, Document};
use crate::text;

/// A chunk with its retrieval score and parent-document display fields.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub document_id: Uuid,
    pub filename: String,
    pub chunk_index: i64,
    pub content: String,
    pub start_position: usize,
    pub end_position: usize,
    /// Normalized to `[0.0, 1.0]`.
    pub score: f32,
}

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a document with its chunks and embeddings in one
    /// transaction.
    pub async fn upsert(&self, document: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, content_type, uploaded_by, uploaded_at, size_bytes, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                uploaded_by = excluded.uploaded_by,
                uploaded_at = excluded.uploaded_at,
                size_bytes = excluded.size_bytes,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(document.id.to_string())
        .bind(&document.filename)
        .bind(&document.content_type)
        .bind(&document.uploaded_by)
        .bind(document.uploaded_at.to_rfc3339())
        .bind(document.size_bytes)
        .bind(serde_json::to_string(&document.metadata)?)
        .execute(&mut *tx)
        .await?;

        let doc_id = document.id.to_string();
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;

        for chunk in &document.chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, content, start_position, end_position, document_type)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(chunk.id.to_string())
            .bind(&doc_id)
            .bind(chunk.index)
            .bind(&chunk.content)
            .bind(chunk.start_position as i64)
            .bind(chunk.end_position as i64)
            .bind(&chunk.document_type)
            .execute(&mut *tx)
            .await?;

            if chunk.has_embedding() {
                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, document_id, embedding) VALUES (?, ?, ?)",
                )
                .bind(chunk.id.to_string())
                .bind(&doc_id)
                .bind(vec_to_blob(&chunk.embedding))
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch a document summary without its chunks.
    pub async fn get(&self, id: Uuid) -> Result<Document> {
        let row = sqlx::query(
            "SELECT id, filename, content_type, uploaded_by, uploaded_at, size_bytes, metadata_json FROM documents WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| HarnessError::not_found(format!("document {id}")))?;

        document_from_row(&row)
    }

    /// Fetch a document's chunks ordered by index, embeddings included.
    pub async fn get_chunks(&self, id: Uuid) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.chunk_index, c.content,
                   c.start_position, c.end_position, c.document_type,
                   v.embedding
            FROM chunks c
            LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
            WHERE c.document_id = ?
            ORDER BY c.chunk_index ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    /// Paged listing, newest first. `schema_documents` selects catalog
    /// excerpts instead of user documents.
    pub async fn list(
        &self,
        skip: i64,
        take: i64,
        schema_documents: bool,
    ) -> Result<Vec<Document>> {
        let comparison = if schema_documents { "=" } else { "!=" };
        let sql = format!(
            r#"
            SELECT id, filename, content_type, uploaded_by, uploaded_at, size_bytes, metadata_json
            FROM documents
            WHERE COALESCE(json_extract(metadata_json, '$.{}'), '') {} '{}'
            ORDER BY uploaded_at DESC, id ASC
            LIMIT ? OFFSET ?
            "#,
            meta_keys::DOCUMENT_TYPE,
            comparison,
            meta_keys::SCHEMA_DOCUMENT,
        );

        let rows = sqlx::query(&sql)
            .bind(take)
            .bind(skip)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(document_from_row).collect()
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let doc_id = id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(HarnessError::not_found(format!("document {id}")));
        }
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        let result = sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Find a document carrying the given `FileHash` metadata, if any.
    pub async fn find_by_file_hash(&self, hash: &str) -> Result<Option<Document>> {
        let sql = format!(
            "SELECT id, filename, content_type, uploaded_by, uploaded_at, size_bytes, metadata_json \
             FROM documents WHERE json_extract(metadata_json, '$.{}') = ?",
            meta_keys::FILE_HASH,
        );
        let row = sqlx::query(&sql)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    /// Top-k chunk search. Semantic when `query_embedding` is given, lexical
    /// otherwise.
    pub async fn search(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        max_results: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        match query_embedding {
            Some(vector) if !vector.is_empty() => {
                let semantic = self.search_semantic(vector, max_results).await?;
                if !semantic.is_empty() {
                    return Ok(semantic);
                }
                self.search_lexical(query, max_results).await
            }
            _ => self.search_lexical(query, max_results).await,
        }
    }

    async fn search_semantic(
        &self,
        query_vector: &[f32],
        max_results: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.document_id, c.chunk_index, c.content,
                   c.start_position, c.end_position,
                   d.filename, v.embedding
            FROM chunk_vectors v
            JOIN chunks c ON c.id = v.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE COALESCE(json_extract(d.metadata_json, '$.documentType'), '') != 'Schema'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| -> Result<ScoredChunk> {
                let blob: Vec<u8> = row.try_get("embedding")?;
                let vector = blob_to_vec(&blob);
                let score = cosine_similarity(query_vector, &vector).max(0.0);
                Ok(ScoredChunk {
                    document_id: parse_uuid(row.try_get("document_id")?)?,
                    filename: row.try_get("filename")?,
                    chunk_index: row.try_get("chunk_index")?,
                    content: row.try_get("content")?,
                    start_position: row.try_get::<i64, _>("start_position")? as usize,
                    end_position: row.try_get::<i64, _>("end_position")? as usize,
                    score,
                })
            })
            .collect::<Result<_>>()?;

        sort_scored(&mut candidates);
        candidates.truncate(max_results);
        Ok(candidates)
    }

    /// Lexical fallback: count token hits per chunk with OCR-tolerant
    /// variants, plus a small bonus for rare keywords.
    async fn search_lexical(&self, query: &str, max_results: usize) -> Result<Vec<ScoredChunk>> {
        let tokens = text::tokenize(query);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT c.document_id, c.chunk_index, c.content,
                   c.start_position, c.end_position, d.filename
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE COALESCE(json_extract(d.metadata_json, '$.documentType'), '') != 'Schema'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // A token hitting few chunks carries more signal than a common one.
        let mut token_hits: HashMap<&str, u32> = HashMap::new();
        let lowered: Vec<(usize, String)> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let content: String = row.get("content");
                (i, content.to_lowercase())
            })
            .collect();

        for token in &tokens {
            let hits = lowered
                .iter()
                .filter(|(_, body)| text::token_matches(token, body))
                .count() as u32;
            token_hits.insert(token.as_str(), hits);
        }

        let total = lowered.len().max(1) as f32;
        let mut candidates = Vec::new();

        for (i, body) in &lowered {
            let row = &rows[*i];
            let mut score = 0.0f32;
            for token in &tokens {
                if text::token_matches(token, body) {
                    score += 1.0;
                    let hits = token_hits[token.as_str()];
                    if hits > 0 && (hits as f32) < total * 0.2 {
                        score += 0.25;
                    }
                }
            }
            if score > 0.0 {
                candidates.push(ScoredChunk {
                    document_id: parse_uuid(row.try_get("document_id")?)?,
                    filename: row.try_get("filename")?,
                    chunk_index: row.try_get("chunk_index")?,
                    content: row.try_get("content")?,
                    start_position: row.try_get::<i64, _>("start_position")? as usize,
                    end_position: row.try_get::<i64, _>("end_position")? as usize,
                    score: score / (tokens.len() as f32 * 1.25),
                });
            }
        }

        sort_scored(&mut candidates);
        candidates.truncate(max_results);
        Ok(candidates)
    }
}

/// Score descending, ties by `(document_id, chunk_index)` ascending.
fn sort_scored(candidates: &mut [ScoredChunk]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|e| HarnessError::validation(format!("invalid uuid in store: {e}")))
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarnessError::validation(format!("invalid timestamp in store: {e}")))
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let metadata_json: String = row.try_get("metadata_json")?;
    Ok(Document {
        id: parse_uuid(row.try_get("id")?)?,
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        uploaded_by: row.try_get("uploaded_by")?,
        uploaded_at: parse_timestamp(row.try_get("uploaded_at")?)?,
        size_bytes: row.try_get("size_bytes")?,
        metadata: serde_json::from_str(&metadata_json)?,
        chunks: Vec::new(),
    })
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(Chunk {
        id: parse_uuid(row.try_get("id")?)?,
        document_id: parse_uuid(row.try_get("document_id")?)?,
        index: row.try_get("chunk_index")?,
        content: row.try_get("content")?,
        start_position: row.try_get::<i64, _>("start_position")? as usize,
        end_position: row.try_get::<i64, _>("end_position")? as usize,
        document_type: row.try_get("document_type")?,
        embedding: embedding.map(|b| blob_to_vec(&b)).unwrap_or_default(),
    })
}
