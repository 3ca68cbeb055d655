//! Batched chunk embedding and vector utilities.
//!
//! The embedder groups chunks into provider-sized batches, awaits each
//! batch, and zips the returned vectors back to chunks by index. When a
//! batch returns the wrong number of vectors, the affected chunks fall back
//! to per-item embedding. A chunk's vector is never partially assigned: on
//! any failure the chunk keeps an empty vector and stays a candidate for
//! regeneration.
//!
//! Vectors are stored as little-endian `f32` BLOBs in SQLite.

use tracing::warn;

use crate::models::Chunk;
use crate::providers::AiGateway;

/// Counts from one embedding pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmbedOutcome {
    pub embedded: u64,
    /// Chunks left without a vector, to be regenerated later.
    pub pending: u64,
}

/// Embed every chunk that does not yet carry a vector. Non-fatal: failures
/// leave chunks pending.
pub async fn embed_chunks(gateway: &AiGateway, chunks: &mut [Chunk]) -> EmbedOutcome {
    let mut outcome = EmbedOutcome::default();
    let batch_size = gateway.embedding_batch_size();

    let missing: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.has_embedding())
        .map(|(i, _)| i)
        .collect();

    for group in missing.chunks(batch_size) {
        let texts: Vec<String> = group.iter().map(|&i| chunks[i].content.clone()).collect();

        match gateway.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == group.len() => {
                for (&i, vector) in group.iter().zip(vectors) {
                    chunks[i].embedding = vector;
                    outcome.embedded += 1;
                }
            }
            Ok(vectors) => {
                warn!(
                    requested = group.len(),
                    returned = vectors.len(),
                    "embedding batch size mismatch, falling back to per-item"
                );
                for &i in group {
                    match gateway.embed(&chunks[i].content).await {
                        Ok(vector) => {
                            chunks[i].embedding = vector;
                            outcome.embedded += 1;
                        }
                        Err(e) => {
                            warn!(chunk = chunks[i].index, error = %e, "embedding failed");
                            outcome.pending += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "embedding batch failed");
                outcome.pending += group.len() as u64;
            }
        }
    }

    outcome
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Empty or mismatched vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AiConfig, AiProviderConfig, RetryPolicyKind};
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_chunk(index: i64, content: &str) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            index,
            content: content.to_string(),
            start_position: 0,
            end_position: content.chars().count(),
            document_type: None,
            embedding: Vec::new(),
        }
    }

    fn gateway_for(base_url: &str, batch_size: usize) -> AiGateway {
        AiGateway::new(&AiConfig {
            primary: AiProviderConfig {
                provider: "openai".into(),
                model: "m".into(),
                embedding_model: "e".into(),
                base_url: Some(base_url.to_string()),
                api_key_env: None,
                system_message: None,
                timeout_secs: 5,
                embedding_min_interval_ms: 0,
                embedding_batch_size: batch_size,
            },
            max_retry_attempts: 1,
            retry_delay_ms: 1,
            retry_policy: RetryPolicyKind::Fixed,
            enable_fallback_providers: false,
            fallback: vec![],
        })
        .unwrap()
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_embed_chunks_assigns_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    { "index": 0, "embedding": [1.0, 0.0] },
                    { "index": 1, "embedding": [0.0, 1.0] },
                ]
            })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server.uri(), 8);
        let mut chunks = vec![make_chunk(0, "first"), make_chunk(1, "second")];
        let outcome = embed_chunks(&gateway, &mut chunks).await;

        assert_eq!(outcome.embedded, 2);
        assert_eq!(outcome.pending, 0);
        assert_eq!(chunks[0].embedding, vec![1.0, 0.0]);
        assert_eq!(chunks[1].embedding, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_embed_chunks_failure_leaves_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server.uri(), 8);
        let mut chunks = vec![make_chunk(0, "only")];
        let outcome = embed_chunks(&gateway, &mut chunks).await;

        assert_eq!(outcome.embedded, 0);
        assert_eq!(outcome.pending, 1);
        assert!(!chunks[0].has_embedding());
    }

    #[tokio::test]
    async fn test_short_batch_falls_back_to_per_item() {
        let server = MockServer::start().await;
        // First call: batch of two answered with one vector.
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [ { "index": 0, "embedding": [0.5, 0.5] } ]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        // Per-item retries succeed.
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [ { "index": 0, "embedding": [0.9, 0.1] } ]
            })))
            .mount(&server)
            .await;

        let gateway = gateway_for(&server.uri(), 8);
        let mut chunks = vec![make_chunk(0, "first"), make_chunk(1, "second")];
        let outcome = embed_chunks(&gateway, &mut chunks).await;

        assert_eq!(outcome.embedded, 2);
        assert!(chunks.iter().all(Chunk::has_embedding));
    }
}
