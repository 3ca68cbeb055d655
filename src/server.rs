//! HTTP surface for documents, chat, settings, connections, health, and
//! query inspection.
//!
//! All routes mount under the configurable base path (default `/smartrag`)
//! and speak JSON. Error responses follow one schema:
//!
//! ```json
//! { "error": { "code": "validation", "message": "message must not be empty" } }
//! ```
//!
//! Secrets never leave the settings endpoint: any key containing
//! `key|password|secret|token|authorization|connectionstring` is masked.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::dbquery::executor;
use crate::error::HarnessError;
use crate::extract::SUPPORTED_TYPES;
use crate::health;
use crate::models::meta_keys;
use crate::startup::AppContext;

/// Starts the HTTP server. Runs until the process terminates.
pub async fn run_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let bind = ctx.config.server.bind.clone();
    let base = ctx.config.server.base_path.trim_end_matches('/').to_string();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/documents", get(list_documents).post(upload_document).delete(delete_all_documents))
        .route("/api/documents/schemas", get(list_schema_documents))
        .route("/api/documents/{id}", get(get_document).delete(delete_document))
        .route("/api/documents/{id}/chunks", get(get_document_chunks))
        .route("/api/upload/supported-types", get(supported_types))
        .route("/api/chat/messages", post(chat_message))
        .route("/api/chat/sessions", get(list_sessions).delete(delete_all_sessions))
        .route("/api/chat/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/settings", get(get_settings))
        .route("/api/connections", get(get_connections))
        .route("/api/health", get(get_health))
        .route("/api/schemas", get(get_schemas))
        .route("/api/query-analysis", post(query_analysis))
        .with_state(ctx);

    let app = if base.is_empty() {
        api.layer(cors)
    } else {
        Router::new().nest(&base, api).layer(cors)
    };

    info!(bind = %bind, base = %base, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error mapping ============

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({ "error": { "code": self.code, "message": self.message } });
        (self.status, Json(body)).into_response()
    }
}

impl From<HarnessError> for AppError {
    fn from(e: HarnessError) -> Self {
        let (status, code) = match &e {
            HarnessError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            HarnessError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            HarnessError::DocumentSkipped(_) => (StatusCode::UNPROCESSABLE_ENTITY, "document_skipped"),
            HarnessError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider"),
            HarnessError::Schema(_) => (StatusCode::BAD_REQUEST, "schema"),
            HarnessError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %e, "internal error");
        }
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation",
        message: message.into(),
    }
}

// ============ Documents ============

#[derive(Deserialize)]
struct Paging {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_take")]
    take: i64,
}

fn default_take() -> i64 {
    50
}

async fn list_documents(
    State(ctx): State<Arc<AppContext>>,
    Query(paging): Query<Paging>,
) -> Result<Json<Value>, AppError> {
    let documents = ctx
        .documents
        .list(paging.skip.max(0), paging.take.clamp(1, 500), false)
        .await?;
    Ok(Json(json!({ "documents": documents })))
}

async fn list_schema_documents(
    State(ctx): State<Arc<AppContext>>,
    Query(paging): Query<Paging>,
) -> Result<Json<Value>, AppError> {
    let documents = ctx
        .documents
        .list(paging.skip.max(0), paging.take.clamp(1, 500), true)
        .await?;
    Ok(Json(json!({ "documents": documents })))
}

async fn get_document(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let document = ctx.documents.get(id).await?;
    Ok(Json(serde_json::to_value(document).map_err(HarnessError::from)?))
}

async fn get_document_chunks(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    ctx.documents.get(id).await?;
    let chunks = ctx.documents.get_chunks(id).await?;
    Ok(Json(json!({ "chunks": chunks })))
}

async fn upload_document(
    State(ctx): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut filename = None;
    let mut bytes: Option<Vec<u8>> = None;
    let mut uploaded_by = None;
    let mut language = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                filename = field.file_name().map(|s| s.to_string());
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| bad_request(format!("failed to read file: {e}")))?
                        .to_vec(),
                );
            }
            "uploadedBy" => {
                uploaded_by = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| bad_request(format!("invalid uploadedBy: {e}")))?,
                );
            }
            "language" => {
                language = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| bad_request(format!("invalid language: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let filename = filename.ok_or_else(|| bad_request("file field is required"))?;
    let bytes = bytes.ok_or_else(|| bad_request("file field is required"))?;
    let uploaded_by = uploaded_by.ok_or_else(|| bad_request("uploadedBy is required"))?;

    // Upload path owns de-duplication: one document per content hash.
    let hash = format!("{:x}", md5::compute(&bytes));
    if let Some(existing) = ctx.documents.find_by_file_hash(&hash).await? {
        return Ok((
            StatusCode::OK,
            Json(json!({ "id": existing.id, "duplicate": true })),
        )
            .into_response());
    }

    let mut metadata = std::collections::HashMap::new();
    metadata.insert(meta_keys::FILE_HASH.to_string(), hash);

    let document = ctx
        .ingestor
        .ingest_bytes(&filename, &bytes, &uploaded_by, language.as_deref(), metadata)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": document.id, "chunks": document.chunks.len(), "duplicate": false })),
    )
        .into_response())
}

async fn delete_document(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    ctx.documents.delete(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn delete_all_documents(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Value>, AppError> {
    let deleted = ctx.documents.delete_all().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

async fn supported_types() -> Json<Value> {
    let types: Vec<Value> = SUPPORTED_TYPES
        .iter()
        .map(|(ext, mime)| json!({ "extension": ext, "mimeType": mime }))
        .collect();
    Json(json!({ "supportedTypes": types }))
}

// ============ Chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "preferredLanguage")]
    preferred_language: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    sources: Vec<crate::models::Source>,
    #[serde(rename = "searchMetadata")]
    search_metadata: crate::models::SearchMetadata,
    #[serde(rename = "lastUpdated")]
    last_updated: chrono::DateTime<chrono::Utc>,
}

async fn chat_message(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let (session_id, response) = ctx
        .orchestrator
        .answer(&request.message, request.session_id, request.preferred_language)
        .await?;

    let (_, last_updated) = ctx.conversations.get_timestamps(&session_id).await?;
    Ok(Json(ChatResponse {
        answer: response.answer,
        session_id,
        sources: response.sources,
        search_metadata: response.search_metadata,
        last_updated,
    }))
}

async fn list_sessions(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, AppError> {
    let sessions = ctx.conversations.summaries().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if !ctx.conversations.exists(&id).await? {
        return Err(HarnessError::not_found(format!("session {id}")).into());
    }
    let history = ctx.conversations.get_history(&id).await?;
    let (created_at, last_updated) = ctx.conversations.get_timestamps(&id).await?;
    let sources = ctx.conversations.get_sources(&id).await?;
    Ok(Json(json!({
        "sessionId": id,
        "history": history,
        "createdAt": created_at,
        "lastUpdated": last_updated,
        "sources": sources,
    })))
}

async fn delete_session(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    ctx.conversations.clear(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn delete_all_sessions(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, AppError> {
    let deleted = ctx.conversations.clear_all().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

// ============ Settings / connections / health / schemas ============

async fn get_settings(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, AppError> {
    let mut value = serde_json::to_value(ctx.config.as_ref()).map_err(HarnessError::from)?;
    mask_secrets(&mut value);
    Ok(Json(value))
}

/// Replace the value of any key that smells like a credential.
fn mask_secrets(value: &mut Value) {
    const SENSITIVE: &[&str] = &[
        "key",
        "password",
        "secret",
        "token",
        "authorization",
        "connectionstring",
    ];
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                let lowered = key.to_lowercase().replace(['_', '-'], "");
                if SENSITIVE.iter().any(|s| lowered.contains(s)) {
                    *entry = Value::String("***".to_string());
                } else {
                    mask_secrets(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_secrets(item);
            }
        }
        _ => {}
    }
}

async fn get_connections(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, AppError> {
    let mut connections = Vec::new();
    for config in ctx.config.databases.iter().filter(|c| c.enabled) {
        let id = config.effective_id();
        let is_valid = executor::probe(config.kind, &config.connection_string)
            .await
            .is_ok();
        let schema = ctx.catalog.get(&id).await;
        let (table_count, total_rows, status) = match &schema {
            Some(s) => (s.tables.len(), s.total_row_count, format!("{:?}", s.status)),
            None => (0, 0, "Pending".to_string()),
        };
        connections.push(json!({
            "id": id,
            "name": config.name,
            "type": config.kind.as_str(),
            "isValid": is_valid,
            "tableCount": table_count,
            "totalRowCount": total_rows,
            "status": status,
        }));
    }
    Ok(Json(json!({ "connections": connections })))
}

async fn get_health(State(ctx): State<Arc<AppContext>>) -> Json<health::HealthReport> {
    let report = health::check(
        &ctx.gateway,
        &ctx.documents,
        &ctx.conversations,
        &ctx.config.databases,
        &ctx.catalog,
    )
    .await;
    Json(report)
}

async fn get_schemas(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, AppError> {
    let schemas = ctx.catalog.snapshot().await;
    Ok(Json(json!({ "schemas": schemas })))
}

#[derive(Deserialize)]
struct QueryAnalysisRequest {
    query: String,
}

async fn query_analysis(
    State(ctx): State<Arc<AppContext>>,
    Json(request): Json<QueryAnalysisRequest>,
) -> Result<Json<Value>, AppError> {
    let analysis = ctx.orchestrator.analyze_query(&request.query).await?;
    Ok(Json(analysis))
}
