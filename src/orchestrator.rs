//! Query orchestration: strategy selection, multi-source execution, and
//! response assembly.
//!
//! Exactly one path runs per query: conversational, document-only,
//! database-only, or hybrid; MCP tool results are additive when the feature
//! is on. Pre-computations (tokens, candidate chunks) happen once and flow
//! through a single strategy request. The conversation turn is written only
//! after the answer exists, so a cancelled query never leaves a half-written
//! session.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dbquery::{DbQueryOutcome, QueryCoordinator, SchemaCatalog};
use crate::error::{HarnessError, Result};
use crate::intent::{IntentAnalyzer, QueryIntentAnalysisResult};
use crate::mcp::McpClient;
use crate::models::{QueryIntent, RagResponse, ResponseConfig, SearchMetadata};
use crate::providers::AiGateway;
use crate::store::documents::ScoredChunk;
use crate::store::{ConversationStore, DocumentStore};
use crate::synthesize::{SynthesisInput, Synthesizer};

/// Minimum candidate score for "documents can answer this".
const DOC_OVERLAP_THRESHOLD: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    Conversational,
    DocumentOnly,
    DatabaseOnly,
    Hybrid,
}

/// Pre-computed inputs shared by strategy selection and execution, so
/// tokenization and candidate retrieval run once.
pub struct QueryStrategyRequest {
    pub analysis: QueryIntentAnalysisResult,
    pub doc_candidates: Vec<ScoredChunk>,
    pub doc_search_attempted: bool,
}

pub struct Orchestrator {
    config: Arc<Config>,
    gateway: Arc<AiGateway>,
    documents: DocumentStore,
    conversations: ConversationStore,
    catalog: Arc<SchemaCatalog>,
    coordinator: Arc<QueryCoordinator>,
    mcp: Arc<McpClient>,
    analyzer: IntentAnalyzer,
    synthesizer: Synthesizer,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<AiGateway>,
        documents: DocumentStore,
        conversations: ConversationStore,
        catalog: Arc<SchemaCatalog>,
        coordinator: Arc<QueryCoordinator>,
        mcp: Arc<McpClient>,
    ) -> Self {
        let analyzer = IntentAnalyzer::new(gateway.clone());
        let synthesizer = Synthesizer::new(gateway.clone());
        Self {
            config,
            gateway,
            documents,
            conversations,
            catalog,
            coordinator,
            mcp,
            analyzer,
            synthesizer,
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// Answer one query; returns the session id (created when absent) and
    /// the grounded response.
    pub async fn answer(
        &self,
        query: &str,
        session_id: Option<String>,
        preferred_language: Option<String>,
    ) -> Result<(String, RagResponse)> {
        if query.trim().is_empty() {
            return Err(HarnessError::validation("message must not be empty"));
        }
        let session_id = session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let history = self.conversations.get_history(&session_id).await?;
        let history = (!history.is_empty()).then_some(history);

        let schemas = if self.config.features.databases {
            self.catalog.completed().await
        } else {
            Vec::new()
        };

        let analysis = self
            .analyzer
            .analyze(query, history.as_deref(), &schemas)
            .await?;

        let request = self.prepare(analysis).await;
        let strategy = self.select_strategy(&request);
        info!(session = %session_id, ?strategy, "query routed");

        let response = match strategy {
            QueryStrategy::Conversational => {
                self.conversational_response(query, &request).await?
            }
            _ => {
                self.retrieval_response(
                    query,
                    &request,
                    strategy,
                    history.as_deref(),
                    preferred_language,
                )
                .await?
            }
        };

        // Persist the turn only after the answer is produced.
        self.conversations
            .append(&session_id, query, &response.answer)
            .await?;
        self.conversations
            .append_sources(&session_id, &response.sources)
            .await?;

        Ok((session_id, response))
    }

    /// Intent + generated SQL, for the inspection surface. Nothing executes.
    pub async fn analyze_query(&self, query: &str) -> Result<serde_json::Value> {
        if query.trim().is_empty() {
            return Err(HarnessError::validation("query must not be empty"));
        }
        let schemas = self.catalog.completed().await;
        let analysis = self.analyzer.analyze(query, None, &schemas).await?;

        let mut generated = serde_json::Map::new();
        if let Some(intent) = &analysis.intent {
            if !intent.databases.is_empty() {
                match self.coordinator.generate_sql(query, intent).await {
                    Ok(map) => {
                        for (db, sql) in map {
                            generated.insert(db, json!(sql));
                        }
                    }
                    Err(e) => {
                        generated.insert("error".into(), json!(e.to_string()));
                    }
                }
            }
        }

        Ok(json!({
            "is_conversation": analysis.is_conversation,
            "tokens": analysis.tokens,
            "intent": analysis.intent,
            "generated_sql": generated,
        }))
    }

    /// Run the shared pre-computations once.
    async fn prepare(&self, analysis: QueryIntentAnalysisResult) -> QueryStrategyRequest {
        if analysis.is_conversation || !self.config.features.documents {
            return QueryStrategyRequest {
                analysis,
                doc_candidates: Vec::new(),
                doc_search_attempted: false,
            };
        }

        let query = analysis
            .intent
            .as_ref()
            .map(|i| i.query.clone())
            .unwrap_or_default();

        let embedding = match self.gateway.embed(&query).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, "query embedding failed, using lexical search");
                None
            }
        };

        let doc_candidates = match self
            .documents
            .search(&query, embedding.as_deref(), self.config.routing.max_results)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "document search failed");
                Vec::new()
            }
        };

        QueryStrategyRequest {
            analysis,
            doc_candidates,
            doc_search_attempted: true,
        }
    }

    fn select_strategy(&self, request: &QueryStrategyRequest) -> QueryStrategy {
        if request.analysis.is_conversation {
            return QueryStrategy::Conversational;
        }

        let docs_enabled = self.config.features.documents;
        let intent = request.analysis.intent.as_ref();
        let has_db_rows = intent.map(|i| !i.databases.is_empty()).unwrap_or(false);
        let dbs_usable = self.config.features.databases && has_db_rows;
        let confident = intent
            .map(|i| i.confidence >= self.config.routing.intent_confidence_threshold)
            .unwrap_or(false);

        // Every retrieval path needs its own feature switch on.
        if !docs_enabled && !dbs_usable {
            // Nothing retrievable can contribute; answer ungrounded.
            return QueryStrategy::Conversational;
        }
        if !dbs_usable {
            return QueryStrategy::DocumentOnly;
        }
        if !docs_enabled {
            return QueryStrategy::DatabaseOnly;
        }
        // Low-confidence intents with database rows keep both sources.
        if confident && !self.can_answer_from_documents(request) {
            return QueryStrategy::DatabaseOnly;
        }
        if request.doc_candidates.is_empty() {
            return QueryStrategy::DatabaseOnly;
        }
        QueryStrategy::Hybrid
    }

    /// Cheap overlap check; when the search itself failed, the configured
    /// bias decides.
    fn can_answer_from_documents(&self, request: &QueryStrategyRequest) -> bool {
        if !request.doc_search_attempted {
            return self.config.routing.assume_documents_on_error;
        }
        request
            .doc_candidates
            .iter()
            .any(|c| c.score >= DOC_OVERLAP_THRESHOLD)
    }

    async fn conversational_response(
        &self,
        query: &str,
        request: &QueryStrategyRequest,
    ) -> Result<RagResponse> {
        let answer = match &request.analysis.conversational_answer {
            Some(answer) => answer.clone(),
            None => {
                self.gateway
                    .generate_text(
                        Some("Reply briefly and helpfully, in the language of the message."),
                        None,
                        query,
                    )
                    .await?
            }
        };

        Ok(self.build_response(query, answer, Vec::new(), SearchMetadata::default()))
    }

    async fn retrieval_response(
        &self,
        query: &str,
        request: &QueryStrategyRequest,
        strategy: QueryStrategy,
        history: Option<&str>,
        preferred_language: Option<String>,
    ) -> Result<RagResponse> {
        let use_docs = matches!(strategy, QueryStrategy::DocumentOnly | QueryStrategy::Hybrid);
        let use_dbs = matches!(strategy, QueryStrategy::DatabaseOnly | QueryStrategy::Hybrid);

        let db_outcome: Option<DbQueryOutcome> = if use_dbs {
            let intent = request
                .analysis
                .intent
                .as_ref()
                .cloned()
                .unwrap_or_else(|| empty_intent(query));
            Some(self.coordinator.run(&intent).await)
        } else {
            None
        };

        let mcp_sections = if self.config.features.mcp {
            self.collect_mcp_sections(query).await
        } else {
            Vec::new()
        };

        let doc_chunks: &[ScoredChunk] = if use_docs {
            &request.doc_candidates
        } else {
            &[]
        };

        let input = SynthesisInput {
            query,
            document_chunks: doc_chunks,
            database: db_outcome.as_ref(),
            mcp_sections: &mcp_sections,
            history,
            preferred_language: preferred_language.as_deref(),
        };

        let (answer, sources) = self.synthesizer.synthesize(&input).await?;

        let metadata = SearchMetadata {
            document_search_performed: use_docs && request.doc_search_attempted,
            document_results_found: doc_chunks.len() as u64,
            database_search_performed: use_dbs,
            database_results_found: db_outcome.as_ref().map(|o| o.total_rows).unwrap_or(0),
            mcp_search_performed: self.config.features.mcp && !mcp_sections.is_empty(),
            mcp_results_found: mcp_sections.len() as u64,
        };

        Ok(self.build_response(query, answer, sources, metadata))
    }

    /// Call the `search` tool on every connected MCP server. Failures are
    /// isolated per server.
    async fn collect_mcp_sections(&self, query: &str) -> Vec<(String, String)> {
        let mut sections = Vec::new();
        for server_id in self.mcp.connected_servers().await {
            let tools = match self.mcp.discover_tools(&server_id, false).await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = %server_id, error = %e, "MCP tool discovery failed");
                    continue;
                }
            };
            if !tools.iter().any(|t| t.name == "search") {
                continue;
            }
            match self
                .mcp
                .call_tool(&server_id, "search", json!({ "query": query }))
                .await
            {
                Ok(response) if response.is_success() => {
                    if let Some(text) = response.text_content() {
                        sections.push((server_id, text));
                    }
                }
                Ok(response) => {
                    warn!(
                        server = %server_id,
                        error = ?response.error,
                        "MCP search returned an error"
                    );
                }
                Err(e) => {
                    warn!(server = %server_id, error = %e, "MCP search call failed");
                }
            }
        }
        sections
    }

    fn build_response(
        &self,
        query: &str,
        answer: String,
        sources: Vec<crate::models::Source>,
        metadata: SearchMetadata,
    ) -> RagResponse {
        RagResponse {
            query: query.to_string(),
            answer,
            sources,
            searched_at: Utc::now(),
            configuration: ResponseConfig {
                ai_provider: self.gateway.provider_name().to_string(),
                storage_provider: "sqlite".to_string(),
                model: self.gateway.model_name().to_string(),
            },
            search_metadata: metadata,
        }
    }
}

fn empty_intent(query: &str) -> QueryIntent {
    QueryIntent {
        query: query.to_string(),
        understanding: query.to_string(),
        confidence: 0.0,
        reasoning: String::new(),
        requires_cross_database_join: false,
        databases: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{
        AiConfig, AiProviderConfig, ChunkingConfig, ConversationConfig, FeatureConfig,
        RetryPolicyKind, RoutingConfig, ServerConfig, StorageConfig,
    };
    use crate::models::DatabaseQueryIntent;
    use crate::store;

    fn test_config(documents: bool, databases: bool, assume_on_error: bool) -> Config {
        Config {
            server: ServerConfig {
                bind: "127.0.0.1:0".into(),
                base_path: "/smartrag".into(),
            },
            ai: AiConfig {
                primary: AiProviderConfig {
                    provider: "openai".into(),
                    model: "m".into(),
                    embedding_model: "e".into(),
                    // Never contacted: strategy selection is pure routing.
                    base_url: Some("http://127.0.0.1:1".into()),
                    api_key_env: None,
                    system_message: None,
                    timeout_secs: 1,
                    embedding_min_interval_ms: 0,
                    embedding_batch_size: 8,
                },
                max_retry_attempts: 1,
                retry_delay_ms: 1,
                retry_policy: RetryPolicyKind::Fixed,
                enable_fallback_providers: false,
                fallback: vec![],
            },
            chunking: ChunkingConfig::default(),
            storage: StorageConfig {
                db_path: "unused.sqlite".into(),
            },
            conversation: ConversationConfig::default(),
            routing: RoutingConfig {
                intent_confidence_threshold: 0.6,
                assume_documents_on_error: assume_on_error,
                max_results: 5,
                query_timeout_secs: 5,
            },
            features: FeatureConfig {
                documents,
                databases,
                mcp: false,
                file_watcher: false,
            },
            databases: vec![],
            mcp_servers: vec![],
            watched_folders: vec![],
        }
    }

    async fn orchestrator(documents: bool, databases: bool, assume_on_error: bool) -> Orchestrator {
        let config = Arc::new(test_config(documents, databases, assume_on_error));
        let pool = store::connect_in_memory().await.unwrap();
        store::run_migrations(&pool).await.unwrap();

        let gateway = Arc::new(AiGateway::new(&config.ai).unwrap());
        let document_store = DocumentStore::new(pool.clone());
        let conversations = ConversationStore::new(pool, 1000);
        let catalog = Arc::new(SchemaCatalog::new());
        let coordinator = Arc::new(QueryCoordinator::new(
            gateway.clone(),
            catalog.clone(),
            vec![],
            Duration::from_secs(5),
        ));
        Orchestrator::new(
            config,
            gateway,
            document_store,
            conversations,
            catalog,
            coordinator,
            Arc::new(McpClient::new()),
        )
    }

    fn candidate(score: f32) -> ScoredChunk {
        ScoredChunk {
            document_id: Uuid::new_v4(),
            filename: "doc.txt".into(),
            chunk_index: 0,
            content: "overdue invoices".into(),
            start_position: 0,
            end_position: 16,
            score,
        }
    }

    fn conversation_request() -> QueryStrategyRequest {
        QueryStrategyRequest {
            analysis: QueryIntentAnalysisResult {
                is_conversation: true,
                tokens: vec![],
                conversational_answer: Some("Hi!".into()),
                intent: None,
            },
            doc_candidates: vec![],
            doc_search_attempted: false,
        }
    }

    fn retrieval_request(
        confidence: f32,
        db_rows: bool,
        scores: &[f32],
        attempted: bool,
    ) -> QueryStrategyRequest {
        let databases = if db_rows {
            vec![DatabaseQueryIntent {
                database_id: "sales".into(),
                database_name: "Sales".into(),
                tables: vec!["invoices".into()],
                sql: None,
                purpose: "lookup".into(),
                priority: 1,
            }]
        } else {
            vec![]
        };
        QueryStrategyRequest {
            analysis: QueryIntentAnalysisResult {
                is_conversation: false,
                tokens: vec!["overdue".into()],
                conversational_answer: None,
                intent: Some(QueryIntent {
                    query: "overdue invoices".into(),
                    understanding: "overdue invoices".into(),
                    confidence,
                    reasoning: String::new(),
                    requires_cross_database_join: false,
                    databases,
                }),
            },
            doc_candidates: scores.iter().map(|s| candidate(*s)).collect(),
            doc_search_attempted: attempted,
        }
    }

    #[tokio::test]
    async fn test_conversation_always_routes_conversational() {
        let orch = orchestrator(true, true, true).await;
        assert_eq!(
            orch.select_strategy(&conversation_request()),
            QueryStrategy::Conversational
        );
    }

    #[tokio::test]
    async fn test_no_db_rows_routes_document_only() {
        let orch = orchestrator(true, true, true).await;
        let request = retrieval_request(0.9, false, &[0.8], true);
        assert_eq!(orch.select_strategy(&request), QueryStrategy::DocumentOnly);
    }

    #[tokio::test]
    async fn test_databases_disabled_routes_document_only() {
        let orch = orchestrator(true, false, true).await;
        let request = retrieval_request(0.9, true, &[0.8], true);
        assert_eq!(orch.select_strategy(&request), QueryStrategy::DocumentOnly);
    }

    #[tokio::test]
    async fn test_documents_disabled_routes_database_only() {
        let orch = orchestrator(false, true, true).await;
        let request = retrieval_request(0.9, true, &[], false);
        assert_eq!(orch.select_strategy(&request), QueryStrategy::DatabaseOnly);
    }

    #[tokio::test]
    async fn test_documents_disabled_without_db_rows_is_ungrounded() {
        let orch = orchestrator(false, true, true).await;
        let request = retrieval_request(0.9, false, &[], false);
        assert_eq!(
            orch.select_strategy(&request),
            QueryStrategy::Conversational
        );
    }

    #[tokio::test]
    async fn test_both_sources_disabled_is_ungrounded() {
        let orch = orchestrator(false, false, true).await;
        let request = retrieval_request(0.9, true, &[], false);
        assert_eq!(
            orch.select_strategy(&request),
            QueryStrategy::Conversational
        );
    }

    #[tokio::test]
    async fn test_confident_intent_without_doc_overlap_routes_database_only() {
        let orch = orchestrator(true, true, true).await;
        // Candidates exist but all score below the overlap threshold.
        let request = retrieval_request(0.9, true, &[0.1, 0.05], true);
        assert_eq!(orch.select_strategy(&request), QueryStrategy::DatabaseOnly);
    }

    #[tokio::test]
    async fn test_confident_intent_with_doc_overlap_routes_hybrid() {
        let orch = orchestrator(true, true, true).await;
        let request = retrieval_request(0.9, true, &[0.8], true);
        assert_eq!(orch.select_strategy(&request), QueryStrategy::Hybrid);
    }

    #[tokio::test]
    async fn test_low_confidence_with_candidates_keeps_both_sources() {
        let orch = orchestrator(true, true, true).await;
        // Below the 0.6 threshold: the overlap check is skipped and both
        // sources contribute as long as candidates exist.
        let request = retrieval_request(0.2, true, &[0.1], true);
        assert_eq!(orch.select_strategy(&request), QueryStrategy::Hybrid);
    }

    #[tokio::test]
    async fn test_no_candidates_at_all_routes_database_only() {
        let orch = orchestrator(true, true, true).await;
        let request = retrieval_request(0.2, true, &[], true);
        assert_eq!(orch.select_strategy(&request), QueryStrategy::DatabaseOnly);
    }

    #[tokio::test]
    async fn test_overlap_check_error_bias_is_configurable() {
        // Search never ran: the configured bias decides.
        let assume_yes = orchestrator(true, true, true).await;
        let request = retrieval_request(0.9, true, &[], false);
        assert!(assume_yes.can_answer_from_documents(&request));

        let assume_no = orchestrator(true, true, false).await;
        assert!(!assume_no.can_answer_from_documents(&request));
    }
}
