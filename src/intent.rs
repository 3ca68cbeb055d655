//! Query intent analysis: conversational-vs-retrieval classification and
//! database routing.
//!
//! Classification goes through the AI gateway with a deterministic prompt
//! that demands a JSON verdict. Conversational answers come back inline so
//! no second call is needed. Degenerate queries (no usable tokens) are
//! classified conversational without consulting the model at all.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::models::{DatabaseQueryIntent, DatabaseSchemaInfo, QueryIntent};
use crate::providers::AiGateway;
use crate::text;

/// Analyzer output: either an inline conversational answer or a populated
/// retrieval intent (SQL still unset).
#[derive(Debug, Clone)]
pub struct QueryIntentAnalysisResult {
    pub is_conversation: bool,
    pub tokens: Vec<String>,
    pub conversational_answer: Option<String>,
    pub intent: Option<QueryIntent>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    is_conversation: bool,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    understanding: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    requires_cross_database_join: bool,
    #[serde(default)]
    databases: Vec<VerdictDatabase>,
}

#[derive(Debug, Deserialize)]
struct VerdictDatabase {
    #[serde(default)]
    database_id: String,
    #[serde(default)]
    database_name: String,
    #[serde(default)]
    tables: Vec<String>,
    #[serde(default)]
    purpose: String,
    #[serde(default)]
    priority: i32,
}

pub struct IntentAnalyzer {
    gateway: Arc<AiGateway>,
}

impl IntentAnalyzer {
    pub fn new(gateway: Arc<AiGateway>) -> Self {
        Self { gateway }
    }

    /// Classify one query against the known database schemas.
    pub async fn analyze(
        &self,
        query: &str,
        history: Option<&str>,
        schemas: &[DatabaseSchemaInfo],
    ) -> Result<QueryIntentAnalysisResult> {
        if query.trim().is_empty() {
            return Err(HarnessError::validation("query must not be empty"));
        }

        let tokens = text::tokenize(query);
        if tokens.is_empty() {
            // Nothing to retrieve on; answer as small talk without a model
            // round-trip.
            return Ok(QueryIntentAnalysisResult {
                is_conversation: true,
                tokens,
                conversational_answer: Some(
                    "Hello! Ask me about your documents or connected databases.".to_string(),
                ),
                intent: None,
            });
        }

        let system = build_classifier_system(schemas);
        let response = self
            .gateway
            .generate_text(Some(&system), history, query)
            .await?;

        let verdict = match extract_json_object(&response)
            .and_then(|json| serde_json::from_str::<Verdict>(json).ok())
        {
            Some(verdict) => verdict,
            None => {
                debug!("intent verdict was not parseable, routing to documents");
                Verdict {
                    is_conversation: false,
                    answer: None,
                    understanding: query.to_string(),
                    confidence: 0.3,
                    reasoning: "classification response was malformed".to_string(),
                    requires_cross_database_join: false,
                    databases: Vec::new(),
                }
            }
        };

        if verdict.is_conversation {
            return Ok(QueryIntentAnalysisResult {
                is_conversation: true,
                tokens,
                conversational_answer: verdict.answer,
                intent: None,
            });
        }

        // Keep only databases the catalog actually knows.
        let databases: Vec<DatabaseQueryIntent> = verdict
            .databases
            .into_iter()
            .filter_map(|db| {
                let schema = schemas
                    .iter()
                    .find(|s| s.id == db.database_id || s.name.eq_ignore_ascii_case(&db.database_name))?;
                Some(DatabaseQueryIntent {
                    database_id: schema.id.clone(),
                    database_name: schema.name.clone(),
                    tables: db.tables,
                    sql: None,
                    purpose: db.purpose,
                    priority: db.priority,
                })
            })
            .collect();

        let intent = QueryIntent {
            query: query.to_string(),
            understanding: verdict.understanding,
            confidence: verdict.confidence.clamp(0.0, 1.0),
            reasoning: verdict.reasoning,
            requires_cross_database_join: verdict.requires_cross_database_join,
            databases,
        };

        Ok(QueryIntentAnalysisResult {
            is_conversation: false,
            tokens,
            conversational_answer: None,
            intent: Some(intent),
        })
    }
}

fn build_classifier_system(schemas: &[DatabaseSchemaInfo]) -> String {
    let mut out = String::from(
        "You classify user queries for a retrieval system. Respond with a single JSON \
         object and nothing else:\n\
         {\"is_conversation\": bool, \"answer\": string or null, \"understanding\": string, \
         \"confidence\": number 0..1, \"reasoning\": string, \
         \"requires_cross_database_join\": bool, \"databases\": [\
         {\"database_id\": string, \"database_name\": string, \"tables\": [string], \
         \"purpose\": string, \"priority\": integer}]}\n\
         Rules: greetings and small talk are conversation; answer them inline in \
         \"answer\" with at most 200 characters. Questions about facts, documents, or \
         data are not conversation. Name a database only when its tables plausibly hold \
         the answer. Higher priority databases are presented first.\n",
    );

    if schemas.is_empty() {
        out.push_str("No databases are available.\n");
    } else {
        out.push_str("Available databases:\n");
        for schema in schemas {
            let tables: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
            out.push_str(&format!(
                "- id '{}', name '{}': tables {}\n",
                schema.id,
                schema.name,
                tables.join(", ")
            ));
        }
    }
    out
}

/// First balanced JSON object in a possibly noisy model response. Brace
/// tracking skips braces inside JSON strings, including escaped quotes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else {
                match c {
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}
