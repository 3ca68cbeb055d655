//! Health checks: cheap, individually bounded probes of every dependency.
//!
//! One unreachable dependency never affects the other probes; each gets its
//! own timeout and reports `unhealthy` with a detail string instead.

use std::time::Duration;

use serde::Serialize;

use crate::config::DatabaseConnectionConfig;
use crate::dbquery::{executor, SchemaCatalog};
use crate::models::AnalysisStatus;
use crate::providers::AiGateway;
use crate::store::{ConversationStore, DocumentStore};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseProbe {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub result: ProbeResult,
    pub schema_analyzed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub ai: ProbeResult,
    pub storage: ProbeResult,
    pub conversation: ProbeResult,
    pub databases: Vec<DatabaseProbe>,
}

async fn probe<F, T>(future: F) -> ProbeResult
where
    F: std::future::Future<Output = crate::error::Result<T>>,
{
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(PROBE_TIMEOUT, future).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(_)) => ProbeResult {
            healthy: true,
            detail: None,
            duration_ms,
        },
        Ok(Err(e)) => ProbeResult {
            healthy: false,
            detail: Some(e.to_string()),
            duration_ms,
        },
        Err(_) => ProbeResult {
            healthy: false,
            detail: Some(format!("probe timed out after {}s", PROBE_TIMEOUT.as_secs())),
            duration_ms,
        },
    }
}

/// Probe every configured dependency.
pub async fn check(
    gateway: &AiGateway,
    documents: &DocumentStore,
    conversations: &ConversationStore,
    databases: &[DatabaseConnectionConfig],
    catalog: &SchemaCatalog,
) -> HealthReport {
    let ai = probe(gateway.embed("ping")).await;
    let storage = probe(documents.count()).await;
    let conversation = probe(conversations.exists("health-probe")).await;

    let mut database_probes = Vec::new();
    for config in databases.iter().filter(|c| c.enabled) {
        let id = config.effective_id();
        let result = probe(executor::probe(config.kind, &config.connection_string)).await;
        let schema_analyzed = catalog
            .get(&id)
            .await
            .map(|s| s.status == AnalysisStatus::Completed)
            .unwrap_or(false);
        database_probes.push(DatabaseProbe {
            id,
            name: config.name.clone(),
            result,
            schema_analyzed,
        });
    }

    let healthy = ai.healthy
        && storage.healthy
        && conversation.healthy
        && database_probes.iter().all(|p| p.result.healthy);

    HealthReport {
        healthy,
        ai,
        storage,
        conversation,
        databases: database_probes,
    }
}
