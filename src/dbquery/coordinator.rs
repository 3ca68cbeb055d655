//! Multi-database query coordination: SQL generation, validation and
//! repair, parallel execution, and priority-ordered merging.
//!
//! One provider call generates SQL for every routed database; a malformed
//! response gets exactly one stricter retry. Each database then runs
//! independently under the shared deadline: a timeout or SQL error degrades
//! that database's section without touching the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::DatabaseConnectionConfig;
use crate::dbquery::catalog::SchemaCatalog;
use crate::dbquery::{dialect, executor, prompts, validator};
use crate::error::{HarnessError, Result};
use crate::models::{DatabaseKind, DatabaseSchemaInfo, QueryIntent};
use crate::providers::AiGateway;

/// Per-database outcome, successful or annotated with its failure.
#[derive(Debug, Clone)]
pub struct DbSection {
    pub database_id: String,
    pub database_name: String,
    pub priority: i32,
    pub tables: Vec<String>,
    pub sql: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub rendered: Option<String>,
    pub row_count: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DbQueryOutcome {
    /// Priority order (higher first), ties by database name.
    pub sections: Vec<DbSection>,
    pub total_rows: u64,
}

impl DbQueryOutcome {
    pub fn any_success(&self) -> bool {
        self.sections.iter().any(|s| s.success)
    }

    /// Human-readable context block for the synthesizer, one labeled
    /// section per database.
    pub fn merged_context(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!("### Database: {}\n", section.database_name));
            if let Some(sql) = &section.sql {
                out.push_str(&format!("Query: {sql}\n"));
            }
            match (&section.rendered, &section.error) {
                (Some(rendered), _) => out.push_str(rendered),
                (None, Some(error)) => out.push_str(&format!("(failed: {error})")),
                (None, None) => out.push_str("(no rows)"),
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct GeneratedSql {
    database_id: String,
    sql: String,
}

pub struct QueryCoordinator {
    gateway: Arc<AiGateway>,
    catalog: Arc<SchemaCatalog>,
    databases: Vec<DatabaseConnectionConfig>,
    query_timeout: Duration,
}

impl QueryCoordinator {
    pub fn new(
        gateway: Arc<AiGateway>,
        catalog: Arc<SchemaCatalog>,
        databases: Vec<DatabaseConnectionConfig>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            catalog,
            databases,
            query_timeout,
        }
    }

    fn config_for(&self, database_id: &str) -> Option<&DatabaseConnectionConfig> {
        self.databases
            .iter()
            .find(|c| c.enabled && c.effective_id() == database_id)
    }

    /// Run the full pipeline for an already-analyzed intent.
    pub async fn run(&self, intent: &QueryIntent) -> DbQueryOutcome {
        if intent.databases.is_empty() {
            return DbQueryOutcome::default();
        }

        let generated = match self.generate_sql(&intent.query, intent).await {
            Ok(generated) => generated,
            Err(e) => {
                warn!(error = %e, "SQL generation failed");
                let sections = intent
                    .databases
                    .iter()
                    .map(|db| DbSection {
                        database_id: db.database_id.clone(),
                        database_name: db.database_name.clone(),
                        priority: db.priority,
                        tables: db.tables.clone(),
                        sql: None,
                        success: false,
                        error: Some(format!("SQL generation failed: {e}")),
                        rendered: None,
                        row_count: 0,
                        duration_ms: 0,
                    })
                    .collect();
                let mut outcome = DbQueryOutcome {
                    sections,
                    total_rows: 0,
                };
                sort_sections(&mut outcome.sections);
                return outcome;
            }
        };

        let all_names: Vec<String> = self.catalog.snapshot().await.iter().map(|s| s.name.clone()).collect();
        let mut tasks: JoinSet<DbSection> = JoinSet::new();
        let mut failed_sections: Vec<DbSection> = Vec::new();

        for db_intent in &intent.databases {
            let mut section = DbSection {
                database_id: db_intent.database_id.clone(),
                database_name: db_intent.database_name.clone(),
                priority: db_intent.priority,
                tables: db_intent.tables.clone(),
                sql: None,
                success: false,
                error: None,
                rendered: None,
                row_count: 0,
                duration_ms: 0,
            };

            let Some(config) = self.config_for(&db_intent.database_id) else {
                section.error = Some("database is not configured or disabled".into());
                failed_sections.push(section);
                continue;
            };
            let Some(schema) = self.catalog.get(&db_intent.database_id).await else {
                section.error = Some("schema has not been analyzed".into());
                failed_sections.push(section);
                continue;
            };
            if schema.status != crate::models::AnalysisStatus::Completed {
                section.error = Some("schema analysis is pending or failed".into());
                failed_sections.push(section);
                continue;
            }
            let Some(raw_sql) = generated.get(&db_intent.database_id) else {
                section.error = Some("no SQL was generated for this database".into());
                failed_sections.push(section);
                continue;
            };

            match prepare_sql(config.kind, raw_sql, &schema, &db_intent.tables, &all_names, config.max_rows) {
                Ok(sql) => {
                    section.sql = Some(sql.clone());
                    let connection_string = config.connection_string.clone();
                    let kind = config.kind;
                    let max_rows = config.max_rows as usize;
                    let timeout = self.query_timeout;
                    tasks.spawn(async move {
                        execute_section(section, kind, connection_string, sql, max_rows, timeout)
                            .await
                    });
                }
                Err(e) => {
                    section.sql = Some(raw_sql.clone());
                    section.error = Some(e.to_string());
                    failed_sections.push(section);
                }
            }
        }

        let mut sections = failed_sections;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(section) => sections.push(section),
                Err(e) => warn!(error = %e, "database execution task panicked"),
            }
        }

        sort_sections(&mut sections);
        let total_rows = sections.iter().map(|s| s.row_count).sum();
        DbQueryOutcome {
            sections,
            total_rows,
        }
    }

    /// One provider call producing SQL for every routed database, with one
    /// strict retry on a malformed response. Also used standalone by the
    /// query-analysis surface.
    pub async fn generate_sql(
        &self,
        query: &str,
        intent: &QueryIntent,
    ) -> Result<HashMap<String, String>> {
        let completed = self.catalog.completed().await;
        let involved: Vec<&DatabaseSchemaInfo> = completed
            .iter()
            .filter(|s| intent.databases.iter().any(|db| db.database_id == s.id))
            .collect();

        let kinds: HashMap<String, DatabaseKind> =
            involved.iter().map(|s| (s.id.clone(), s.kind)).collect();

        let system = prompts::build_system_message(&involved);
        let user = prompts::build_user_message(query, &intent.databases, &kinds);

        let response = self.gateway.generate_text(Some(&system), None, &user).await?;
        match parse_generated(&response) {
            Ok(map) => Ok(map),
            Err(first_err) => {
                debug!(error = %first_err, "SQL generation response malformed, retrying strictly");
                let strict = prompts::build_strict_retry_message(query, &intent.databases);
                let response = self
                    .gateway
                    .generate_text(Some(&system), None, &strict)
                    .await?;
                parse_generated(&response)
            }
        }
    }
}

/// Repair, cap, and validate one generated statement. Validation failures
/// after repair are schema errors.
fn prepare_sql(
    kind: DatabaseKind,
    raw_sql: &str,
    schema: &DatabaseSchemaInfo,
    required_tables: &[String],
    all_database_names: &[String],
    max_rows: u32,
) -> Result<String> {
    let formatted = dialect::apply_limit(kind, &dialect::repair(kind, raw_sql, schema), max_rows);

    let report = validator::validate(&formatted, schema, required_tables, all_database_names);
    for warning in &report.warnings {
        debug!(database = %schema.name, warning = %warning, "validator warning");
    }
    if report.is_valid() {
        return Ok(formatted);
    }

    // One more repair pass, then give up.
    let repaired = dialect::apply_limit(kind, &dialect::repair(kind, &formatted, schema), max_rows);
    let report = validator::validate(&repaired, schema, required_tables, all_database_names);
    if report.is_valid() {
        Ok(repaired)
    } else {
        Err(HarnessError::schema(report.errors.join("; ")))
    }
}

async fn execute_section(
    mut section: DbSection,
    kind: DatabaseKind,
    connection_string: String,
    sql: String,
    max_rows: usize,
    timeout: Duration,
) -> DbSection {
    let started = std::time::Instant::now();
    let result = tokio::time::timeout(
        timeout,
        executor::execute(kind, &connection_string, &sql, max_rows),
    )
    .await;
    section.duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(rows)) => {
            section.row_count = rows.row_count();
            section.rendered = Some(rows.render_table());
            section.success = true;
        }
        Ok(Err(e)) => {
            section.error = Some(e.to_string());
        }
        Err(_) => {
            section.error = Some(format!("timed out after {}s", timeout.as_secs()));
        }
    }
    section
}

fn sort_sections(sections: &mut [DbSection]) {
    sections.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.database_name.cmp(&b.database_name))
    });
}

/// Pull the first JSON array out of a possibly noisy model response.
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
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
            '[' => depth += 1,
            ']' => {
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

fn parse_generated(response: &str) -> Result<HashMap<String, String>> {
    let json = extract_json_array(response)
        .ok_or_else(|| HarnessError::provider("SQL generation response contained no JSON array"))?;
    let rows: Vec<GeneratedSql> = serde_json::from_str(json)?;
    Ok(rows
        .into_iter()
        .map(|row| (row.database_id, row.sql))
        .collect())
}
