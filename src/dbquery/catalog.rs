//! Schema catalog: background introspection of every configured database.
//!
//! Analysis is best-effort. A database that fails introspection keeps a
//! `Failed` entry with the error message; it stays reachable for connection
//! probes but is excluded from query routing. Completed schemas are also
//! mirrored into the document store as schema documents so the database
//! subsystem can search over schema descriptions.
//!
//! The catalog is read-mostly: one `RwLock` guards refresh, readers take
//! cheap snapshots.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DatabaseConnectionConfig;
use crate::dbquery::{dialect, executor};
use crate::error::Result;
use crate::models::{
    meta_keys, AnalysisStatus, Chunk, ColumnSchema, DatabaseKind, DatabaseSchemaInfo, Document,
    ForeignKeyRef, TableSchema,
};
use crate::store::DocumentStore;

const INTROSPECTION_ROW_CAP: usize = 10_000;
const SAMPLE_ROWS: u32 = 3;

#[derive(Default)]
pub struct SchemaCatalog {
    inner: RwLock<HashMap<String, DatabaseSchemaInfo>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, database_id: &str) -> Option<DatabaseSchemaInfo> {
        self.inner.read().await.get(database_id).cloned()
    }

    /// Every cached entry, completed or not.
    pub async fn snapshot(&self) -> Vec<DatabaseSchemaInfo> {
        let mut entries: Vec<DatabaseSchemaInfo> =
            self.inner.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Completed entries only, for routing and prompt building.
    pub async fn completed(&self) -> Vec<DatabaseSchemaInfo> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|s| s.status == AnalysisStatus::Completed)
            .collect()
    }

    /// Analyze every enabled database, replacing previous entries. Intended
    /// to run in a detached startup task; also serves as the explicit
    /// refresh API.
    pub async fn analyze_all(
        self: &Arc<Self>,
        configs: &[DatabaseConnectionConfig],
        store: Option<&DocumentStore>,
    ) {
        for config in configs.iter().filter(|c| c.enabled) {
            let id = config.effective_id();
            self.inner.write().await.insert(
                id.clone(),
                pending_entry(&id, config),
            );

            let entry = match analyze_database(config).await {
                Ok(entry) => {
                    info!(
                        database = %config.name,
                        tables = entry.tables.len(),
                        "schema analysis completed"
                    );
                    entry
                }
                Err(e) => {
                    warn!(database = %config.name, error = %e, "schema analysis failed");
                    failed_entry(&id, config, &e.to_string())
                }
            };

            if entry.status == AnalysisStatus::Completed {
                if let Some(store) = store {
                    if let Err(e) = upsert_schema_document(store, &entry).await {
                        warn!(database = %config.name, error = %e, "schema document upsert failed");
                    }
                }
            }

            self.inner.write().await.insert(id, entry);
        }
    }
}

fn pending_entry(id: &str, config: &DatabaseConnectionConfig) -> DatabaseSchemaInfo {
    DatabaseSchemaInfo {
        id: id.to_string(),
        name: config.name.clone(),
        kind: config.kind,
        analyzed_at: Utc::now(),
        tables: Vec::new(),
        total_row_count: 0,
        status: AnalysisStatus::Pending,
        error: None,
    }
}

fn failed_entry(id: &str, config: &DatabaseConnectionConfig, error: &str) -> DatabaseSchemaInfo {
    DatabaseSchemaInfo {
        id: id.to_string(),
        name: config.name.clone(),
        kind: config.kind,
        analyzed_at: Utc::now(),
        tables: Vec::new(),
        total_row_count: 0,
        status: AnalysisStatus::Failed,
        error: Some(error.to_string()),
    }
}

/// Introspect one database into a completed schema entry.
pub async fn analyze_database(config: &DatabaseConnectionConfig) -> Result<DatabaseSchemaInfo> {
    let kind = config.kind;
    let conn = config.connection_string.as_str();

    let mut tables = introspect_columns(kind, conn).await?;
    apply_primary_keys(kind, conn, &mut tables).await?;
    apply_foreign_keys(kind, conn, &mut tables).await?;

    let mut total_rows = 0u64;
    for table in &mut tables {
        let escaped = dialect::escape_identifier(kind, &table.name);
        let count_sql = format!("SELECT COUNT(*) FROM {escaped}");
        table.row_count = executor::execute(kind, conn, &count_sql, 1)
            .await
            .ok()
            .and_then(|r| r.rows.first().and_then(|row| row[0].parse().ok()))
            .unwrap_or(0);
        total_rows += table.row_count;

        let sample_sql =
            dialect::apply_limit(kind, &format!("SELECT * FROM {escaped}"), SAMPLE_ROWS);
        table.sample_data = executor::execute(kind, conn, &sample_sql, SAMPLE_ROWS as usize)
            .await
            .ok()
            .filter(|r| !r.rows.is_empty())
            .map(|r| r.render_table());
    }

    Ok(DatabaseSchemaInfo {
        id: config.effective_id(),
        name: config.name.clone(),
        kind,
        analyzed_at: Utc::now(),
        tables,
        total_row_count: total_rows,
        status: AnalysisStatus::Completed,
        error: None,
    })
}

/// Discover tables and columns. Column metadata comes back as display
/// strings from the executor, which is all introspection needs.
async fn introspect_columns(kind: DatabaseKind, conn: &str) -> Result<Vec<TableSchema>> {
    match kind {
        DatabaseKind::Sqlite => {
            let names = executor::execute(
                kind,
                conn,
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                INTROSPECTION_ROW_CAP,
            )
            .await?;

            let mut tables = Vec::new();
            for row in names.rows {
                let table_name = row[0].clone();
                let info = executor::execute(
                    kind,
                    conn,
                    &format!("PRAGMA table_info(\"{table_name}\")"),
                    INTROSPECTION_ROW_CAP,
                )
                .await?;
                // PRAGMA table_info: cid, name, type, notnull, dflt_value, pk
                let columns = info
                    .rows
                    .iter()
                    .map(|r| ColumnSchema {
                        name: r[1].clone(),
                        data_type: r[2].clone(),
                        nullable: r[3] == "0",
                        is_primary_key: r[5] != "0",
                        is_foreign_key: false,
                        max_length: None,
                    })
                    .collect::<Vec<_>>();
                let primary_keys = columns
                    .iter()
                    .filter(|c| c.is_primary_key)
                    .map(|c| c.name.clone())
                    .collect();
                tables.push(TableSchema {
                    name: table_name,
                    columns,
                    primary_keys,
                    foreign_keys: Vec::new(),
                    row_count: 0,
                    sample_data: None,
                });
            }
            Ok(tables)
        }
        DatabaseKind::MySql => {
            let rows = executor::execute(
                kind,
                conn,
                "SELECT c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE, c.IS_NULLABLE, c.CHARACTER_MAXIMUM_LENGTH \
                 FROM information_schema.COLUMNS c \
                 JOIN information_schema.TABLES t \
                   ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
                 WHERE c.TABLE_SCHEMA = DATABASE() AND t.TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION",
                INTROSPECTION_ROW_CAP,
            )
            .await?;
            Ok(group_columns(rows.rows))
        }
        DatabaseKind::PostgreSql => {
            let rows = executor::execute(
                kind,
                conn,
                "SELECT c.table_name, c.column_name, c.data_type, c.is_nullable, c.character_maximum_length \
                 FROM information_schema.columns c \
                 JOIN information_schema.tables t \
                   ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
                 WHERE c.table_schema = 'public' AND t.table_type = 'BASE TABLE' \
                 ORDER BY c.table_name, c.ordinal_position",
                INTROSPECTION_ROW_CAP,
            )
            .await?;
            Ok(group_columns(rows.rows))
        }
        DatabaseKind::SqlServer => {
            let rows = executor::execute(
                kind,
                conn,
                "SELECT c.TABLE_NAME, c.COLUMN_NAME, c.DATA_TYPE, c.IS_NULLABLE, c.CHARACTER_MAXIMUM_LENGTH \
                 FROM INFORMATION_SCHEMA.COLUMNS c \
                 JOIN INFORMATION_SCHEMA.TABLES t ON t.TABLE_NAME = c.TABLE_NAME \
                 WHERE t.TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION",
                INTROSPECTION_ROW_CAP,
            )
            .await?;
            Ok(group_columns(rows.rows))
        }
    }
}

/// Fold `(table, column, type, nullable, max_length)` rows into tables.
fn group_columns(rows: Vec<Vec<String>>) -> Vec<TableSchema> {
    let mut tables: Vec<TableSchema> = Vec::new();
    for row in rows {
        let column = ColumnSchema {
            name: row[1].clone(),
            data_type: row[2].clone(),
            nullable: row[3].eq_ignore_ascii_case("YES"),
            is_primary_key: false,
            is_foreign_key: false,
            max_length: row.get(4).and_then(|v| v.parse().ok()),
        };
        match tables.last_mut() {
            Some(table) if table.name == row[0] => table.columns.push(column),
            _ => tables.push(TableSchema {
                name: row[0].clone(),
                columns: vec![column],
                primary_keys: Vec::new(),
                foreign_keys: Vec::new(),
                row_count: 0,
                sample_data: None,
            }),
        }
    }
    tables
}

async fn apply_primary_keys(
    kind: DatabaseKind,
    conn: &str,
    tables: &mut [TableSchema],
) -> Result<()> {
    let sql = match kind {
        DatabaseKind::Sqlite => return Ok(()), // PRAGMA table_info already covered it
        DatabaseKind::MySql => {
            "SELECT TABLE_NAME, COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
             WHERE TABLE_SCHEMA = DATABASE() AND CONSTRAINT_NAME = 'PRIMARY'"
        }
        DatabaseKind::PostgreSql => {
            "SELECT tc.table_name, kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_name = tc.constraint_name AND kcu.table_schema = tc.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = 'public'"
        }
        DatabaseKind::SqlServer => {
            "SELECT ku.TABLE_NAME, ku.COLUMN_NAME \
             FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
             JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ku ON ku.CONSTRAINT_NAME = tc.CONSTRAINT_NAME \
             WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'"
        }
    };

    let rows = executor::execute(kind, conn, sql, INTROSPECTION_ROW_CAP).await?;
    for row in rows.rows {
        if let Some(table) = tables.iter_mut().find(|t| t.name == row[0]) {
            table.primary_keys.push(row[1].clone());
            if let Some(column) = table.columns.iter_mut().find(|c| c.name == row[1]) {
                column.is_primary_key = true;
            }
        }
    }
    Ok(())
}

async fn apply_foreign_keys(
    kind: DatabaseKind,
    conn: &str,
    tables: &mut [TableSchema],
) -> Result<()> {
    match kind {
        DatabaseKind::Sqlite => {
            let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
            for name in names {
                let rows = executor::execute(
                    kind,
                    conn,
                    &format!("PRAGMA foreign_key_list(\"{name}\")"),
                    INTROSPECTION_ROW_CAP,
                )
                .await?;
                // PRAGMA foreign_key_list: id, seq, table, from, to, ...
                for row in rows.rows {
                    if let Some(table) = tables.iter_mut().find(|t| t.name == name) {
                        add_foreign_key(table, &row[3], &row[2], &row[4]);
                    }
                }
            }
        }
        DatabaseKind::MySql => {
            let rows = executor::execute(
                kind,
                conn,
                "SELECT TABLE_NAME, COLUMN_NAME, REFERENCED_TABLE_NAME, REFERENCED_COLUMN_NAME \
                 FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = DATABASE() AND REFERENCED_TABLE_NAME IS NOT NULL",
                INTROSPECTION_ROW_CAP,
            )
            .await?;
            for row in rows.rows {
                if let Some(table) = tables.iter_mut().find(|t| t.name == row[0]) {
                    add_foreign_key(table, &row[1], &row[2], &row[3]);
                }
            }
        }
        DatabaseKind::PostgreSql => {
            let rows = executor::execute(
                kind,
                conn,
                "SELECT tc.table_name, kcu.column_name, ccu.table_name, ccu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_name = tc.constraint_name AND kcu.table_schema = tc.table_schema \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
                 WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public'",
                INTROSPECTION_ROW_CAP,
            )
            .await?;
            for row in rows.rows {
                if let Some(table) = tables.iter_mut().find(|t| t.name == row[0]) {
                    add_foreign_key(table, &row[1], &row[2], &row[3]);
                }
            }
        }
        DatabaseKind::SqlServer => {
            let rows = executor::execute(
                kind,
                conn,
                "SELECT fk.TABLE_NAME, fk.COLUMN_NAME, pk.TABLE_NAME, pk.COLUMN_NAME \
                 FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE fk ON fk.CONSTRAINT_NAME = rc.CONSTRAINT_NAME \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE pk \
                   ON pk.CONSTRAINT_NAME = rc.UNIQUE_CONSTRAINT_NAME \
                  AND pk.ORDINAL_POSITION = fk.ORDINAL_POSITION",
                INTROSPECTION_ROW_CAP,
            )
            .await?;
            for row in rows.rows {
                if let Some(table) = tables.iter_mut().find(|t| t.name == row[0]) {
                    add_foreign_key(table, &row[1], &row[2], &row[3]);
                }
            }
        }
    }
    Ok(())
}

/// Record a foreign key, keeping the column flag in sync. Only columns that
/// actually exist on the table are recorded.
fn add_foreign_key(table: &mut TableSchema, column: &str, ref_table: &str, ref_column: &str) {
    let Some(col) = table.columns.iter_mut().find(|c| c.name == column) else {
        return;
    };
    col.is_foreign_key = true;
    table.foreign_keys.push(ForeignKeyRef {
        column: column.to_string(),
        references_table: ref_table.to_string(),
        references_column: ref_column.to_string(),
    });
}

/// Mirror a completed schema into the document store as a schema document.
/// The document id is derived from the database id so re-analysis upserts
/// in place.
async fn upsert_schema_document(store: &DocumentStore, schema: &DatabaseSchemaInfo) -> Result<()> {
    let content = render_schema_markdown(schema);
    let doc_id = Uuid::from_bytes(md5::compute(schema.id.as_bytes()).0);
    let chunk_id = Uuid::from_bytes(md5::compute(format!("{}:0", schema.id).as_bytes()).0);

    let mut metadata = HashMap::new();
    metadata.insert(
        meta_keys::DOCUMENT_TYPE.to_string(),
        meta_keys::SCHEMA_DOCUMENT.to_string(),
    );
    metadata.insert(
        meta_keys::DATABASE_TYPE.to_string(),
        schema.kind.as_str().to_string(),
    );
    metadata.insert(
        meta_keys::COLLECTION_NAME.to_string(),
        schema.name.clone(),
    );

    let length = content.chars().count();
    let document = Document {
        id: doc_id,
        filename: format!("{}.schema.md", schema.id),
        content_type: "text/markdown".into(),
        uploaded_by: "system".into(),
        uploaded_at: Utc::now(),
        size_bytes: content.len() as i64,
        metadata,
        chunks: vec![Chunk {
            id: chunk_id,
            document_id: doc_id,
            index: 0,
            content,
            start_position: 0,
            end_position: length,
            document_type: Some(meta_keys::SCHEMA_DOCUMENT.to_string()),
            embedding: Vec::new(),
        }],
    };

    store.upsert(&document).await
}

fn render_schema_markdown(schema: &DatabaseSchemaInfo) -> String {
    let mut out = format!(
        "# Database {} ({})\n\nTotal rows: {}\n",
        schema.name,
        schema.kind.as_str(),
        schema.total_row_count
    );
    for table in &schema.tables {
        let _ = write!(out, "\n## {} ({} rows)\n", table.name, table.row_count);
        for column in &table.columns {
            let _ = writeln!(
                out,
                "- {} {}{}{}",
                column.name,
                column.data_type,
                if column.is_primary_key { " PK" } else { "" },
                if column.nullable { "" } else { " NOT NULL" },
            );
        }
        for fk in &table.foreign_keys {
            let _ = writeln!(
                out,
                "- FK {} -> {}.{}",
                fk.column, fk.references_table, fk.references_column
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;
    use sqlx::Connection;

    async fn seeded_database() -> (tempfile::TempDir, DatabaseConnectionConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sales.sqlite");
        let url = format!("sqlite:{}?mode=rwc", path.display());

        let mut conn = sqlx::sqlite::SqliteConnection::connect(&url).await.unwrap();
        sqlx::query(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE invoices (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL REFERENCES customers(id), total REAL)",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        sqlx::query("INSERT INTO customers (name) VALUES ('acme'), ('globex')")
            .execute(&mut conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO invoices (customer_id, total) VALUES (1, 500.0)")
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();

        let config = DatabaseConnectionConfig {
            id: None,
            name: "Sales".into(),
            kind: DatabaseKind::Sqlite,
            connection_string: url,
            enabled: true,
            max_rows: 100,
        };
        (dir, config)
    }

    #[tokio::test]
    async fn test_analyze_sqlite_schema() {
        let (_dir, config) = seeded_database().await;
        let schema = analyze_database(&config).await.unwrap();

        assert_eq!(schema.status, AnalysisStatus::Completed);
        assert_eq!(schema.id, "sales");
        assert_eq!(schema.tables.len(), 2);
        assert_eq!(schema.total_row_count, 3);

        let customers = schema.table("customers").unwrap();
        assert_eq!(customers.row_count, 2);
        assert!(customers.primary_keys.contains(&"id".to_string()));
        let name_col = customers.column("name", false).unwrap();
        assert!(!name_col.nullable);

        let invoices = schema.table("invoices").unwrap();
        assert_eq!(invoices.foreign_keys.len(), 1);
        assert_eq!(invoices.foreign_keys[0].references_table, "customers");
        // The FK column exists among the columns and carries the flag.
        assert!(invoices.column("customer_id", false).unwrap().is_foreign_key);
        assert!(invoices.sample_data.is_some());
    }

    #[tokio::test]
    async fn test_catalog_marks_failures() {
        let catalog = Arc::new(SchemaCatalog::new());
        let config = DatabaseConnectionConfig {
            id: Some("broken".into()),
            name: "Broken".into(),
            kind: DatabaseKind::Sqlite,
            connection_string: "sqlite:/nonexistent/dir/db.sqlite".into(),
            enabled: true,
            max_rows: 100,
        };
        catalog.analyze_all(&[config], None).await;

        let entry = catalog.get("broken").await.unwrap();
        assert_eq!(entry.status, AnalysisStatus::Failed);
        assert!(entry.error.is_some());
        assert!(catalog.completed().await.is_empty());
    }

    #[tokio::test]
    async fn test_catalog_snapshot_and_schema_document() {
        let (_dir, config) = seeded_database().await;
        let pool = store::connect_in_memory().await.unwrap();
        store::run_migrations(&pool).await.unwrap();
        let docs = DocumentStore::new(pool);

        let catalog = Arc::new(SchemaCatalog::new());
        catalog.analyze_all(std::slice::from_ref(&config), Some(&docs)).await;

        let completed = catalog.completed().await;
        assert_eq!(completed.len(), 1);

        // The schema mirror landed in the store, outside the user listing.
        let schemas = docs.list(0, 10, true).await.unwrap();
        assert_eq!(schemas.len(), 1);
        assert!(schemas[0].is_schema_document());
        assert!(docs.list(0, 10, false).await.unwrap().is_empty());

        // Re-analysis upserts in place instead of duplicating.
        catalog.analyze_all(std::slice::from_ref(&config), Some(&docs)).await;
        assert_eq!(docs.list(0, 10, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_databases_skipped() {
        let catalog = Arc::new(SchemaCatalog::new());
        let config = DatabaseConnectionConfig {
            id: Some("off".into()),
            name: "Off".into(),
            kind: DatabaseKind::Sqlite,
            connection_string: "sqlite::memory:".into(),
            enabled: false,
            max_rows: 100,
        };
        catalog.analyze_all(&[config], None).await;
        assert!(catalog.snapshot().await.is_empty());
    }
}
