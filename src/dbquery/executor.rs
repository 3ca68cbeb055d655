//! Live query execution against the four supported dialects.
//!
//! SQLite, MySQL, and PostgreSQL go through sqlx; SQL Server goes through
//! tiberius over a TDS connection. Results come back as plain string rows
//! rendered into a text table for the merge stage; no driver types leak out
//! of this module.

use sqlx::{Column, Connection, Row};
use tokio_util::compat::TokioAsyncWriteCompatExt;

use crate::error::{HarnessError, Result};
use crate::models::DatabaseKind;

/// A result set flattened to display strings.
#[derive(Debug, Clone, Default)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryRows {
    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    /// Pipe-separated table with a header, suitable for grounding prompts.
    pub fn render_table(&self) -> String {
        if self.columns.is_empty() {
            return "(no rows)".to_string();
        }
        let mut out = self.columns.join(" | ");
        out.push('\n');
        out.push_str(&"-".repeat(out.len().saturating_sub(1).max(3)));
        for row in &self.rows {
            out.push('\n');
            out.push_str(&row.join(" | "));
        }
        out.push_str(&format!("\n({} rows)", self.rows.len()));
        out
    }
}

/// Execute one read query, capping the result at `max_rows`.
pub async fn execute(
    kind: DatabaseKind,
    connection_string: &str,
    sql: &str,
    max_rows: usize,
) -> Result<QueryRows> {
    match kind {
        DatabaseKind::Sqlite => execute_sqlite(connection_string, sql, max_rows).await,
        DatabaseKind::MySql => execute_mysql(connection_string, sql, max_rows).await,
        DatabaseKind::PostgreSql => execute_postgres(connection_string, sql, max_rows).await,
        DatabaseKind::SqlServer => execute_sqlserver(connection_string, sql, max_rows).await,
    }
}

/// Cheap connectivity check: open a connection and run `SELECT 1`.
pub async fn probe(kind: DatabaseKind, connection_string: &str) -> Result<()> {
    execute(kind, connection_string, "SELECT 1", 1).await.map(|_| ())
}

async fn execute_sqlite(connection_string: &str, sql: &str, max_rows: usize) -> Result<QueryRows> {
    let mut conn = sqlx::sqlite::SqliteConnection::connect(connection_string).await?;
    let rows = sqlx::query(sql).fetch_all(&mut conn).await?;
    conn.close().await?;

    let mut result = QueryRows::default();
    for (i, row) in rows.iter().enumerate() {
        if i >= max_rows {
            break;
        }
        if result.columns.is_empty() {
            result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        }
        result.rows.push(
            (0..row.columns().len())
                .map(|idx| sqlite_value(row, idx))
                .collect(),
        );
    }
    Ok(result)
}

fn sqlite_value(row: &sqlx::sqlite::SqliteRow, idx: usize) -> String {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|b| format!("<{} bytes>", b.len()))
            .unwrap_or_else(|| "NULL".to_string());
    }
    "?".to_string()
}

async fn execute_mysql(connection_string: &str, sql: &str, max_rows: usize) -> Result<QueryRows> {
    let mut conn = sqlx::mysql::MySqlConnection::connect(connection_string).await?;
    let rows = sqlx::query(sql).fetch_all(&mut conn).await?;
    conn.close().await?;

    let mut result = QueryRows::default();
    for (i, row) in rows.iter().enumerate() {
        if i >= max_rows {
            break;
        }
        if result.columns.is_empty() {
            result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        }
        result.rows.push(
            (0..row.columns().len())
                .map(|idx| mysql_value(row, idx))
                .collect(),
        );
    }
    Ok(result)
}

fn mysql_value(row: &sqlx::mysql::MySqlRow, idx: usize) -> String {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(|d| d.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v.map(|d| d.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    "?".to_string()
}

async fn execute_postgres(
    connection_string: &str,
    sql: &str,
    max_rows: usize,
) -> Result<QueryRows> {
    let mut conn = sqlx::postgres::PgConnection::connect(connection_string).await?;
    let rows = sqlx::query(sql).fetch_all(&mut conn).await?;
    conn.close().await?;

    let mut result = QueryRows::default();
    for (i, row) in rows.iter().enumerate() {
        if i >= max_rows {
            break;
        }
        if result.columns.is_empty() {
            result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        }
        result.rows.push(
            (0..row.columns().len())
                .map(|idx| postgres_value(row, idx))
                .collect(),
        );
    }
    Ok(result)
}

fn postgres_value(row: &sqlx::postgres::PgRow, idx: usize) -> String {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(|b| b.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
        return v.map(|u| u.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(|d| d.to_string()).unwrap_or_else(|| "NULL".to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|d| d.to_rfc3339()).unwrap_or_else(|| "NULL".to_string());
    }
    "?".to_string()
}

async fn execute_sqlserver(
    connection_string: &str,
    sql: &str,
    max_rows: usize,
) -> Result<QueryRows> {
    let config = tiberius::Config::from_ado_string(connection_string)
        .map_err(|e| HarnessError::provider(format!("sqlserver config: {e}")))?;

    let tcp = tokio::net::TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;

    let mut client = tiberius::Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| HarnessError::provider(format!("sqlserver connect: {e}")))?;

    let stream = client
        .simple_query(sql)
        .await
        .map_err(|e| HarnessError::provider(format!("sqlserver query: {e}")))?;
    let result_sets = stream
        .into_results()
        .await
        .map_err(|e| HarnessError::provider(format!("sqlserver fetch: {e}")))?;

    let mut result = QueryRows::default();
    let Some(rows) = result_sets.into_iter().next() else {
        return Ok(result);
    };

    for (i, row) in rows.into_iter().enumerate() {
        if i >= max_rows {
            break;
        }
        if result.columns.is_empty() {
            result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
        }
        result
            .rows
            .push(row.into_iter().map(sqlserver_value).collect());
    }
    Ok(result)
}

fn sqlserver_value(data: tiberius::ColumnData<'_>) -> String {
    use tiberius::ColumnData;
    match data {
        ColumnData::String(v) => v.map(|s| s.into_owned()).unwrap_or_else(|| "NULL".into()),
        ColumnData::I16(v) => v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::I32(v) => v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::I64(v) => v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::U8(v) => v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::F32(v) => v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::F64(v) => v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::Bit(v) => v.map(|b| b.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::Guid(v) => v.map(|g| g.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::Numeric(v) => v.map(|n| n.to_string()).unwrap_or_else(|| "NULL".into()),
        ColumnData::Binary(v) => v
            .map(|b| format!("<{} bytes>", b.len()))
            .unwrap_or_else(|| "NULL".into()),
        other => format!("{other:?}"),
    }
}
