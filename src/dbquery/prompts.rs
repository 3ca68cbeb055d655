//! Prompt assembly for multi-database SQL generation.
//!
//! The system message carries the full schema catalog (tables, columns,
//! foreign keys, cross-database table overlaps); the user message carries
//! routing rules, dialect reminders, a few-shot example, and the question.
//! Keeping the two apart measurably improves instruction adherence.

use std::collections::HashMap;
use std::fmt::Write;

use crate::models::{DatabaseKind, DatabaseQueryIntent, DatabaseSchemaInfo};

/// System message enumerating every analyzed schema.
pub fn build_system_message(schemas: &[&DatabaseSchemaInfo]) -> String {
    let mut out = String::from(
        "You are a SQL generation assistant. You write one read-only query per \
         requested database, strictly following each database's dialect and schema. \
         Never invent tables or columns.\n",
    );

    for schema in schemas {
        let _ = write!(
            out,
            "\n## Database '{}' (id: {}, dialect: {})\n",
            schema.name,
            schema.id,
            dialect_label(schema.kind)
        );
        for table in &schema.tables {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| {
                    let mut desc = format!("{} {}", c.name, c.data_type);
                    if c.is_primary_key {
                        desc.push_str(" PK");
                    }
                    if !c.nullable {
                        desc.push_str(" NOT NULL");
                    }
                    desc
                })
                .collect();
            let _ = writeln!(
                out,
                "- {} ({} rows): {}",
                table.name,
                table.row_count,
                columns.join(", ")
            );
            for fk in &table.foreign_keys {
                let _ = writeln!(
                    out,
                    "  FK {}.{} -> {}.{}",
                    table.name, fk.column, fk.references_table, fk.references_column
                );
            }
        }
    }

    let overlaps = cross_database_overlaps(schemas);
    if !overlaps.is_empty() {
        out.push_str("\n## Tables appearing in more than one database\n");
        for (table, databases) in overlaps {
            let _ = writeln!(out, "- {} in: {}", table, databases.join(", "));
        }
        out.push_str(
            "Queries never join across databases; pick the database the intent names.\n",
        );
    }

    out
}

/// User message: rules, per-dialect reminders, few-shot, and the question.
pub fn build_user_message(
    query: &str,
    intents: &[DatabaseQueryIntent],
    kinds: &HashMap<String, DatabaseKind>,
) -> String {
    let mut out = String::from(
        "Generate exactly one SELECT statement per requested database.\n\
         Rules:\n\
         - Read-only: no DDL or DML of any kind.\n\
         - No CROSS JOIN; at most two nested SELECT levels.\n\
         - Reference only the listed tables and columns.\n\
         - Respond with a JSON array only, no prose: \
           [{\"database_id\": \"...\", \"sql\": \"...\"}]\n",
    );

    out.push_str("\nDialect reminders:\n");
    for intent in intents {
        let kind = kinds.get(&intent.database_id).copied();
        let reminder = match kind {
            Some(DatabaseKind::SqlServer) => {
                "SQL Server: TOP immediately after SELECT; never LIMIT; bracket [identifiers]."
            }
            Some(DatabaseKind::PostgreSql) => {
                "PostgreSQL: double-quote identifiers that contain uppercase; LIMIT at the end."
            }
            Some(DatabaseKind::MySql) => {
                "MySQL: backtick `identifiers`; LIMIT at the end; derived tables need an alias."
            }
            Some(DatabaseKind::Sqlite) | None => "SQLite: plain identifiers; LIMIT at the end.",
        };
        let _ = writeln!(out, "- {} ({}): {}", intent.database_name, intent.database_id, reminder);
    }

    out.push_str(
        "\nExample:\n\
         Question: how many active users are there?\n\
         Answer: [{\"database_id\": \"app\", \"sql\": \"SELECT COUNT(*) FROM users WHERE active = 1\"}]\n",
    );

    out.push_str("\nRequested databases and tables:\n");
    for intent in intents {
        let _ = writeln!(
            out,
            "- {} (id: {}): tables {}; purpose: {}",
            intent.database_name,
            intent.database_id,
            intent.tables.join(", "),
            intent.purpose
        );
    }

    let _ = write!(out, "\nQuestion: {query}");
    out
}

/// Stricter re-prompt used after a malformed generation response.
pub fn build_strict_retry_message(query: &str, intents: &[DatabaseQueryIntent]) -> String {
    let ids: Vec<&str> = intents.iter().map(|i| i.database_id.as_str()).collect();
    format!(
        "Your previous response was not valid JSON. Respond with ONLY a JSON array, \
         one object per database id in [{}], each exactly \
         {{\"database_id\": \"...\", \"sql\": \"...\"}}. No markdown fences, no commentary.\n\
         Question: {}",
        ids.join(", "),
        query
    )
}

fn dialect_label(kind: DatabaseKind) -> &'static str {
    match kind {
        DatabaseKind::Sqlite => "SQLite",
        DatabaseKind::SqlServer => "SQL Server",
        DatabaseKind::MySql => "MySQL",
        DatabaseKind::PostgreSql => "PostgreSQL",
    }
}

/// Table names present in more than one schema, with the databases carrying
/// them.
fn cross_database_overlaps(schemas: &[&DatabaseSchemaInfo]) -> Vec<(String, Vec<String>)> {
    let mut by_table: HashMap<String, Vec<String>> = HashMap::new();
    for schema in schemas {
        for table in &schema.tables {
            by_table
                .entry(table.name.to_lowercase())
                .or_default()
                .push(schema.name.clone());
        }
    }
    let mut overlaps: Vec<(String, Vec<String>)> = by_table
        .into_iter()
        .filter(|(_, dbs)| dbs.len() > 1)
        .collect();
    overlaps.sort_by(|a, b| a.0.cmp(&b.0));
    overlaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisStatus, ColumnSchema, TableSchema};
    use chrono::Utc;

    fn schema(name: &str, kind: DatabaseKind, tables: &[&str]) -> DatabaseSchemaInfo {
        DatabaseSchemaInfo {
            id: name.to_lowercase(),
            name: name.to_string(),
            kind,
            analyzed_at: Utc::now(),
            tables: tables
                .iter()
                .map(|t| TableSchema {
                    name: t.to_string(),
                    columns: vec![ColumnSchema {
                        name: "id".into(),
                        data_type: "integer".into(),
                        nullable: false,
                        is_primary_key: true,
                        is_foreign_key: false,
                        max_length: None,
                    }],
                    primary_keys: vec!["id".into()],
                    foreign_keys: vec![],
                    row_count: 10,
                    sample_data: None,
                })
                .collect(),
            total_row_count: 10,
            status: AnalysisStatus::Completed,
            error: None,
        }
    }

    #[test]
    fn test_system_message_lists_schemas_and_overlaps() {
        let sales = schema("Sales", DatabaseKind::MySql, &["customers", "invoices"]);
        let payments = schema("Payments", DatabaseKind::PostgreSql, &["customers"]);
        let message = build_system_message(&[&sales, &payments]);

        assert!(message.contains("Database 'Sales'"));
        assert!(message.contains("dialect: MySQL"));
        assert!(message.contains("invoices (10 rows)"));
        assert!(message.contains("customers in: Sales, Payments"));
    }

    #[test]
    fn test_user_message_has_dialect_reminders() {
        let intents = vec![
            DatabaseQueryIntent {
                database_id: "sales".into(),
                database_name: "Sales".into(),
                tables: vec!["customers".into()],
                sql: None,
                purpose: "find overdue customers".into(),
                priority: 2,
            },
            DatabaseQueryIntent {
                database_id: "hr".into(),
                database_name: "HR".into(),
                tables: vec!["employees".into()],
                sql: None,
                purpose: "headcount".into(),
                priority: 1,
            },
        ];
        let mut kinds = HashMap::new();
        kinds.insert("sales".to_string(), DatabaseKind::MySql);
        kinds.insert("hr".to_string(), DatabaseKind::SqlServer);

        let message = build_user_message("overdue invoices over 500", &intents, &kinds);
        assert!(message.contains("TOP immediately after SELECT"));
        assert!(message.contains("backtick"));
        assert!(message.contains("Question: overdue invoices over 500"));
        assert!(message.contains("\"database_id\""));
    }

    #[test]
    fn test_strict_retry_names_every_id() {
        let intents = vec![DatabaseQueryIntent {
            database_id: "sales".into(),
            database_name: "Sales".into(),
            tables: vec![],
            sql: None,
            purpose: String::new(),
            priority: 0,
        }];
        let message = build_strict_retry_message("q", &intents);
        assert!(message.contains("[sales]"));
        assert!(message.contains("ONLY a JSON array"));
    }
}
