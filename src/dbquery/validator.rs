//! Catalog-backed validation of generated SQL.
//!
//! Table references after `FROM`/`JOIN` and `alias.column` references are
//! resolved against the cached schema under the dialect's case rules.
//! Referencing a table that exists but was not named by the intent is a
//! warning, not an error; other databases' names leaking into a query is an
//! error.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::dbquery::dialect;
use crate::models::{DatabaseKind, DatabaseSchemaInfo};

#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Words that can follow a table reference without being its alias.
const NON_ALIAS_KEYWORDS: &[&str] = &[
    "WHERE", "ON", "GROUP", "ORDER", "HAVING", "LIMIT", "UNION", "JOIN", "INNER", "LEFT",
    "RIGHT", "FULL", "OUTER", "CROSS", "SET", "AND", "OR", "FETCH", "OFFSET", "TOP",
];

/// A parsed `FROM`/`JOIN` reference.
#[derive(Debug, Clone)]
struct TableRef {
    /// Optional qualifier (`schema.` or a leaked database name).
    qualifier: Option<String>,
    name: String,
    alias: Option<String>,
}

fn table_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_\x22\x5B`][\w\.\x22\x5B\x5D`]*)(?:\s+(?:AS\s+)?([A-Za-z_]\w*))?"#,
        )
        .expect("valid regex")
    })
}

fn column_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b([A-Za-z_]\w*)\.(\x22?[A-Za-z_]\w*\x22?)"#).expect("valid regex")
    })
}

fn strip_quoting(ident: &str) -> String {
    ident
        .trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .to_string()
}

fn parse_table_refs(masked: &str) -> Vec<TableRef> {
    let mut refs = Vec::new();
    for caps in table_ref_re().captures_iter(masked) {
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let parts: Vec<String> = raw.split('.').map(strip_quoting).collect();
        let (qualifier, name) = match parts.len() {
            2 => (Some(parts[0].clone()), parts[1].clone()),
            _ => (None, parts.last().cloned().unwrap_or_default()),
        };
        if name.is_empty() {
            continue;
        }
        let alias = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .filter(|a| !NON_ALIAS_KEYWORDS.contains(&a.to_uppercase().as_str()));
        refs.push(TableRef {
            qualifier,
            name,
            alias,
        });
    }
    refs
}

/// Validate one generated query against its database schema.
///
/// `required_tables` comes from the intent; `all_database_names` lets the
/// validator catch identifiers that belong to a sibling database.
pub fn validate(
    sql: &str,
    schema: &DatabaseSchemaInfo,
    required_tables: &[String],
    all_database_names: &[String],
) -> ValidationReport {
    let mut report = ValidationReport::default();
    report.errors.extend(dialect::validate_syntax(sql));

    let masked = dialect::mask_literals(sql);
    let refs = parse_table_refs(&masked);

    // alias -> resolved table name (aliases and bare table names both work
    // as column qualifiers).
    let mut alias_map: HashMap<String, String> = HashMap::new();

    for table_ref in &refs {
        // A qualifier naming a sibling database is cross-database leakage.
        if let Some(qualifier) = &table_ref.qualifier {
            let leaked = all_database_names.iter().find(|n| {
                n.eq_ignore_ascii_case(qualifier) && !n.eq_ignore_ascii_case(&schema.name)
            });
            if let Some(other) = leaked {
                report.errors.push(format!(
                    "table {}.{} belongs to database '{}'; this query runs on '{}'",
                    qualifier, table_ref.name, other, schema.name
                ));
                continue;
            }
        }

        match schema.table(&table_ref.name) {
            Some(table) => {
                let required = required_tables.is_empty()
                    || required_tables
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(&table_ref.name));
                if !required {
                    report.warnings.push(format!(
                        "table '{}' exists but was not named by the intent",
                        table.name
                    ));
                }
                let key = table_ref
                    .alias
                    .clone()
                    .unwrap_or_else(|| table_ref.name.clone());
                alias_map.insert(key.to_lowercase(), table.name.clone());
            }
            None => {
                if schema.kind == DatabaseKind::PostgreSql {
                    if let Some(actual) = schema.table_any_case(&table_ref.name) {
                        report.errors.push(format!(
                            "table '{}': case mismatch, use '{}'",
                            table_ref.name, actual.name
                        ));
                        let key = table_ref
                            .alias
                            .clone()
                            .unwrap_or_else(|| table_ref.name.clone());
                        alias_map.insert(key.to_lowercase(), actual.name.clone());
                        continue;
                    }
                }
                report.errors.push(format!(
                    "unknown table '{}' in database '{}'",
                    table_ref.name, schema.name
                ));
            }
        }
    }

    // alias.column references must resolve when the table is required.
    let case_sensitive = schema.kind.case_sensitive();
    for caps in column_ref_re().captures_iter(&masked) {
        let qualifier = caps[1].to_lowercase();
        let column = strip_quoting(&caps[2]);

        let Some(table_name) = alias_map.get(&qualifier) else {
            continue; // schema prefix or unrelated dotted token
        };
        let required = required_tables.is_empty()
            || required_tables
                .iter()
                .any(|t| t.eq_ignore_ascii_case(table_name));
        if !required {
            continue;
        }
        let Some(table) = schema.table_any_case(table_name) else {
            continue;
        };

        if table.column(&column, case_sensitive).is_none() {
            if let Some(actual) = table.column(&column, false) {
                report.errors.push(format!(
                    "column '{}.{}': case mismatch, use '{}'",
                    &caps[1], column, actual.name
                ));
            } else {
                report.errors.push(format!(
                    "unknown column '{}' on table '{}'",
                    column, table.name
                ));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisStatus, ColumnSchema, TableSchema};
    use chrono::Utc;

    fn schema(kind: DatabaseKind, tables: &[(&str, &[&str])]) -> DatabaseSchemaInfo {
        DatabaseSchemaInfo {
            id: "sales".into(),
            name: "Sales".into(),
            kind,
            analyzed_at: Utc::now(),
            tables: tables
                .iter()
                .map(|(name, columns)| TableSchema {
                    name: name.to_string(),
                    columns: columns
                        .iter()
                        .map(|c| ColumnSchema {
                            name: c.to_string(),
                            data_type: "text".into(),
                            nullable: true,
                            is_primary_key: false,
                            is_foreign_key: false,
                            max_length: None,
                        })
                        .collect(),
                    primary_keys: vec![],
                    foreign_keys: vec![],
                    row_count: 0,
                    sample_data: None,
                })
                .collect(),
            total_row_count: 0,
            status: AnalysisStatus::Completed,
            error: None,
        }
    }

    #[test]
    fn test_known_tables_pass() {
        let schema = schema(
            DatabaseKind::MySql,
            &[("customers", &["id", "name"]), ("invoices", &["id", "total"])],
        );
        let report = validate(
            "SELECT c.name, i.total FROM customers c JOIN invoices i ON i.id = c.id",
            &schema,
            &["customers".into(), "invoices".into()],
            &["Sales".into()],
        );
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_unknown_table_is_error() {
        let schema = schema(DatabaseKind::MySql, &[("customers", &["id"])]);
        let report = validate(
            "SELECT * FROM orders",
            &schema,
            &["orders".into()],
            &[],
        );
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("unknown table 'orders'"));
    }

    #[test]
    fn test_case_insensitive_match_outside_postgres() {
        let schema = schema(DatabaseKind::SqlServer, &[("Customers", &["Id"])]);
        let report = validate("SELECT * FROM customers", &schema, &[], &[]);
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }

    #[test]
    fn test_postgres_case_mismatch_hint() {
        let schema = schema(DatabaseKind::PostgreSql, &[("Users", &["id"])]);
        let report = validate("SELECT id FROM users", &schema, &["Users".into()], &[]);
        assert!(!report.is_valid());
        assert!(
            report.errors[0].contains("case mismatch, use 'Users'"),
            "got: {}",
            report.errors[0]
        );
    }

    #[test]
    fn test_unrequired_table_is_warning_only() {
        let schema = schema(
            DatabaseKind::MySql,
            &[("customers", &["id"]), ("audit_log", &["id"])],
        );
        let report = validate(
            "SELECT * FROM audit_log",
            &schema,
            &["customers".into()],
            &[],
        );
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("audit_log"));
    }

    #[test]
    fn test_cross_database_leakage_detected() {
        let schema = schema(DatabaseKind::MySql, &[("customers", &["id"])]);
        let report = validate(
            "SELECT * FROM Payments.transactions",
            &schema,
            &[],
            &["Sales".into(), "Payments".into()],
        );
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("belongs to database 'Payments'"));
    }

    #[test]
    fn test_unknown_aliased_column_is_error() {
        let schema = schema(DatabaseKind::MySql, &[("customers", &["id", "name"])]);
        let report = validate(
            "SELECT c.email FROM customers c",
            &schema,
            &["customers".into()],
            &[],
        );
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("unknown column 'email'"));
    }

    #[test]
    fn test_postgres_column_case_mismatch_hint() {
        let schema = schema(DatabaseKind::PostgreSql, &[("orders", &["Total"])]);
        let report = validate(
            "SELECT o.total FROM orders o",
            &schema,
            &["orders".into()],
            &[],
        );
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("case mismatch, use 'Total'"));
    }

    #[test]
    fn test_forbidden_statements_surface_as_errors() {
        let schema = schema(DatabaseKind::Sqlite, &[("t", &["id"])]);
        let report = validate("DELETE FROM t", &schema, &[], &[]);
        assert!(report.errors.iter().any(|e| e.contains("DELETE")));
    }

    #[test]
    fn test_subquery_parens_not_parsed_as_table() {
        let schema = schema(DatabaseKind::MySql, &[("orders", &["id", "total"])]);
        let report = validate(
            "SELECT * FROM (SELECT id FROM orders) AS t",
            &schema,
            &["orders".into()],
            &[],
        );
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }
}
