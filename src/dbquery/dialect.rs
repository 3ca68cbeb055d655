//! Per-dialect SQL handling: identifier quoting, syntax guards, limit
//! clauses, and rule-based repair of common generation mistakes.
//!
//! Repairs are purely textual and schema-aware where noted; nothing here
//! rewrites query semantics. Forbidden-keyword checks ignore anything inside
//! single-quoted literals.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::{DatabaseKind, DatabaseSchemaInfo};

/// Function names that are legitimate in all four dialects; anything else
/// wrapping a bare column is treated as hallucinated.
const KNOWN_FUNCTIONS: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "ABS", "ROUND", "FLOOR", "CEILING", "UPPER", "LOWER",
    "LEN", "LENGTH", "SUBSTRING", "SUBSTR", "TRIM", "LTRIM", "RTRIM", "REPLACE", "CONCAT",
    "COALESCE", "ISNULL", "IFNULL", "NULLIF", "CAST", "CONVERT", "FORMAT", "YEAR", "MONTH",
    "DAY", "DATE", "DATEPART", "DATEDIFF", "DATEADD", "DATENAME", "GETDATE", "NOW", "STRFTIME",
    "EXTRACT", "DISTINCT", "EXISTS", "IN", "ANY", "ALL", "SOME", "NOT", "AND", "OR", "VALUES",
    "GROUP_CONCAT", "STRING_AGG", "ROW_NUMBER", "RANK", "DENSE_RANK",
];

fn forbidden_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(DROP|DELETE|TRUNCATE|ALTER|CREATE|GRANT|REVOKE|EXEC|EXECUTE)\b",
        )
        .expect("valid regex")
    })
}

fn cross_join_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bCROSS\s+JOIN\b").expect("valid regex"))
}

/// Replace the contents of single-quoted literals with spaces so keyword and
/// structure scans cannot match inside strings. `''` escapes survive. Byte
/// offsets are preserved (one space per masked byte), so positions found in
/// the masked text index the original safely.
pub fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if in_literal {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push_str("  ");
                } else {
                    in_literal = false;
                    out.push('\'');
                }
            } else {
                for _ in 0..c.len_utf8() {
                    out.push(' ');
                }
            }
        } else {
            out.push(c);
            if c == '\'' {
                in_literal = true;
            }
        }
    }
    out
}

/// Escape one identifier for the dialect. PostgreSQL quotes only when the
/// identifier carries uppercase (lowercase identifiers fold naturally).
pub fn escape_identifier(kind: DatabaseKind, ident: &str) -> String {
    match kind {
        DatabaseKind::MySql => format!("`{ident}`"),
        DatabaseKind::SqlServer => format!("[{ident}]"),
        DatabaseKind::Sqlite => format!("\"{ident}\""),
        DatabaseKind::PostgreSql => {
            if ident.chars().any(|c| c.is_uppercase()) {
                format!("\"{ident}\"")
            } else {
                ident.to_string()
            }
        }
    }
}

/// Structural checks shared by every dialect. Empty result means the SQL is
/// acceptable to execute.
pub fn validate_syntax(sql: &str) -> Vec<String> {
    let masked = mask_literals(sql);
    let mut errors = Vec::new();

    if let Some(m) = forbidden_re().find(&masked) {
        errors.push(format!(
            "forbidden keyword {} is not allowed in generated queries",
            m.as_str().to_uppercase()
        ));
    }

    if cross_join_re().is_match(&masked) {
        errors.push("CROSS JOIN is not allowed".to_string());
    }

    let depth = max_select_nesting(&masked);
    if depth > 2 {
        errors.push(format!(
            "query nests SELECT {depth} levels deep, maximum is 2"
        ));
    }

    errors
}

/// Deepest parenthesis level at which a `SELECT` keyword occurs.
/// The outermost statement counts as level 0.
fn max_select_nesting(masked: &str) -> usize {
    let mut depth: usize = 0;
    let mut max_depth = 0;
    let mut word = String::new();

    for c in masked.chars() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            continue;
        }
        if word.eq_ignore_ascii_case("SELECT") && depth > max_depth {
            max_depth = depth;
        }
        word.clear();
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if word.eq_ignore_ascii_case("SELECT") && depth > max_depth {
        max_depth = depth;
    }
    max_depth
}

/// Cap result size: `TOP n` right after `SELECT` on SQL Server, a trailing
/// `LIMIT n` everywhere else. Queries that already carry a cap are left
/// alone.
pub fn apply_limit(kind: DatabaseKind, sql: &str, limit: u32) -> String {
    let masked = mask_literals(sql);
    let trimmed = sql.trim_end().trim_end_matches(';').to_string();

    match kind {
        DatabaseKind::SqlServer => {
            static TOP: OnceLock<Regex> = OnceLock::new();
            let top =
                TOP.get_or_init(|| Regex::new(r"(?i)\bSELECT\s+(DISTINCT\s+)?TOP\b").expect("valid regex"));
            if top.is_match(&masked) {
                trimmed
            } else {
                insert_top(&trimmed, limit)
            }
        }
        _ => {
            static LIMIT: OnceLock<Regex> = OnceLock::new();
            let has_limit =
                LIMIT.get_or_init(|| Regex::new(r"(?i)\bLIMIT\s+\d+").expect("valid regex"));
            if has_limit.is_match(&masked) {
                trimmed
            } else {
                format!("{trimmed} LIMIT {limit}")
            }
        }
    }
}

/// Insert `TOP n` after the first `SELECT` (after `DISTINCT` when present).
fn insert_top(sql: &str, n: u32) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?i)^(\s*SELECT\s+(?:DISTINCT\s+)?)").expect("valid regex"));
    if let Some(m) = re.find(sql) {
        format!("{}TOP {} {}", &sql[..m.end()], n, &sql[m.end()..])
    } else {
        sql.to_string()
    }
}

/// Apply the dialect's rule-based repairs to a generated query.
pub fn repair(kind: DatabaseKind, sql: &str, schema: &DatabaseSchemaInfo) -> String {
    let sql = sql.trim().trim_end_matches(';').to_string();
    match kind {
        DatabaseKind::SqlServer => repair_sqlserver(&sql, schema),
        DatabaseKind::PostgreSql => repair_postgres(&sql, schema),
        DatabaseKind::MySql => repair_mysql(&sql),
        DatabaseKind::Sqlite => sql,
    }
}

// ============ SQL Server ============

fn repair_sqlserver(sql: &str, schema: &DatabaseSchemaInfo) -> String {
    // Backtick identifiers become brackets.
    static BACKTICK: OnceLock<Regex> = OnceLock::new();
    let backtick = BACKTICK.get_or_init(|| Regex::new(r"`([^`]+)`").expect("valid regex"));
    let mut sql = backtick.replace_all(sql, "[$1]").to_string();

    // Trailing LIMIT n -> TOP n.
    static TRAILING_LIMIT: OnceLock<Regex> = OnceLock::new();
    let trailing_limit = TRAILING_LIMIT
        .get_or_init(|| Regex::new(r"(?i)\s+LIMIT\s+(\d+)\s*$").expect("valid regex"));
    if let Some(caps) = trailing_limit.captures(&sql) {
        let n: u32 = caps[1].parse().unwrap_or(100);
        sql = trailing_limit.replace(&sql, "").to_string();
        sql = strip_top(&sql);
        sql = insert_top(&sql, n);
    }

    // FETCH FIRST n ROWS ONLY -> TOP n.
    static FETCH_FIRST: OnceLock<Regex> = OnceLock::new();
    let fetch_first = FETCH_FIRST.get_or_init(|| {
        Regex::new(r"(?i)\s+FETCH\s+FIRST\s+(\d+)\s+ROWS?\s+ONLY\s*$").expect("valid regex")
    });
    if let Some(caps) = fetch_first.captures(&sql) {
        let n: u32 = caps[1].parse().unwrap_or(100);
        sql = fetch_first.replace(&sql, "").to_string();
        sql = strip_top(&sql);
        sql = insert_top(&sql, n);
    }

    // TOP dangling at the end of the statement moves up front.
    static TRAILING_TOP: OnceLock<Regex> = OnceLock::new();
    let trailing_top = TRAILING_TOP
        .get_or_init(|| Regex::new(r"(?i)\s+TOP\s+(\d+)\s*$").expect("valid regex"));
    if let Some(caps) = trailing_top.captures(&sql) {
        let n: u32 = caps[1].parse().unwrap_or(100);
        sql = trailing_top.replace(&sql, "").to_string();
        sql = insert_top(&sql, n);
    }

    sql = rewrite_group_by_ordinals(&sql);

    // Dotted aliases lose their qualifier: `AS t.name` -> `AS name`.
    static DOTTED_ALIAS: OnceLock<Regex> = OnceLock::new();
    let dotted_alias = DOTTED_ALIAS
        .get_or_init(|| Regex::new(r"(?i)\bAS\s+\w+\.(\w+)").expect("valid regex"));
    sql = dotted_alias.replace_all(&sql, "AS $1").to_string();

    drop_hallucinated_functions(&sql, schema)
}

fn strip_top(sql: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(SELECT\s+(?:DISTINCT\s+)?)TOP\s+\d+\s+").expect("valid regex")
    });
    re.replace(sql, "$1").to_string()
}

/// Rewrite `GROUP BY 1, 2` into the corresponding select-list expressions.
fn rewrite_group_by_ordinals(sql: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\bGROUP\s+BY\s+((?:\d+\s*,\s*)*\d+)\b").expect("valid regex")
    });

    let Some(caps) = re.captures(sql) else {
        return sql.to_string();
    };
    let items = parse_select_list(sql);
    if items.is_empty() {
        return sql.to_string();
    }

    let ordinals: Vec<usize> = caps[1]
        .split(',')
        .filter_map(|s| s.trim().parse::<usize>().ok())
        .collect();

    let mut resolved = Vec::with_capacity(ordinals.len());
    for ordinal in &ordinals {
        match ordinal.checked_sub(1).and_then(|i| items.get(i)) {
            Some(expr) => resolved.push(expr.clone()),
            None => return sql.to_string(),
        }
    }

    re.replace(sql, format!("GROUP BY {}", resolved.join(", ")))
        .to_string()
}

/// Select-list expressions with any `AS alias` suffix removed.
fn parse_select_list(sql: &str) -> Vec<String> {
    let masked = mask_literals(sql);
    static SELECT: OnceLock<Regex> = OnceLock::new();
    let select_re = SELECT.get_or_init(|| {
        Regex::new(r"(?i)\bSELECT\s+(?:DISTINCT\s+)?(?:TOP\s+\d+\s+)?").expect("valid regex")
    });
    let Some(m) = select_re.find(&masked) else {
        return Vec::new();
    };
    let start = m.end();

    // First FROM at paren depth 0 ends the list.
    let mut depth = 0usize;
    let mut word = String::new();
    let mut word_start = start;
    let mut end = masked.len();
    for (i, c) in masked[start..].char_indices() {
        let pos = start + i;
        if c.is_alphanumeric() || c == '_' {
            if word.is_empty() {
                word_start = pos;
            }
            word.push(c);
            continue;
        }
        if depth == 0 && word.eq_ignore_ascii_case("FROM") {
            end = word_start;
            break;
        }
        word.clear();
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    let list = &sql[start..end];
    static AS_ALIAS: OnceLock<Regex> = OnceLock::new();
    let as_alias = AS_ALIAS
        .get_or_init(|| Regex::new(r"(?i)\s+AS\s+[\w\[\]\x22]+\s*$").expect("valid regex"));

    split_top_level_commas(list)
        .into_iter()
        .map(|item| as_alias.replace(item.trim(), "").trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn split_top_level_commas(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut last = 0usize;
    for (i, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&list[last..i]);
                last = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[last..]);
    parts
}

/// Remove made-up function wrappers around plain schema columns:
/// `MAGIC(Price)` becomes `Price` when `Price` is a column and `MAGIC` is
/// not a known SQL function.
fn drop_hallucinated_functions(sql: &str, schema: &DatabaseSchemaInfo) -> String {
    static CALL: OnceLock<Regex> = OnceLock::new();
    let call = CALL.get_or_init(|| {
        Regex::new(r"\b([A-Za-z_]\w*)\s*\(\s*([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?)\s*\)")
            .expect("valid regex")
    });

    call.replace_all(sql, |caps: &regex::Captures<'_>| {
        let func = &caps[1];
        let arg = &caps[2];
        let func_upper = func.to_uppercase();
        if KNOWN_FUNCTIONS.contains(&func_upper.as_str()) {
            return caps[0].to_string();
        }
        let column = arg.rsplit('.').next().unwrap_or(arg);
        let is_column = schema
            .tables
            .iter()
            .any(|t| t.column(column, false).is_some());
        if is_column {
            arg.to_string()
        } else {
            caps[0].to_string()
        }
    })
    .to_string()
}

// ============ PostgreSQL ============

fn repair_postgres(sql: &str, schema: &DatabaseSchemaInfo) -> String {
    let mut sql = sql.to_string();

    // schema.table after FROM/JOIN gains full quoting.
    static QUALIFIED: OnceLock<Regex> = OnceLock::new();
    let qualified = QUALIFIED.get_or_init(|| {
        Regex::new(r#"(?i)\b(FROM|JOIN)\s+([A-Za-z_]\w*)\.([A-Za-z_]\w*)"#).expect("valid regex")
    });
    sql = qualified
        .replace_all(&sql, |caps: &regex::Captures<'_>| {
            format!("{} \"{}\".\"{}\"", &caps[1], &caps[2], &caps[3])
        })
        .to_string();

    // Identifiers with uppercase must be quoted to survive case folding.
    for table in &schema.tables {
        if table.name.chars().any(|c| c.is_uppercase()) {
            sql = quote_bare_identifier(&sql, &table.name);
        }
        for column in &table.columns {
            if column.name.chars().any(|c| c.is_uppercase()) {
                sql = quote_bare_identifier(&sql, &column.name);
            }
        }
    }

    // Aliases do not need quoting.
    static QUOTED_ALIAS: OnceLock<Regex> = OnceLock::new();
    let quoted_alias = QUOTED_ALIAS
        .get_or_init(|| Regex::new(r#"(?i)\bAS\s+"(\w+)""#).expect("valid regex"));
    sql = quoted_alias.replace_all(&sql, "AS $1").to_string();

    // Doubled quotes from over-eager generation collapse to one.
    while sql.contains("\"\"") {
        sql = sql.replace("\"\"", "\"");
    }

    sql
}

/// Wrap every unquoted occurrence of `name` in double quotes.
fn quote_bare_identifier(sql: &str, name: &str) -> String {
    let pattern = format!(r#"(^|[^"\w])({})($|[^"\w])"#, regex::escape(name));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return sql.to_string(),
    };
    // Two passes catch adjacent occurrences the first scan skips over.
    let mut out = sql.to_string();
    for _ in 0..2 {
        out = re.replace_all(&out, "$1\"$2\"$3").to_string();
    }
    out
}

// ============ MySQL ============

/// Derived tables need an alias in MySQL; append `_dt` (then `_dt2`, ...)
/// when the generator forgot one.
fn repair_mysql(sql: &str) -> String {
    let masked = mask_literals(sql);
    static OPEN: OnceLock<Regex> = OnceLock::new();
    let open = OPEN
        .get_or_init(|| Regex::new(r"(?i)\b(FROM|JOIN)\s*\(").expect("valid regex"));

    let mut inserts: Vec<usize> = Vec::new();
    for m in open.find_iter(&masked) {
        let open_pos = m.end() - 1;
        let Some(close_pos) = matching_paren(&masked, open_pos) else {
            continue;
        };
        // Only subqueries need aliases.
        let inner = masked[open_pos + 1..close_pos].trim_start();
        let is_subquery = inner
            .get(..6)
            .map(|head| head.eq_ignore_ascii_case("select"))
            .unwrap_or(false);
        if !is_subquery {
            continue;
        }
        let rest = masked[close_pos + 1..].trim_start();
        let next_word: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        let has_alias = !next_word.is_empty()
            && !matches!(
                next_word.to_uppercase().as_str(),
                "WHERE" | "GROUP" | "ORDER" | "LIMIT" | "HAVING" | "ON" | "JOIN" | "INNER"
                    | "LEFT" | "RIGHT" | "UNION" | "FULL"
            );
        if !has_alias && !rest.starts_with(',') {
            inserts.push(close_pos + 1);
        }
    }

    if inserts.is_empty() {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + inserts.len() * 8);
    let mut cursor = 0usize;
    for (i, &pos) in inserts.iter().enumerate() {
        out.push_str(&sql[cursor..pos]);
        if i == 0 {
            out.push_str(" AS _dt");
        } else {
            out.push_str(&format!(" AS _dt{}", i + 1));
        }
        cursor = pos;
    }
    out.push_str(&sql[cursor..]);
    out
}

/// Byte position of the parenthesis closing the one at `open_pos`.
fn matching_paren(masked: &str, open_pos: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in masked[open_pos..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open_pos + i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisStatus, ColumnSchema, TableSchema};
    use chrono::Utc;

    fn schema_with(tables: &[(&str, &[&str])]) -> DatabaseSchemaInfo {
        DatabaseSchemaInfo {
            id: "test".into(),
            name: "Test".into(),
            kind: DatabaseKind::SqlServer,
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
    fn test_escape_identifier_per_dialect() {
        assert_eq!(escape_identifier(DatabaseKind::MySql, "users"), "`users`");
        assert_eq!(escape_identifier(DatabaseKind::SqlServer, "users"), "[users]");
        assert_eq!(escape_identifier(DatabaseKind::Sqlite, "users"), "\"users\"");
        assert_eq!(escape_identifier(DatabaseKind::PostgreSql, "users"), "users");
        assert_eq!(
            escape_identifier(DatabaseKind::PostgreSql, "Users"),
            "\"Users\""
        );
    }

    #[test]
    fn test_forbidden_keyword_rejected() {
        let errors = validate_syntax("DROP TABLE users");
        assert!(errors[0].contains("DROP"));
        let errors = validate_syntax("select * from t where x = 1; delete from t");
        assert!(errors.iter().any(|e| e.contains("DELETE")));
    }

    #[test]
    fn test_forbidden_keyword_inside_literal_allowed() {
        let errors = validate_syntax("SELECT * FROM logs WHERE message = 'please DROP me'");
        assert!(errors.is_empty());
        // Escaped quote inside the literal does not end it early.
        let errors = validate_syntax("SELECT * FROM t WHERE name = 'it''s a DELETE day'");
        assert!(errors.is_empty());
    }

    #[test]
    fn test_cross_join_rejected() {
        let errors = validate_syntax("SELECT * FROM a CROSS JOIN b");
        assert!(errors.iter().any(|e| e.contains("CROSS JOIN")));
    }

    #[test]
    fn test_nesting_depth_limit() {
        let two_levels =
            "SELECT * FROM (SELECT id FROM (SELECT id FROM users) u) v";
        assert!(validate_syntax(two_levels).is_empty());

        let three_levels =
            "SELECT * FROM (SELECT id FROM (SELECT id FROM (SELECT id FROM users) w) u) v";
        assert!(!validate_syntax(three_levels).is_empty());
    }

    #[test]
    fn test_apply_limit_sqlserver_top() {
        let sql = apply_limit(DatabaseKind::SqlServer, "SELECT id FROM users", 50);
        assert_eq!(sql, "SELECT TOP 50 id FROM users");
        // Existing TOP is preserved.
        let sql = apply_limit(DatabaseKind::SqlServer, "SELECT TOP 5 id FROM users", 50);
        assert_eq!(sql, "SELECT TOP 5 id FROM users");
    }

    #[test]
    fn test_apply_limit_others_append() {
        let sql = apply_limit(DatabaseKind::MySql, "SELECT id FROM users", 100);
        assert_eq!(sql, "SELECT id FROM users LIMIT 100");
        let sql = apply_limit(DatabaseKind::PostgreSql, "SELECT id FROM users LIMIT 10", 100);
        assert_eq!(sql, "SELECT id FROM users LIMIT 10");
    }

    #[test]
    fn test_sqlserver_trailing_limit_becomes_top() {
        let schema = schema_with(&[("Products", &["id", "name"])]);
        let sql = repair(
            DatabaseKind::SqlServer,
            "SELECT * FROM Products LIMIT 10",
            &schema,
        );
        assert_eq!(sql, "SELECT TOP 10 * FROM Products");
    }

    #[test]
    fn test_sqlserver_trailing_top_moves_forward() {
        let schema = schema_with(&[("Users", &["Id"])]);
        let sql = repair(
            DatabaseKind::SqlServer,
            "SELECT * FROM Users ORDER BY Id DESC TOP 1",
            &schema,
        );
        assert_eq!(sql, "SELECT TOP 1 * FROM Users ORDER BY Id DESC");
    }

    #[test]
    fn test_sqlserver_order_by_price_desc_top_rewrite() {
        let schema = schema_with(&[("Products", &["id", "name", "price"])]);
        let sql = repair(
            DatabaseKind::SqlServer,
            "SELECT id, name FROM Products ORDER BY price DESC TOP 5",
            &schema,
        );
        assert_eq!(
            sql,
            "SELECT TOP 5 id, name FROM Products ORDER BY price DESC"
        );
    }

    #[test]
    fn test_sqlserver_fetch_first_becomes_top() {
        let schema = schema_with(&[("Orders", &["id"])]);
        let sql = repair(
            DatabaseKind::SqlServer,
            "SELECT id FROM Orders FETCH FIRST 7 ROWS ONLY",
            &schema,
        );
        assert_eq!(sql, "SELECT TOP 7 id FROM Orders");
    }

    #[test]
    fn test_sqlserver_backticks_become_brackets() {
        let schema = schema_with(&[("Orders", &["id"])]);
        let sql = repair(DatabaseKind::SqlServer, "SELECT `id` FROM `Orders`", &schema);
        assert_eq!(sql, "SELECT [id] FROM [Orders]");
    }

    #[test]
    fn test_sqlserver_group_by_ordinals_resolved() {
        let schema = schema_with(&[("Sales", &["region", "amount"])]);
        let sql = repair(
            DatabaseKind::SqlServer,
            "SELECT region, SUM(amount) AS total FROM Sales GROUP BY 1",
            &schema,
        );
        assert_eq!(
            sql,
            "SELECT region, SUM(amount) AS total FROM Sales GROUP BY region"
        );
    }

    #[test]
    fn test_sqlserver_dotted_alias_unaliased() {
        let schema = schema_with(&[("Sales", &["region"])]);
        let sql = repair(
            DatabaseKind::SqlServer,
            "SELECT region AS s.region_name FROM Sales",
            &schema,
        );
        assert_eq!(sql, "SELECT region AS region_name FROM Sales");
    }

    #[test]
    fn test_sqlserver_hallucinated_function_dropped() {
        let schema = schema_with(&[("Orders", &["OrderDate", "Total"])]);
        let sql = repair(
            DatabaseKind::SqlServer,
            "SELECT MAGICDATE(OrderDate) FROM Orders WHERE YEAR(OrderDate) = 2024",
            &schema,
        );
        assert_eq!(
            sql,
            "SELECT OrderDate FROM Orders WHERE YEAR(OrderDate) = 2024"
        );
    }

    #[test]
    fn test_postgres_quotes_uppercase_identifiers() {
        let mut schema = schema_with(&[("Customers", &["Id", "name"])]);
        schema.kind = DatabaseKind::PostgreSql;
        let sql = repair(
            DatabaseKind::PostgreSql,
            "SELECT Id, name FROM Customers",
            &schema,
        );
        assert_eq!(sql, "SELECT \"Id\", name FROM \"Customers\"");
    }

    #[test]
    fn test_postgres_schema_qualified_tables() {
        let mut schema = schema_with(&[("customers", &["id"])]);
        schema.kind = DatabaseKind::PostgreSql;
        let sql = repair(
            DatabaseKind::PostgreSql,
            "SELECT id FROM public.customers",
            &schema,
        );
        assert_eq!(sql, "SELECT id FROM \"public\".\"customers\"");
    }

    #[test]
    fn test_postgres_unquotes_aliases_and_collapses_doubles() {
        let mut schema = schema_with(&[("customers", &["id"])]);
        schema.kind = DatabaseKind::PostgreSql;
        let sql = repair(
            DatabaseKind::PostgreSql,
            "SELECT id AS \"customer_id\" FROM \"\"customers\"\"",
            &schema,
        );
        assert_eq!(sql, "SELECT id AS customer_id FROM \"customers\"");
    }

    #[test]
    fn test_mysql_derived_table_gets_alias() {
        let sql = repair_mysql("SELECT * FROM (SELECT id FROM users) WHERE id > 1");
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT id FROM users) AS _dt WHERE id > 1"
        );
        // Already aliased stays untouched.
        let sql = repair_mysql("SELECT * FROM (SELECT id FROM users) u");
        assert_eq!(sql, "SELECT * FROM (SELECT id FROM users) u");
    }

    #[test]
    fn test_sqlite_repair_is_minimal() {
        let schema = schema_with(&[("users", &["id"])]);
        let sql = repair(DatabaseKind::Sqlite, "SELECT id FROM users;", &schema);
        assert_eq!(sql, "SELECT id FROM users");
    }
}
