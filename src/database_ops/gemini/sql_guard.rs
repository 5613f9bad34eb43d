//! Turns model-written SQL into something safe to run: a single `SELECT`,
//! bounded, and pinned to the caller's window and store.
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::window::DateWindow;

pub const DEFAULT_ROW_LIMIT: u32 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlGuardError {
    #[error("the model returned no SQL")]
    Empty,
    #[error("only a single SELECT statement is allowed")]
    NotSelect,
    #[error("forbidden SQL: {0}")]
    Forbidden(String),
    #[error("store id must be alphanumeric: {0}")]
    InvalidStore(String),
}

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

fn fence_open() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    re(&R, r"(?i)^```[a-z]*\s*")
}

fn select_start() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    re(&R, r"(?i)^select\s")
}

fn forbidden() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    re(
        &R,
        r"(?i)\b(insert|update|delete|drop|alter|attach|detach|pragma|vacuum|create|truncate|grant|revoke|copy)\b|;|--|/\*",
    )
}

fn has_limit() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    re(&R, r"(?i)\blimit\s+\d+")
}

fn has_date_filter() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    re(
        &R,
        r"(?i)(date\(\s*so\.order_date\s*\)|substr\(\s*so\.order_date\s*,\s*1\s*,\s*10\s*\))\s*between",
    )
}

fn has_store_filter() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    re(&R, r#"(?i)so\.store_id\s*=\s*['"][^'"]+['"]"#)
}

fn where_kw() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    re(&R, r"(?i)\bwhere\b")
}

fn tail_kw() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    re(&R, r"(?i)\b(group\s+by|having|order\s+by|limit)\b")
}

/// Strip markdown fences and a trailing semicolon.
pub fn strip_fences(raw: &str) -> String {
    let mut sql = raw.trim().to_string();
    sql = fence_open().replace(&sql, "").into_owned();
    if let Some(stripped) = sql.trim_end().strip_suffix("```") {
        sql = stripped.to_string();
    }
    let sql = sql.trim();
    sql.strip_suffix(';').unwrap_or(sql).trim().to_string()
}

/// Validate and rewrite model output. Filters already present are left alone;
/// missing ones are added to the first `WHERE` (or a new one).
pub fn guard_sql(
    raw: &str,
    window: &DateWindow,
    store_id: Option<&str>,
) -> Result<String, SqlGuardError> {
    let mut sql = strip_fences(raw);
    if sql.is_empty() {
        return Err(SqlGuardError::Empty);
    }
    if !select_start().is_match(&sql) {
        return Err(SqlGuardError::NotSelect);
    }
    if let Some(m) = forbidden().find(&sql) {
        return Err(SqlGuardError::Forbidden(m.as_str().to_string()));
    }

    if !has_date_filter().is_match(&sql) {
        let clause = format!(
            "substr(so.order_date, 1, 10) BETWEEN '{}' AND '{}'",
            window.from_day(),
            window.to_day()
        );
        sql = ensure_where(&sql, &clause);
    }
    if let Some(store) = store_id.map(str::trim).filter(|s| !s.is_empty()) {
        if !store.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SqlGuardError::InvalidStore(store.to_string()));
        }
        if !has_store_filter().is_match(&sql) {
            sql = ensure_where(&sql, &format!("so.store_id = '{store}'"));
        }
    }
    if !has_limit().is_match(&sql) {
        sql.push_str(&format!(" LIMIT {DEFAULT_ROW_LIMIT}"));
    }
    Ok(sql)
}

fn ensure_where(sql: &str, clause: &str) -> String {
    if let Some(m) = where_kw().find(sql) {
        return format!("{} {clause} AND {}", &sql[..m.end()], sql[m.end()..].trim_start());
    }
    match tail_kw().find(sql) {
        Some(m) => format!(
            "{} WHERE {clause} {}",
            sql[..m.start()].trim_end(),
            &sql[m.start()..]
        ),
        None => format!("{} WHERE {clause}", sql.trim_end()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w() -> DateWindow {
        DateWindow::parse("2024-03-01", "2024-03-07").unwrap()
    }

    #[test]
    fn strips_fences_and_trailing_semicolon() {
        assert_eq!(
            strip_fences("```sql\nSELECT 1 FROM stores s;\n```"),
            "SELECT 1 FROM stores s"
        );
        assert_eq!(strip_fences("  select 2  "), "select 2");
    }

    #[test]
    fn injects_window_store_and_limit() {
        let sql = guard_sql(
            "SELECT so.payment_method, SUM(so.total) AS t FROM sale_orders so GROUP BY so.payment_method ORDER BY t DESC",
            &w(),
            Some("20003"),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT so.payment_method, SUM(so.total) AS t FROM sale_orders so WHERE so.store_id = '20003' AND substr(so.order_date, 1, 10) BETWEEN '2024-03-01' AND '2024-03-07' GROUP BY so.payment_method ORDER BY t DESC LIMIT 100"
        );
    }

    #[test]
    fn keeps_existing_filters_and_limit() {
        let raw = "SELECT * FROM sale_orders so WHERE DATE(so.order_date) BETWEEN '2024-03-01' AND '2024-03-02' AND so.store_id = '1' LIMIT 5";
        assert_eq!(guard_sql(raw, &w(), Some("1")).unwrap(), raw);
    }

    #[test]
    fn extends_existing_where() {
        let sql = guard_sql(
            "SELECT COUNT(*) FROM sale_orders so WHERE so.total > 10",
            &w(),
            None,
        )
        .unwrap();
        assert!(sql.starts_with(
            "SELECT COUNT(*) FROM sale_orders so WHERE substr(so.order_date, 1, 10) BETWEEN '2024-03-01' AND '2024-03-07' AND so.total > 10"
        ));
        assert!(sql.ends_with("LIMIT 100"));
    }

    #[test]
    fn rejects_non_select_and_writes() {
        assert_eq!(guard_sql("", &w(), None), Err(SqlGuardError::Empty));
        assert_eq!(
            guard_sql("WITH x AS (SELECT 1) SELECT * FROM x", &w(), None),
            Err(SqlGuardError::NotSelect)
        );
        assert_eq!(
            guard_sql("DELETE FROM sale_orders", &w(), None),
            Err(SqlGuardError::NotSelect)
        );
        assert!(matches!(
            guard_sql("SELECT 1; DROP TABLE stores", &w(), None),
            Err(SqlGuardError::Forbidden(_))
        ));
        assert!(matches!(
            guard_sql("SELECT * FROM stores -- comment", &w(), None),
            Err(SqlGuardError::Forbidden(_))
        ));
        assert!(matches!(
            guard_sql("SELECT * FROM sale_orders so", &w(), Some("1' OR '1'='1")),
            Err(SqlGuardError::InvalidStore(_))
        ));
    }

    #[test]
    fn column_names_containing_keywords_are_fine() {
        let sql = guard_sql("SELECT s.updated_at FROM stores s", &w(), None).unwrap();
        assert!(sql.contains("updated_at"));
    }
}
