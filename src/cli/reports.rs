use anyhow::Result;
use itertools::Itertools;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::database_ops::export::{self, ExportKind};
use crate::database_ops::reports::{self, ReportFilter};
use crate::stores::StoreRegistry;
use crate::util::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportKind {
    Stats,
    SalesSummary,
    TopProducts,
    DailySales,
    PaymentMethods,
    Sessions,
    SalesPatterns,
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub kind: ReportKind,
    pub filter: ReportFilter,
    pub limit: Option<i64>,
    pub json: bool,
}

pub async fn run_query(db: &Db, cfg: QueryConfig) -> Result<()> {
    let f = &cfg.filter;
    let value = match cfg.kind {
        ReportKind::Stats => to_value(reports::stats(db, f).await?)?,
        ReportKind::SalesSummary => to_value(reports::sales_summary(db, f).await?)?,
        ReportKind::TopProducts => to_value(reports::top_products(db, f, cfg.limit).await?)?,
        ReportKind::DailySales => to_value(reports::daily_sales(db, f).await?)?,
        ReportKind::PaymentMethods => to_value(reports::payment_methods(db, f).await?)?,
        ReportKind::Sessions => to_value(reports::session_summary(db, f).await?)?,
        ReportKind::SalesPatterns => to_value(reports::sales_patterns(db, f).await?)?,
    };
    emit(cfg.json, &value)
}

/// Configured stores, without credentials. Needs no database.
pub fn list_stores(json: bool) -> Result<()> {
    let registry = StoreRegistry::load()?;
    emit(json, &to_value(registry.summaries())?)
}

pub async fn stores_summary(db: &Db, filter: &ReportFilter, json: bool) -> Result<()> {
    emit(json, &to_value(reports::stores_summary(db, filter).await?)?)
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub kind: ExportKind,
    pub filter: ReportFilter,
    pub dir: Option<PathBuf>,
    pub file: Option<String>,
}

pub async fn run_export(db: &Db, cfg: ExportConfig) -> Result<()> {
    let Some(window) = cfg.filter.window else {
        anyhow::bail!("export needs a date range");
    };
    let dir = cfg.dir.unwrap_or_else(export::export_dir);
    let summary = export::export_csv(
        db,
        cfg.kind,
        &window,
        &cfg.filter.store_ids,
        &dir,
        cfg.file.as_deref(),
    )
    .await?;
    match &summary.path {
        Some(path) => println!("{} {} rows -> {}", summary.rows, summary.kind, path.display()),
        None => println!("no {} in {window}; nothing written", summary.kind),
    }
    Ok(())
}

fn to_value<T: Serialize>(v: T) -> Result<Value> {
    Ok(serde_json::to_value(v)?)
}

fn emit(json: bool, value: &Value) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", render(value));
    }
    Ok(())
}

/// Plain-text rendering: arrays of objects become aligned tables, objects
/// become `key: value` lines with nested tables under their key.
pub fn render(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Array(rows) => out.push_str(&table(rows)),
        Value::Object(map) => {
            for (k, v) in map {
                match v {
                    Value::Array(rows) => {
                        let _ = writeln!(out, "{k}:");
                        out.push_str(&table(rows));
                    }
                    other => {
                        let _ = writeln!(out, "{k}: {}", scalar(other));
                    }
                }
            }
        }
        other => {
            let _ = writeln!(out, "{}", scalar(other));
        }
    }
    out
}

fn scalar(v: &Value) -> String {
    match v {
        Value::Null => "-".into(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{f:.2}"),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn table(rows: &[Value]) -> String {
    if rows.is_empty() {
        return "(no rows)\n".into();
    }
    let headers: Vec<&str> = rows
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|m| m.keys().map(String::as_str))
        .unique()
        .collect();
    if headers.is_empty() {
        return rows.iter().map(|v| format!("{}\n", scalar(v))).collect();
    }
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|r| headers.iter().map(|h| scalar(r.get(*h).unwrap_or(&Value::Null))).collect())
        .collect();
    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            cells
                .iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(h.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();
    let line = |vals: Vec<&str>| -> String {
        vals.iter()
            .zip(&widths)
            .map(|(v, &w)| format!("{v:<w$}"))
            .join("  ")
            .trim_end()
            .to_string()
    };
    let mut out = String::new();
    let _ = writeln!(out, "{}", line(headers.clone()));
    for row in &cells {
        let _ = writeln!(out, "{}", line(row.iter().map(String::as_str).collect()));
    }
    out
}
