use anyhow::{bail, Result};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::warn;

use crate::database_ops::linisco::{
    LiniscoProvider, PosSource, StoreOutcome, SyncReport, SyncService, SyncStatus,
};
use crate::stores::StoreRegistry;
use crate::util::db::Db;
use crate::window::DateWindow;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub window: DateWindow,
    /// Sync only this store.
    pub store_id: Option<String>,
    pub json: bool,
}

pub async fn run(db: Db, cfg: SyncConfig) -> Result<()> {
    let stores = StoreRegistry::load()?;
    let source: Arc<dyn PosSource> = Arc::new(LiniscoProvider::from_env()?);
    let service = SyncService::new(db, source, stores);
    service.initialize_stores().await?;

    match cfg.store_id.as_deref() {
        Some(id) => {
            let outcome = service.sync_store_by_id(id, &cfg.window).await?;
            print(cfg.json, &outcome, || render_outcome(&outcome))?;
            if let Some(err) = &outcome.error {
                bail!("store {} failed: {err}", outcome.store_id);
            }
        }
        None => {
            let report = service.sync_all_stores(&cfg.window).await;
            print(cfg.json, &report, || render_report(&report))?;
            match report.status {
                SyncStatus::Completed => {}
                SyncStatus::Partial => warn!(
                    failed = report.errors.len(),
                    "sync finished with failing stores"
                ),
                SyncStatus::Failed => bail!("every store failed to sync"),
            }
        }
    }
    Ok(())
}

fn print<T: serde::Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", text());
    }
    Ok(())
}

pub fn render_outcome(o: &StoreOutcome) -> String {
    match &o.error {
        None => format!(
            "OK   {} ({}): {} records [sessions {}, orders {}, products {}, skipped {}] {}ms\n",
            o.store_name, o.store_id, o.records, o.sessions, o.orders, o.products, o.skipped, o.duration_ms
        ),
        Some(err) => format!("FAIL {} ({}): {err}\n", o.store_name, o.store_id),
    }
}

pub fn render_report(r: &SyncReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Sync {} {}: {} records, {} ok, {} failed, {}ms",
        r.window,
        r.status.as_str(),
        r.total_records,
        r.results.len(),
        r.errors.len(),
        r.duration_ms
    );
    for o in &r.results {
        out.push_str(&render_outcome(o));
    }
    for e in &r.errors {
        let _ = writeln!(out, "FAIL {} ({}): {}", e.store_name, e.store_id, e.error);
    }
    out
}
