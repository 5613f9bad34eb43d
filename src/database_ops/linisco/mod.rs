pub mod provider;

pub use provider::{
    AuthSession, Fetched, LiniscoProvider, PosSource, RemoteOrder, RemoteProduct, RemoteSession,
    RemoteUser,
};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::database_ops::upsert::{
    insert_sync_log, upsert_order, upsert_product, upsert_session, upsert_store, upsert_user,
    SyncLogEntry,
};
use crate::stores::{StoreConfig, StoreRegistry};
use crate::util::db::Db;
use crate::util::env as env_util;
use crate::window::DateWindow;

pub const DEFAULT_STORE_PAUSE_MS: u64 = 2000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    InProgress,
    #[error("store {0} is not configured")]
    UnknownStore(String),
}

/// Result of syncing one store. `error` is set when the store failed; rows
/// written before the failure stay in place.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreOutcome {
    pub store_id: String,
    pub store_name: String,
    pub success: bool,
    pub records: u64,
    pub sessions: u64,
    pub orders: u64,
    pub products: u64,
    pub skipped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreFailure {
    pub store_id: String,
    pub store_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub status: SyncStatus,
    pub window: DateWindow,
    pub total_records: u64,
    pub results: Vec<StoreOutcome>,
    pub errors: Vec<StoreFailure>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Completed,
    Partial,
    Failed,
}

impl SyncStatus {
    fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => SyncStatus::Completed,
            (0, _) => SyncStatus::Failed,
            _ => SyncStatus::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Completed => "completed",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Pulls sessions, orders and products for every configured store into the
/// local tables. Stores run one after another; a failing store is recorded
/// and the loop moves on.
pub struct SyncService<S: PosSource> {
    db: Db,
    source: S,
    stores: StoreRegistry,
    pause: Duration,
    run_lock: Mutex<()>,
}

impl<S: PosSource> SyncService<S> {
    /// Pause between stores comes from `SYNC_STORE_PAUSE_MS`.
    pub fn new(db: Db, source: S, stores: StoreRegistry) -> Self {
        let pause_ms = env_util::env_parse("SYNC_STORE_PAUSE_MS", DEFAULT_STORE_PAUSE_MS);
        Self {
            db,
            source,
            stores,
            pause: Duration::from_millis(pause_ms),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    #[cfg(test)]
    pub(crate) async fn hold_run_lock_for_test(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.run_lock.lock().await
    }

    /// Write every configured store into `stores`.
    pub async fn initialize_stores(&self) -> anyhow::Result<usize> {
        for store in self.stores.stores() {
            upsert_store(&self.db, store).await?;
        }
        info!(count = self.stores.len(), "stores initialized");
        Ok(self.stores.len())
    }

    /// Sync every store, waiting for any run already in progress.
    pub async fn sync_all_stores(&self, window: &DateWindow) -> SyncReport {
        let _guard = self.run_lock.lock().await;
        self.run_all(window).await
    }

    /// Like `sync_all_stores` but refuses to queue behind a running sync.
    pub async fn try_sync_all_stores(&self, window: &DateWindow) -> Result<SyncReport, SyncError> {
        let _guard = self.run_lock.try_lock().map_err(|_| SyncError::InProgress)?;
        Ok(self.run_all(window).await)
    }

    /// Sync a single configured store. Also refuses to run alongside another sync.
    pub async fn sync_store_by_id(
        &self,
        store_id: &str,
        window: &DateWindow,
    ) -> Result<StoreOutcome, SyncError> {
        let store = self
            .stores
            .get(store_id)
            .ok_or_else(|| SyncError::UnknownStore(store_id.trim().to_string()))?;
        let _guard = self.run_lock.try_lock().map_err(|_| SyncError::InProgress)?;
        let started_at = chrono::Utc::now().to_rfc3339();
        let outcome = self.sync_store(store, window).await;
        let status = SyncStatus::from_counts(
            usize::from(outcome.success),
            usize::from(!outcome.success),
        );
        self.record_log(
            "single_store_sync",
            window,
            status,
            outcome.records,
            u64::from(!outcome.success),
            started_at,
        )
        .await;
        Ok(outcome)
    }

    #[instrument(skip(self, window), fields(stores = self.stores.len(), window = %window))]
    async fn run_all(&self, window: &DateWindow) -> SyncReport {
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();
        info!("multi-store sync starting");

        let mut results = Vec::new();
        let mut errors = Vec::new();
        let stores = self.stores.stores();
        for (idx, store) in stores.iter().enumerate() {
            let outcome = self.sync_store(store, window).await;
            if let Some(err) = outcome.error.clone() {
                errors.push(StoreFailure {
                    store_id: outcome.store_id,
                    store_name: outcome.store_name,
                    error: err,
                });
            } else {
                results.push(outcome);
            }
            if idx + 1 < stores.len() && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        let total_records: u64 = results.iter().map(|r| r.records).sum();
        let status = SyncStatus::from_counts(results.len(), errors.len());
        self.record_log(
            "multi_store_sync",
            window,
            status,
            total_records,
            errors.len() as u64,
            started_at,
        )
        .await;

        let report = SyncReport {
            success: errors.is_empty(),
            status,
            window: *window,
            total_records,
            results,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            status = status.as_str(),
            total_records,
            succeeded = report.results.len(),
            failed = report.errors.len(),
            duration_ms = report.duration_ms,
            "multi-store sync finished"
        );
        report
    }

    /// Sync one store. Never returns an error: failures land in the outcome.
    #[instrument(
        skip(self, store, window),
        fields(store_id = %store.store_id, store = %store.store_name, window = %window)
    )]
    pub async fn sync_store(&self, store: &StoreConfig, window: &DateWindow) -> StoreOutcome {
        let started = Instant::now();
        let mut outcome = StoreOutcome {
            store_id: store.store_id.clone(),
            store_name: store.store_name.clone(),
            ..Default::default()
        };
        if let Err(e) = self.sync_store_inner(store, window, &mut outcome).await {
            error!(error = %e, records = outcome.records, "store sync failed");
            outcome.error = Some(format!("{e:#}"));
        } else {
            outcome.success = true;
            info!(
                sessions = outcome.sessions,
                orders = outcome.orders,
                products = outcome.products,
                skipped = outcome.skipped,
                "store synced"
            );
        }
        outcome.records = outcome.sessions + outcome.orders + outcome.products;
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome
    }

    async fn sync_store_inner(
        &self,
        store: &StoreConfig,
        window: &DateWindow,
        outcome: &mut StoreOutcome,
    ) -> anyhow::Result<()> {
        let store_id = store.store_id.trim();
        upsert_store(&self.db, store).await?;

        let auth = self.source.sign_in(store).await?;
        debug!(user_id = auth.user.id, "authenticated");
        if let Err(e) = upsert_user(&self.db, store_id, &auth.user).await {
            warn!(error = %e, "could not store upstream user");
        }

        let sessions = self.source.sessions(&auth, window).await?;
        outcome.skipped += sessions.malformed as u64;
        for s in &sessions.records {
            match upsert_session(&self.db, store_id, s).await {
                Ok(()) => outcome.sessions += 1,
                Err(e) => {
                    outcome.skipped += 1;
                    warn!(session = s.id_session, error = %e, "skipping session");
                }
            }
        }

        let orders = self.source.sale_orders(&auth, window).await?;
        outcome.skipped += orders.malformed as u64;
        for o in &orders.records {
            match upsert_order(&self.db, store_id, o).await {
                Ok(()) => outcome.orders += 1,
                Err(e) => {
                    outcome.skipped += 1;
                    warn!(order = o.id, error = %e, "skipping order");
                }
            }
        }

        let products = self.source.sale_products(&auth, window).await?;
        outcome.skipped += products.malformed as u64;
        for p in &products.records {
            match upsert_product(&self.db, store_id, p).await {
                Ok(()) => outcome.products += 1,
                Err(e) => {
                    outcome.skipped += 1;
                    warn!(product = p.id_sale_product, error = %e, "skipping product");
                }
            }
        }
        Ok(())
    }

    async fn record_log(
        &self,
        sync_type: &str,
        window: &DateWindow,
        status: SyncStatus,
        records: u64,
        errors: u64,
        started_at: String,
    ) {
        let entry = SyncLogEntry {
            sync_type,
            window: *window,
            status: status.as_str(),
            records_synced: records as i64,
            error_count: errors as i64,
            started_at,
        };
        if let Err(e) = insert_sync_log(&self.db, &entry).await {
            warn!(error = %e, "failed to write sync_log");
        }
    }
}

/// Background loop syncing `[today - lookback_days, today]` every `every`.
/// The first run happens one interval after start.
pub fn spawn_periodic_sync<S>(
    service: Arc<SyncService<S>>,
    every: Duration,
    lookback_days: u32,
) -> JoinHandle<()>
where
    S: PosSource + 'static,
{
    info!(
        every_secs = every.as_secs(),
        lookback_days, "periodic sync enabled"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let window = DateWindow::lookback(lookback_days);
            match service.try_sync_all_stores(&window).await {
                Ok(report) => info!(
                    status = report.status.as_str(),
                    total_records = report.total_records,
                    "periodic sync done"
                ),
                Err(SyncError::InProgress) => {
                    debug!("periodic sync skipped; another run is active")
                }
                Err(e) => warn!(error = %e, "periodic sync failed"),
            }
        }
    })
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use crate::database_ops::upsert::recent_sync_log;
    use crate::util::db::test_support::sqlite_db;
    use sqlx::Row;

    fn window() -> DateWindow {
        DateWindow::parse("2024-03-01", "2024-03-02").unwrap()
    }

    fn two_store_source() -> (FakeSource, StoreRegistry) {
        let centro = store("20003", "Centro");
        let norte = store("20004", "Norte");
        let mut src = FakeSource::default();
        src.sessions
            .insert(centro.email.clone(), vec![session(1, "2024-03-01")]);
        src.orders.insert(
            centro.email.clone(),
            vec![
                order(1, "2024-03-01", "cash", 100.0, 0.0),
                order(2, "2024-03-01", "cc_visa", 50.0, 5.0),
            ],
        );
        src.products.insert(
            centro.email.clone(),
            vec![
                product(1, 1, "Burger", 2.0, 50.0),
                product(2, 2, "Fries", 1.0, 50.0),
            ],
        );
        src.orders.insert(
            norte.email.clone(),
            vec![order(1, "2024-03-02", "cash", 80.0, 0.0)],
        );
        let registry = StoreRegistry::new(vec![centro, norte]).unwrap();
        (src, registry)
    }

    async fn count_rows(db: &Db, table: &str) -> i64 {
        sqlx::query(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get::<i64, _>(0)
    }

    #[tokio::test]
    async fn total_records_is_sum_of_store_counts() {
        let (db, _dir) = sqlite_db().await;
        let (src, registry) = two_store_source();
        let svc = SyncService::new(db.clone(), src, registry).with_pause(Duration::ZERO);

        let report = svc.sync_all_stores(&window()).await;
        assert!(report.success);
        assert_eq!(report.status, SyncStatus::Completed);
        assert_eq!(report.results.len(), 2);
        let per_store: u64 = report.results.iter().map(|r| r.records).sum();
        assert_eq!(report.total_records, per_store);
        assert_eq!(report.total_records, 6);
        assert_eq!(report.results[0].sessions, 1);
        assert_eq!(report.results[0].orders, 2);
        assert_eq!(report.results[0].products, 2);

        let stored = count_rows(&db, "sessions").await
            + count_rows(&db, "sale_orders").await
            + count_rows(&db, "sale_products").await;
        assert_eq!(stored as u64, report.total_records);
        assert_eq!(count_rows(&db, "users").await, 2);
    }

    #[tokio::test]
    async fn auth_failure_is_isolated_to_its_store() {
        let (db, _dir) = sqlite_db().await;
        let (mut src, registry) = two_store_source();
        src.rejected.insert("centro@example.com".into());
        let svc = SyncService::new(db.clone(), src, registry).with_pause(Duration::ZERO);

        let report = svc.sync_all_stores(&window()).await;
        assert!(!report.success);
        assert_eq!(report.status, SyncStatus::Partial);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].store_name, "Centro");
        assert!(report.errors[0].error.contains("401"));
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].store_id, "20004");
        assert_eq!(report.total_records, 1);

        let status: String = sqlx::query("SELECT status FROM sync_log ORDER BY id DESC LIMIT 1")
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(status, "partial");
    }

    #[tokio::test]
    async fn resync_does_not_duplicate_rows() {
        let (db, _dir) = sqlite_db().await;
        let (src, registry) = two_store_source();
        let svc = SyncService::new(db.clone(), src, registry).with_pause(Duration::ZERO);

        svc.sync_all_stores(&window()).await;
        let second = svc.sync_all_stores(&window()).await;
        assert!(second.success);

        let n: i64 = sqlx::query(
            "SELECT COUNT(*) FROM sale_orders WHERE store_id = $1 AND linisco_id = $2",
        )
        .bind("20003")
        .bind(1_i64)
        .fetch_one(&db.pool)
        .await
        .unwrap()
        .get(0);
        assert_eq!(n, 1);
        assert_eq!(count_rows(&db, "sale_orders").await, 3);
        assert_eq!(count_rows(&db, "sale_products").await, 2);
        assert_eq!(count_rows(&db, "sync_log").await, 2);
    }

    #[tokio::test]
    async fn empty_upstream_is_a_zero_record_success() {
        let (db, _dir) = sqlite_db().await;
        let registry = StoreRegistry::new(vec![store("20005", "Sur")]).unwrap();
        let svc =
            SyncService::new(db, FakeSource::default(), registry).with_pause(Duration::ZERO);

        let report = svc.sync_all_stores(&window()).await;
        assert!(report.success);
        assert!(report.errors.is_empty());
        assert_eq!(report.total_records, 0);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].records, 0);
        assert!(report.results[0].error.is_none());
    }

    #[tokio::test]
    async fn mid_store_failure_keeps_rows_already_written() {
        let (db, _dir) = sqlite_db().await;
        let (mut src, registry) = two_store_source();
        src.failing_products.insert("centro@example.com".into());
        let svc = SyncService::new(db.clone(), src, registry).with_pause(Duration::ZERO);

        let report = svc.sync_all_stores(&window()).await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].error.contains("502"));
        // Centro's sessions and orders landed before the products call failed.
        assert_eq!(count_rows(&db, "sessions").await, 1);
        assert_eq!(count_rows(&db, "sale_orders").await, 3);
        assert_eq!(count_rows(&db, "sale_products").await, 0);
    }

    #[tokio::test]
    async fn single_store_sync_and_unknown_id() {
        let (db, _dir) = sqlite_db().await;
        let (src, registry) = two_store_source();
        let svc = SyncService::new(db.clone(), src, registry).with_pause(Duration::ZERO);

        let outcome = svc.sync_store_by_id("20004", &window()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.orders, 1);
        assert!(matches!(
            svc.sync_store_by_id("99999", &window()).await,
            Err(SyncError::UnknownStore(id)) if id == "99999"
        ));
        let kind: String = sqlx::query("SELECT sync_type FROM sync_log")
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(kind, "single_store_sync");
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected_while_running() {
        let (db, _dir) = sqlite_db().await;
        let (src, registry) = two_store_source();
        let svc = SyncService::new(db, src, registry).with_pause(Duration::ZERO);

        let guard = svc.run_lock.lock().await;
        assert!(svc.is_running());
        assert!(matches!(
            svc.try_sync_all_stores(&window()).await,
            Err(SyncError::InProgress)
        ));
        drop(guard);
        assert!(svc.try_sync_all_stores(&window()).await.is_ok());
    }

    // Wall-clock timing: sqlx's pool timeouts misbehave under a paused clock.
    #[tokio::test]
    async fn pause_falls_between_stores_only() {
        let (db, _dir) = sqlite_db().await;
        let pause = Duration::from_millis(400);

        let (src, registry) = two_store_source();
        let svc = SyncService::new(db.clone(), src, registry).with_pause(pause);
        let started = Instant::now();
        assert!(svc.sync_all_stores(&window()).await.success);
        let elapsed = started.elapsed();
        assert!(elapsed >= pause, "{elapsed:?}");
        assert!(elapsed < pause * 2, "pause also ran after the last store: {elapsed:?}");

        let registry = StoreRegistry::new(vec![store("20005", "Sur")]).unwrap();
        let svc = SyncService::new(db, FakeSource::default(), registry).with_pause(pause);
        let started = Instant::now();
        svc.sync_all_stores(&window()).await;
        assert!(started.elapsed() < pause, "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn periodic_sync_skips_busy_ticks_and_syncs_the_lookback() {
        let (db, _dir) = sqlite_db().await;
        let (src, registry) = two_store_source();
        let svc = Arc::new(SyncService::new(db.clone(), src, registry).with_pause(Duration::ZERO));
        let every = Duration::from_millis(400);

        let guard = svc.run_lock.lock().await;
        let handle = spawn_periodic_sync(svc.clone(), every, 3);
        // The tick at 400ms finds a run in progress and is skipped.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(count_rows(&db, "sync_log").await, 0);
        drop(guard);
        // The tick at 800ms runs; stop before the one at 1200ms.
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.abort();

        let rows = recent_sync_log(&db, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sync_type, "multi_store_sync");
        let expected = DateWindow::lookback(3);
        assert_eq!(rows[0].start_date, expected.from_day());
        assert_eq!(rows[0].end_date, expected.to_day());
    }

    #[tokio::test]
    async fn initialize_stores_writes_registry() {
        let (db, _dir) = sqlite_db().await;
        let (src, registry) = two_store_source();
        let svc = SyncService::new(db.clone(), src, registry);
        assert_eq!(svc.initialize_stores().await.unwrap(), 2);
        assert_eq!(count_rows(&db, "stores").await, 2);
    }
}
