//! Idempotent writes keyed on (store_id, upstream id).
//!
//! Every statement is `INSERT .. ON CONFLICT .. DO UPDATE`, which SQLite and
//! PostgreSQL both accept verbatim, so re-syncing a window rewrites rows in
//! place instead of duplicating them.
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::Row;

use crate::database_ops::linisco::{RemoteOrder, RemoteProduct, RemoteSession, RemoteUser};
use crate::stores::StoreConfig;
use crate::util::db::Db;
use crate::window::DateWindow;

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub async fn upsert_store(db: &Db, store: &StoreConfig) -> Result<()> {
    sqlx::query(
        "INSERT INTO stores (store_id, store_name, email, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $4)
         ON CONFLICT (store_id) DO UPDATE SET
            store_name = excluded.store_name,
            email = excluded.email,
            updated_at = excluded.updated_at",
    )
    .bind(store.store_id.trim())
    .bind(store.store_name.trim())
    .bind(store.email.trim())
    .bind(now_iso())
    .execute(&db.pool)
    .await
    .with_context(|| format!("upsert store {}", store.store_id))?;
    Ok(())
}

pub async fn upsert_user(db: &Db, store_id: &str, user: &RemoteUser) -> Result<()> {
    sqlx::query(
        "INSERT INTO users (
            linisco_id, store_id, email, authentication_token, roles_mask, brand_id,
            created_at, updated_at, synced_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (store_id, linisco_id) DO UPDATE SET
            email = excluded.email,
            authentication_token = excluded.authentication_token,
            roles_mask = excluded.roles_mask,
            brand_id = excluded.brand_id,
            updated_at = excluded.updated_at,
            synced_at = excluded.synced_at",
    )
    .bind(user.id)
    .bind(store_id)
    .bind(user.email.as_str())
    .bind(user.authentication_token.as_str())
    .bind(user.roles_mask)
    .bind(user.brand_id)
    .bind(user.created_at.as_deref())
    .bind(user.updated_at.as_deref())
    .bind(now_iso())
    .execute(&db.pool)
    .await
    .with_context(|| format!("upsert user {} for store {store_id}", user.id))?;
    Ok(())
}

pub async fn upsert_session(db: &Db, store_id: &str, s: &RemoteSession) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (
            linisco_id, store_id, shop_number, user_id, username, checkin, checkout,
            initial_cash, cash, cd_visa, cd_maestro, cd_cabal, cc_visa, cc_maestro,
            cc_amex, cc_cabal, cc_naranja, cc_diners, cc_nativa, cc_argencard,
            cc_mcdebit, in_total, total_invoiced, real_invoiced, synced_at
         ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
            $17, $18, $19, $20, $21, $22, $23, $24, $25
         )
         ON CONFLICT (store_id, linisco_id) DO UPDATE SET
            shop_number = excluded.shop_number,
            user_id = excluded.user_id,
            username = excluded.username,
            checkin = excluded.checkin,
            checkout = excluded.checkout,
            initial_cash = excluded.initial_cash,
            cash = excluded.cash,
            cd_visa = excluded.cd_visa,
            cd_maestro = excluded.cd_maestro,
            cd_cabal = excluded.cd_cabal,
            cc_visa = excluded.cc_visa,
            cc_maestro = excluded.cc_maestro,
            cc_amex = excluded.cc_amex,
            cc_cabal = excluded.cc_cabal,
            cc_naranja = excluded.cc_naranja,
            cc_diners = excluded.cc_diners,
            cc_nativa = excluded.cc_nativa,
            cc_argencard = excluded.cc_argencard,
            cc_mcdebit = excluded.cc_mcdebit,
            in_total = excluded.in_total,
            total_invoiced = excluded.total_invoiced,
            real_invoiced = excluded.real_invoiced,
            synced_at = excluded.synced_at",
    )
    .bind(s.id_session)
    .bind(store_id)
    .bind(s.shop_number.as_deref())
    .bind(s.id_user)
    .bind(s.username.as_deref())
    .bind(s.checkin.as_deref())
    .bind(s.checkout.as_deref())
    .bind(s.initial_cash)
    .bind(s.cash)
    .bind(s.cd_visa)
    .bind(s.cd_maestro)
    .bind(s.cd_cabal)
    .bind(s.cc_visa)
    .bind(s.cc_maestro)
    .bind(s.cc_amex)
    .bind(s.cc_cabal)
    .bind(s.cc_naranja)
    .bind(s.cc_diners)
    .bind(s.cc_nativa)
    .bind(s.cc_argencard)
    .bind(s.cc_mcdebit)
    .bind(s.in_total)
    .bind(s.total_invoiced)
    .bind(s.real_invoiced)
    .bind(now_iso())
    .execute(&db.pool)
    .await
    .with_context(|| format!("upsert session {} for store {store_id}", s.id_session))?;
    Ok(())
}

pub async fn upsert_order(db: &Db, store_id: &str, o: &RemoteOrder) -> Result<()> {
    sqlx::query(
        "INSERT INTO sale_orders (
            linisco_id, store_id, shop_number, id_sale_order, id_customer, number,
            order_date, id_session, payment_method, total, discount, synced_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         ON CONFLICT (store_id, linisco_id) DO UPDATE SET
            shop_number = excluded.shop_number,
            id_sale_order = excluded.id_sale_order,
            id_customer = excluded.id_customer,
            number = excluded.number,
            order_date = excluded.order_date,
            id_session = excluded.id_session,
            payment_method = excluded.payment_method,
            total = excluded.total,
            discount = excluded.discount,
            synced_at = excluded.synced_at",
    )
    .bind(o.id)
    .bind(store_id)
    .bind(o.shop_number.as_deref())
    .bind(o.id_sale_order)
    .bind(o.id_customer)
    .bind(o.number.as_deref())
    .bind(o.order_date.as_str())
    .bind(o.id_session)
    .bind(o.payment_method.as_deref())
    .bind(o.total)
    .bind(o.discount)
    .bind(now_iso())
    .execute(&db.pool)
    .await
    .with_context(|| format!("upsert order {} for store {store_id}", o.id))?;
    Ok(())
}

pub async fn upsert_product(db: &Db, store_id: &str, p: &RemoteProduct) -> Result<()> {
    sqlx::query(
        "INSERT INTO sale_products (
            linisco_id, store_id, shop_number, id_sale_order, id_product,
            id_control_sheet_def, name, fixed_name, quantity, sale_price, synced_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (store_id, linisco_id) DO UPDATE SET
            shop_number = excluded.shop_number,
            id_sale_order = excluded.id_sale_order,
            id_product = excluded.id_product,
            id_control_sheet_def = excluded.id_control_sheet_def,
            name = excluded.name,
            fixed_name = excluded.fixed_name,
            quantity = excluded.quantity,
            sale_price = excluded.sale_price,
            synced_at = excluded.synced_at",
    )
    .bind(p.id_sale_product)
    .bind(store_id)
    .bind(p.shop_number.as_deref())
    .bind(p.id_sale_order)
    .bind(p.id_product)
    .bind(p.id_control_sheet_def)
    .bind(p.name.as_str())
    .bind(p.fixed_name.as_deref())
    .bind(p.quantity)
    .bind(p.sale_price)
    .bind(now_iso())
    .execute(&db.pool)
    .await
    .with_context(|| format!("upsert product {} for store {store_id}", p.id_sale_product))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLogEntry<'a> {
    pub sync_type: &'a str,
    pub window: DateWindow,
    pub status: &'a str,
    pub records_synced: i64,
    pub error_count: i64,
    pub started_at: String,
}

pub async fn insert_sync_log(db: &Db, entry: &SyncLogEntry<'_>) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO sync_log (
            sync_type, start_date, end_date, status, records_synced, error_count,
            started_at, completed_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING id",
    )
    .bind(entry.sync_type)
    .bind(entry.window.from_day())
    .bind(entry.window.to_day())
    .bind(entry.status)
    .bind(entry.records_synced)
    .bind(entry.error_count)
    .bind(entry.started_at.as_str())
    .bind(now_iso())
    .fetch_one(&db.pool)
    .await
    .context("insert sync_log")?;
    Ok(row.try_get::<i64, _>(0)?)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncLogRow {
    pub id: i64,
    pub sync_type: String,
    pub start_date: String,
    pub end_date: String,
    pub status: String,
    pub records_synced: i64,
    pub error_count: i64,
    pub started_at: String,
    pub completed_at: String,
}

/// Most recent runs first.
pub async fn recent_sync_log(db: &Db, limit: i64) -> Result<Vec<SyncLogRow>> {
    let rows = sqlx::query(
        "SELECT id, sync_type, start_date, end_date, status, records_synced,
                error_count, started_at, completed_at
         FROM sync_log
         ORDER BY id DESC
         LIMIT $1",
    )
    .bind(limit.clamp(1, 500))
    .fetch_all(&db.pool)
    .await
    .context("read sync_log")?;
    rows.iter()
        .map(|r| -> Result<SyncLogRow> {
            Ok(SyncLogRow {
                id: r.try_get("id")?,
                sync_type: r.try_get("sync_type")?,
                start_date: r.try_get("start_date")?,
                end_date: r.try_get("end_date")?,
                status: r.try_get("status")?,
                records_synced: r.try_get("records_synced")?,
                error_count: r.try_get("error_count")?,
                started_at: r.try_get("started_at")?,
                completed_at: r.try_get("completed_at")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::db::test_support::sqlite_db;

    fn store() -> StoreConfig {
        StoreConfig {
            store_id: "20003".into(),
            store_name: "Centro".into(),
            email: "centro@example.com".into(),
            password: "x".into(),
        }
    }

    async fn count(db: &Db, sql: &str) -> i64 {
        sqlx::query(sql)
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get::<i64, _>(0)
    }

    #[tokio::test]
    async fn order_upsert_updates_in_place() {
        let (db, _dir) = sqlite_db().await;
        upsert_store(&db, &store()).await.unwrap();
        let mut order = RemoteOrder {
            id: 1,
            id_sale_order: 500,
            order_date: "2024-03-01T10:00:00".into(),
            total: 100.0,
            ..Default::default()
        };
        upsert_order(&db, "20003", &order).await.unwrap();
        order.total = 120.0;
        upsert_order(&db, "20003", &order).await.unwrap();

        assert_eq!(count(&db, "SELECT COUNT(*) FROM sale_orders").await, 1);
        let total: f64 = sqlx::query("SELECT total FROM sale_orders WHERE linisco_id = $1")
            .bind(1_i64)
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(total, 120.0);
    }

    #[tokio::test]
    async fn rows_for_unknown_store_are_rejected() {
        let (db, _dir) = sqlite_db().await;
        let product = RemoteProduct {
            id_sale_product: 9,
            id_sale_order: 1,
            name: "Burger".into(),
            ..Default::default()
        };
        assert!(upsert_product(&db, "404", &product).await.is_err());
    }

    #[tokio::test]
    async fn store_upsert_renames_existing_store() {
        let (db, _dir) = sqlite_db().await;
        upsert_store(&db, &store()).await.unwrap();
        let mut renamed = store();
        renamed.store_name = "Centro II".into();
        upsert_store(&db, &renamed).await.unwrap();
        let name: String = sqlx::query("SELECT store_name FROM stores WHERE store_id = $1")
            .bind("20003")
            .fetch_one(&db.pool)
            .await
            .unwrap()
            .get(0);
        assert_eq!(name, "Centro II");
        assert_eq!(count(&db, "SELECT COUNT(*) FROM stores").await, 1);
    }

    #[tokio::test]
    async fn sync_log_reads_back_newest_first() {
        let (db, _dir) = sqlite_db().await;
        let window = DateWindow::parse("2024-03-01", "2024-03-01").unwrap();
        for status in ["completed", "partial"] {
            insert_sync_log(
                &db,
                &SyncLogEntry {
                    sync_type: "multi_store_sync",
                    window,
                    status,
                    records_synced: 3,
                    error_count: 0,
                    started_at: now_iso(),
                },
            )
            .await
            .unwrap();
        }
        let rows = recent_sync_log(&db, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, "partial");
        assert_eq!(rows[0].start_date, "2024-03-01");
    }
}
