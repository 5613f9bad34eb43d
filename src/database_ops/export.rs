use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::any::AnyRow;
use sqlx::Row;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::database_ops::reports::ReportFilter;
use crate::util::db::Db;
use crate::util::env as env_util;
use crate::window::DateWindow;

pub const DEFAULT_EXPORT_DIR: &str = "./exports";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Orders,
    Products,
    Sessions,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::Orders => "orders",
            ExportKind::Products => "products",
            ExportKind::Sessions => "sessions",
        }
    }

    pub fn default_file_name(&self, window: &DateWindow) -> String {
        format!(
            "export_{}_{}_to_{}.csv",
            self.as_str(),
            window.from_day(),
            window.to_day()
        )
    }
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub kind: ExportKind,
    pub rows: usize,
    /// `None` when nothing matched and no file was written.
    pub path: Option<PathBuf>,
}

/// `EXPORT_DIR`, default `./exports`.
pub fn export_dir() -> PathBuf {
    PathBuf::from(env_util::env_opt("EXPORT_DIR").unwrap_or_else(|| DEFAULT_EXPORT_DIR.into()))
}

#[derive(Debug, Serialize)]
struct OrderCsv {
    store_id: String,
    linisco_id: i64,
    shop_number: Option<String>,
    id_sale_order: i64,
    id_customer: Option<i64>,
    number: Option<String>,
    order_date: String,
    id_session: Option<i64>,
    payment_method: Option<String>,
    total: f64,
    discount: f64,
}

#[derive(Debug, Serialize)]
struct ProductCsv {
    store_id: String,
    linisco_id: i64,
    id_sale_order: i64,
    id_product: Option<i64>,
    name: String,
    fixed_name: Option<String>,
    quantity: f64,
    sale_price: f64,
    order_date: String,
}

#[derive(Debug, Serialize)]
struct SessionCsv {
    store_id: String,
    linisco_id: i64,
    shop_number: Option<String>,
    username: Option<String>,
    checkin: Option<String>,
    checkout: Option<String>,
    initial_cash: f64,
    cash: f64,
    in_total: f64,
    total_invoiced: f64,
    real_invoiced: f64,
}

/// Write the rows of `kind` inside `window` to `dir/file_name` (or the
/// default `export_{kind}_{from}_to_{to}.csv`). Newest rows first.
pub async fn export_csv(
    db: &Db,
    kind: ExportKind,
    window: &DateWindow,
    store_ids: &[String],
    dir: &Path,
    file_name: Option<&str>,
) -> Result<ExportSummary> {
    let filter = ReportFilter::new(*window, store_ids.to_vec());
    let rows = match kind {
        ExportKind::Orders => {
            let rows = query(
                db,
                "SELECT so.store_id, so.linisco_id, so.shop_number, so.id_sale_order,
                        so.id_customer, so.number, so.order_date, so.id_session,
                        so.payment_method, so.total, so.discount
                 FROM sale_orders so",
                "so.order_date",
                "so.store_id",
                "ORDER BY so.order_date DESC",
                &filter,
            )
            .await?;
            rows.iter()
                .map(|r| -> Result<OrderCsv> {
                    Ok(OrderCsv {
                        store_id: r.try_get("store_id")?,
                        linisco_id: r.try_get("linisco_id")?,
                        shop_number: r.try_get("shop_number")?,
                        id_sale_order: r.try_get("id_sale_order")?,
                        id_customer: r.try_get("id_customer")?,
                        number: r.try_get("number")?,
                        order_date: r.try_get("order_date")?,
                        id_session: r.try_get("id_session")?,
                        payment_method: r.try_get("payment_method")?,
                        total: r.try_get("total")?,
                        discount: r.try_get("discount")?,
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Rows::Orders)?
        }
        ExportKind::Products => {
            let rows = query(
                db,
                "SELECT sp.store_id, sp.linisco_id, sp.id_sale_order, sp.id_product,
                        sp.name, sp.fixed_name, sp.quantity, sp.sale_price, so.order_date
                 FROM sale_products sp
                 JOIN sale_orders so
                   ON so.store_id = sp.store_id AND so.id_sale_order = sp.id_sale_order",
                "so.order_date",
                "sp.store_id",
                "ORDER BY so.order_date DESC, sp.linisco_id",
                &filter,
            )
            .await?;
            rows.iter()
                .map(|r| -> Result<ProductCsv> {
                    Ok(ProductCsv {
                        store_id: r.try_get("store_id")?,
                        linisco_id: r.try_get("linisco_id")?,
                        id_sale_order: r.try_get("id_sale_order")?,
                        id_product: r.try_get("id_product")?,
                        name: r.try_get("name")?,
                        fixed_name: r.try_get("fixed_name")?,
                        quantity: r.try_get("quantity")?,
                        sale_price: r.try_get("sale_price")?,
                        order_date: r.try_get("order_date")?,
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Rows::Products)?
        }
        ExportKind::Sessions => {
            let rows = query(
                db,
                "SELECT se.store_id, se.linisco_id, se.shop_number, se.username,
                        se.checkin, se.checkout, se.initial_cash, se.cash, se.in_total,
                        se.total_invoiced, se.real_invoiced
                 FROM sessions se",
                "se.checkin",
                "se.store_id",
                "ORDER BY se.checkin DESC",
                &filter,
            )
            .await?;
            rows.iter()
                .map(|r| -> Result<SessionCsv> {
                    Ok(SessionCsv {
                        store_id: r.try_get("store_id")?,
                        linisco_id: r.try_get("linisco_id")?,
                        shop_number: r.try_get("shop_number")?,
                        username: r.try_get("username")?,
                        checkin: r.try_get("checkin")?,
                        checkout: r.try_get("checkout")?,
                        initial_cash: r.try_get("initial_cash")?,
                        cash: r.try_get("cash")?,
                        in_total: r.try_get("in_total")?,
                        total_invoiced: r.try_get("total_invoiced")?,
                        real_invoiced: r.try_get("real_invoiced")?,
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(Rows::Sessions)?
        }
    };

    let count = rows.len();
    if count == 0 {
        info!(kind = %kind, window = %window, "nothing to export");
        return Ok(ExportSummary {
            kind,
            rows: 0,
            path: None,
        });
    }

    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let name = file_name
        .map(str::to_string)
        .unwrap_or_else(|| kind.default_file_name(window));
    let path = dir.join(name);
    let mut wtr = csv::Writer::from_path(&path).with_context(|| format!("open {}", path.display()))?;
    match &rows {
        Rows::Orders(v) => v.iter().try_for_each(|r| wtr.serialize(r))?,
        Rows::Products(v) => v.iter().try_for_each(|r| wtr.serialize(r))?,
        Rows::Sessions(v) => v.iter().try_for_each(|r| wtr.serialize(r))?,
    }
    wtr.flush()?;
    info!(kind = %kind, rows = count, path = %path.display(), "export written");
    Ok(ExportSummary {
        kind,
        rows: count,
        path: Some(path),
    })
}

enum Rows {
    Orders(Vec<OrderCsv>),
    Products(Vec<ProductCsv>),
    Sessions(Vec<SessionCsv>),
}

impl Rows {
    fn len(&self) -> usize {
        match self {
            Rows::Orders(v) => v.len(),
            Rows::Products(v) => v.len(),
            Rows::Sessions(v) => v.len(),
        }
    }
}

async fn query(
    db: &Db,
    select: &str,
    date_col: &str,
    store_col: &str,
    order_by: &str,
    filter: &ReportFilter,
) -> Result<Vec<AnyRow>> {
    let (cond, binds) = filter.clause(date_col, store_col, 1);
    let sql = format!("{select} WHERE 1 = 1{cond} {order_by}");
    let mut q = sqlx::query(&sql);
    for b in &binds {
        q = q.bind(b.as_str());
    }
    q.fetch_all(&db.pool).await.context("export query failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::reports::seed::{march, seed};
    use crate::util::db::test_support::sqlite_db;

    #[tokio::test]
    async fn writes_orders_newest_first() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let out = tempfile::tempdir().unwrap();
        let window = march().window.unwrap();

        let summary = export_csv(&db, ExportKind::Orders, &window, &[], out.path(), None)
            .await
            .unwrap();
        assert_eq!(summary.rows, 5);
        let path = summary.path.unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "export_orders_2024-03-01_to_2024-03-03.csv"
        );

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(&headers[0], "store_id");
        assert_eq!(&headers[6], "order_date");
        let first = rdr.records().next().unwrap().unwrap();
        assert!(first[6].starts_with("2024-03-03"));
    }

    #[tokio::test]
    async fn products_carry_parent_order_date_and_store_filter() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let out = tempfile::tempdir().unwrap();
        let window = march().window.unwrap();

        let summary = export_csv(
            &db,
            ExportKind::Products,
            &window,
            &["20004".to_string()],
            out.path(),
            Some("norte.csv"),
        )
        .await
        .unwrap();
        assert_eq!(summary.rows, 1);
        let text = std::fs::read_to_string(out.path().join("norte.csv")).unwrap();
        assert!(text.contains("Burger"));
        assert!(text.contains("2024-03-02T12:00:00"));
    }

    #[tokio::test]
    async fn empty_window_writes_nothing() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("nested");
        let window = DateWindow::parse("2020-01-01", "2020-01-02").unwrap();

        let summary = export_csv(&db, ExportKind::Sessions, &window, &[], &target, None)
            .await
            .unwrap();
        assert_eq!(summary.rows, 0);
        assert!(summary.path.is_none());
        assert!(!target.exists());
    }
}
