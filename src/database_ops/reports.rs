//! Read-side aggregates over the synced tables.
//!
//! All reports filter on the day part of `sale_orders.order_date` (inclusive)
//! and optionally on a set of store ids. Revenue is always `total - discount`.
use anyhow::{Context, Result};
use chrono::{Datelike, Duration};
use indexmap::IndexMap;
use serde::Serialize;
use sqlx::any::AnyRow;
use sqlx::Row;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::util::db::{placeholders, Db};
use crate::window::{parse_date, DateWindow};

pub const DEFAULT_TOP_PRODUCTS: i64 = 20;
pub const MAX_TOP_PRODUCTS: i64 = 500;
pub const PATTERN_PRODUCTS: i64 = 10;
/// Days before the window's end covered by `sales_history`.
pub const HISTORY_DAYS: i64 = 30;
/// Cash share above which the insight suggests pushing card payments.
const CASH_HEAVY_PCT: f64 = 70.0;

const WEEKDAYS: [&str; 7] = [
    "Domingo", "Lunes", "Martes", "Miercoles", "Jueves", "Viernes", "Sabado",
];

/// Window and store filter shared by every report.
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub window: Option<DateWindow>,
    pub store_ids: Vec<String>,
}

impl ReportFilter {
    pub fn new(window: DateWindow, store_ids: Vec<String>) -> Self {
        let store_ids = store_ids
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            window: Some(window),
            store_ids,
        }
    }

    /// ` AND ...` clause over `date_col` / `store_col`, with bind values in order.
    /// Placeholders start at `$first`.
    pub(crate) fn clause(&self, date_col: &str, store_col: &str, first: usize) -> (String, Vec<String>) {
        let mut sql = String::new();
        let mut binds = Vec::new();
        if let Some(w) = &self.window {
            let _ = write!(
                sql,
                " AND substr({date_col}, 1, 10) BETWEEN ${} AND ${}",
                first,
                first + 1
            );
            binds.push(w.from_day());
            binds.push(w.to_day());
        }
        if !self.store_ids.is_empty() {
            let _ = write!(
                sql,
                " AND {store_col} IN ({})",
                placeholders(first + binds.len(), self.store_ids.len())
            );
            binds.extend(self.store_ids.iter().cloned());
        }
        (sql, binds)
    }
}

async fn fetch(db: &Db, sql: &str, binds: &[String]) -> Result<Vec<AnyRow>> {
    let mut q = sqlx::query(sql);
    for b in binds {
        q = q.bind(b.as_str());
    }
    q.fetch_all(&db.pool)
        .await
        .with_context(|| format!("report query failed: {}", compact(sql)))
}

async fn fetch_with_limit(db: &Db, sql: &str, binds: &[String], limit: i64) -> Result<Vec<AnyRow>> {
    let mut q = sqlx::query(sql);
    for b in binds {
        q = q.bind(b.as_str());
    }
    q.bind(limit)
        .fetch_all(&db.pool)
        .await
        .with_context(|| format!("report query failed: {}", compact(sql)))
}

fn compact(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PaymentBreakdown {
    pub payment_method: String,
    pub order_count: i64,
    pub total_amount: f64,
    pub avg_order_value: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreBreakdown {
    pub store_id: String,
    pub store_name: String,
    pub order_count: i64,
    pub revenue: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Stats {
    pub total_orders: i64,
    pub total_stores: i64,
    pub total_revenue: f64,
    pub avg_order_value: f64,
    pub days_with_sales: i64,
    pub total_products: i64,
    pub payment_breakdown: Vec<PaymentBreakdown>,
    pub store_breakdown: Vec<StoreBreakdown>,
}

pub async fn stats(db: &Db, filter: &ReportFilter) -> Result<Stats> {
    let (cond, binds) = filter.clause("so.order_date", "so.store_id", 1);
    let sql = format!(
        "SELECT COUNT(so.id) AS total_orders,
                COUNT(DISTINCT so.store_id) AS total_stores,
                COALESCE(SUM(so.total - so.discount), 0.0) AS total_revenue,
                COALESCE(AVG(so.total - so.discount), 0.0) AS avg_order_value,
                COUNT(DISTINCT substr(so.order_date, 1, 10)) AS days_with_sales
         FROM sale_orders so
         WHERE 1 = 1{cond}"
    );
    let rows = fetch(db, &sql, &binds).await?;
    let head = rows.first().context("stats query returned no row")?;

    let (pcond, pbinds) = filter.clause("so.order_date", "so.store_id", 1);
    let product_sql = format!(
        "SELECT COUNT(DISTINCT sp.name) AS total_products
         FROM sale_products sp
         JOIN sale_orders so
           ON so.store_id = sp.store_id AND so.id_sale_order = sp.id_sale_order
         WHERE 1 = 1{pcond}"
    );
    let total_products: i64 = fetch(db, &product_sql, &pbinds)
        .await?
        .first()
        .map(|r| r.try_get(0))
        .transpose()?
        .unwrap_or(0);

    Ok(Stats {
        total_orders: head.try_get("total_orders")?,
        total_stores: head.try_get("total_stores")?,
        total_revenue: round2(head.try_get("total_revenue")?),
        avg_order_value: round2(head.try_get("avg_order_value")?),
        days_with_sales: head.try_get("days_with_sales")?,
        total_products,
        payment_breakdown: payment_methods(db, filter).await?,
        store_breakdown: store_breakdown(db, filter).await?,
    })
}

/// Orders and amount per payment method, biggest amount first.
pub async fn payment_methods(db: &Db, filter: &ReportFilter) -> Result<Vec<PaymentBreakdown>> {
    let (cond, binds) = filter.clause("so.order_date", "so.store_id", 1);
    let sql = format!(
        "SELECT COALESCE(so.payment_method, 'unknown') AS payment_method,
                COUNT(*) AS order_count,
                COALESCE(SUM(so.total - so.discount), 0.0) AS total_amount,
                COALESCE(AVG(so.total - so.discount), 0.0) AS avg_order_value
         FROM sale_orders so
         WHERE 1 = 1{cond}
         GROUP BY COALESCE(so.payment_method, 'unknown')
         ORDER BY total_amount DESC"
    );
    let rows = fetch(db, &sql, &binds).await?;
    let mut out = rows
        .iter()
        .map(|r| -> Result<PaymentBreakdown> {
            Ok(PaymentBreakdown {
                payment_method: r.try_get("payment_method")?,
                order_count: r.try_get("order_count")?,
                total_amount: r.try_get("total_amount")?,
                avg_order_value: round2(r.try_get("avg_order_value")?),
                percentage: 0.0,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let total: f64 = out.iter().map(|p| p.total_amount).sum();
    for p in &mut out {
        p.percentage = percentage(p.total_amount, total);
        p.total_amount = round2(p.total_amount);
    }
    Ok(out)
}

async fn store_breakdown(db: &Db, filter: &ReportFilter) -> Result<Vec<StoreBreakdown>> {
    let (cond, binds) = filter.clause("so.order_date", "so.store_id", 1);
    let sql = format!(
        "SELECT s.store_id, s.store_name,
                COUNT(so.id) AS order_count,
                COALESCE(SUM(so.total - so.discount), 0.0) AS revenue
         FROM sale_orders so
         JOIN stores s ON s.store_id = so.store_id
         WHERE 1 = 1{cond}
         GROUP BY s.store_id, s.store_name
         ORDER BY revenue DESC"
    );
    let rows = fetch(db, &sql, &binds).await?;
    let mut out = rows
        .iter()
        .map(|r| -> Result<StoreBreakdown> {
            Ok(StoreBreakdown {
                store_id: r.try_get("store_id")?,
                store_name: r.try_get("store_name")?,
                order_count: r.try_get("order_count")?,
                revenue: r.try_get("revenue")?,
                percentage: 0.0,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let total: f64 = out.iter().map(|s| s.revenue).sum();
    for s in &mut out {
        s.percentage = percentage(s.revenue, total);
        s.revenue = round2(s.revenue);
    }
    Ok(out)
}

fn percentage(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        round2(part / total * 100.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SalesSummaryRow {
    pub date: String,
    pub store_id: String,
    pub store_name: String,
    /// `cash` or `otros_medios`.
    pub payment_method: String,
    pub order_count: i64,
    pub total_amount: f64,
    pub avg_order_value: f64,
}

/// Per day and store, cash versus every other tender merged together.
pub async fn sales_summary(db: &Db, filter: &ReportFilter) -> Result<Vec<SalesSummaryRow>> {
    let (cond, binds) = filter.clause("so.order_date", "so.store_id", 1);
    let sql = format!(
        "SELECT substr(so.order_date, 1, 10) AS day,
                s.store_id, s.store_name,
                CASE WHEN so.payment_method = 'cash' THEN 'cash' ELSE 'otros_medios' END AS category,
                COUNT(*) AS order_count,
                COALESCE(SUM(so.total - so.discount), 0.0) AS total_amount
         FROM sale_orders so
         JOIN stores s ON s.store_id = so.store_id
         WHERE 1 = 1{cond}
         GROUP BY substr(so.order_date, 1, 10), s.store_id, s.store_name,
                  CASE WHEN so.payment_method = 'cash' THEN 'cash' ELSE 'otros_medios' END"
    );
    let rows = fetch(db, &sql, &binds).await?;
    let mut out = rows
        .iter()
        .map(|r| -> Result<SalesSummaryRow> {
            let order_count: i64 = r.try_get("order_count")?;
            let total_amount: f64 = r.try_get("total_amount")?;
            Ok(SalesSummaryRow {
                date: r.try_get("day")?,
                store_id: r.try_get("store_id")?,
                store_name: r.try_get("store_name")?,
                payment_method: r.try_get("category")?,
                order_count,
                total_amount: round2(total_amount),
                avg_order_value: if order_count > 0 {
                    round2(total_amount / order_count as f64)
                } else {
                    0.0
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;
    out.sort_by(|a, b| {
        b.date
            .cmp(&a.date)
            .then_with(|| b.total_amount.total_cmp(&a.total_amount))
    });
    Ok(out)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopProduct {
    pub name: String,
    pub fixed_name: Option<String>,
    pub store_id: String,
    pub store_name: String,
    pub times_sold: i64,
    pub total_quantity: f64,
    pub total_revenue: f64,
    pub avg_price: f64,
}

/// Best sellers by revenue (`sale_price * quantity`). `limit` is clamped to 1..=500.
pub async fn top_products(
    db: &Db,
    filter: &ReportFilter,
    limit: Option<i64>,
) -> Result<Vec<TopProduct>> {
    let limit = limit
        .unwrap_or(DEFAULT_TOP_PRODUCTS)
        .clamp(1, MAX_TOP_PRODUCTS);
    let (cond, binds) = filter.clause("so.order_date", "sp.store_id", 1);
    let sql = format!(
        "SELECT sp.name, sp.fixed_name, s.store_id, s.store_name,
                COUNT(*) AS times_sold,
                COALESCE(SUM(sp.quantity), 0.0) AS total_quantity,
                COALESCE(SUM(sp.sale_price * sp.quantity), 0.0) AS total_revenue,
                COALESCE(AVG(sp.sale_price), 0.0) AS avg_price
         FROM sale_products sp
         JOIN sale_orders so
           ON so.store_id = sp.store_id AND so.id_sale_order = sp.id_sale_order
         JOIN stores s ON s.store_id = sp.store_id
         WHERE 1 = 1{cond}
         GROUP BY sp.name, sp.fixed_name, s.store_id, s.store_name
         ORDER BY total_revenue DESC, times_sold DESC
         LIMIT ${}",
        binds.len() + 1
    );
    let rows = fetch_with_limit(db, &sql, &binds, limit).await?;
    rows.iter()
        .map(|r| -> Result<TopProduct> {
            Ok(TopProduct {
                name: r.try_get("name")?,
                fixed_name: r.try_get("fixed_name")?,
                store_id: r.try_get("store_id")?,
                store_name: r.try_get("store_name")?,
                times_sold: r.try_get("times_sold")?,
                total_quantity: r.try_get("total_quantity")?,
                total_revenue: round2(r.try_get("total_revenue")?),
                avg_price: round2(r.try_get("avg_price")?),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DailySales {
    pub date: String,
    pub order_count: i64,
    pub total_revenue: f64,
    pub avg_order_value: f64,
}

pub async fn daily_sales(db: &Db, filter: &ReportFilter) -> Result<Vec<DailySales>> {
    let (cond, binds) = filter.clause("so.order_date", "so.store_id", 1);
    let sql = format!(
        "SELECT substr(so.order_date, 1, 10) AS day,
                COUNT(*) AS order_count,
                COALESCE(SUM(so.total - so.discount), 0.0) AS total_revenue,
                COALESCE(AVG(so.total - so.discount), 0.0) AS avg_order_value
         FROM sale_orders so
         WHERE 1 = 1{cond}
         GROUP BY substr(so.order_date, 1, 10)
         ORDER BY day DESC"
    );
    let rows = fetch(db, &sql, &binds).await?;
    rows.iter()
        .map(|r| -> Result<DailySales> {
            Ok(DailySales {
                date: r.try_get("day")?,
                order_count: r.try_get("order_count")?,
                total_revenue: round2(r.try_get("total_revenue")?),
                avg_order_value: round2(r.try_get("avg_order_value")?),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub store_id: String,
    pub session_id: i64,
    pub shop_number: Option<String>,
    pub username: Option<String>,
    pub checkin: Option<String>,
    pub checkout: Option<String>,
    pub total_invoiced: f64,
    pub real_invoiced: f64,
    pub order_count: i64,
}

/// Cashier sessions by check-in day, with the orders rung up in each.
pub async fn session_summary(db: &Db, filter: &ReportFilter) -> Result<Vec<SessionSummary>> {
    let (cond, binds) = filter.clause("se.checkin", "se.store_id", 1);
    let sql = format!(
        "SELECT se.store_id, se.linisco_id, se.shop_number, se.username,
                se.checkin, se.checkout, se.total_invoiced, se.real_invoiced,
                COUNT(so.id) AS order_count
         FROM sessions se
         LEFT JOIN sale_orders so
           ON so.store_id = se.store_id AND so.id_session = se.linisco_id
         WHERE 1 = 1{cond}
         GROUP BY se.id, se.store_id, se.linisco_id, se.shop_number, se.username,
                  se.checkin, se.checkout, se.total_invoiced, se.real_invoiced
         ORDER BY se.checkin DESC"
    );
    let rows = fetch(db, &sql, &binds).await?;
    rows.iter()
        .map(|r| -> Result<SessionSummary> {
            Ok(SessionSummary {
                store_id: r.try_get("store_id")?,
                session_id: r.try_get("linisco_id")?,
                shop_number: r.try_get("shop_number")?,
                username: r.try_get("username")?,
                checkin: r.try_get("checkin")?,
                checkout: r.try_get("checkout")?,
                total_invoiced: r.try_get("total_invoiced")?,
                real_invoiced: r.try_get("real_invoiced")?,
                order_count: r.try_get("order_count")?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreRow {
    pub store_id: String,
    pub store_name: String,
    pub email: String,
}

pub async fn list_stores(db: &Db) -> Result<Vec<StoreRow>> {
    let rows = sqlx::query("SELECT store_id, store_name, email FROM stores ORDER BY store_name")
        .fetch_all(&db.pool)
        .await
        .context("list stores")?;
    rows.iter()
        .map(|r| -> Result<StoreRow> {
            Ok(StoreRow {
                store_id: r.try_get("store_id")?,
                store_name: r.try_get("store_name")?,
                email: r.try_get("email")?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreTotals {
    pub store_id: String,
    pub store_name: String,
    pub total_orders: i64,
    pub total_products: i64,
    pub total_revenue: f64,
    pub avg_order_value: f64,
}

/// Every store, including ones without sales in the window.
pub async fn stores_summary(db: &Db, filter: &ReportFilter) -> Result<Vec<StoreTotals>> {
    // Window conditions belong in the join so stores without sales still appear.
    let (ocond, mut binds) = filter.clause("so.order_date", "so.store_id", 1);
    let (pcond, pbinds) = filter.clause("o2.order_date", "o2.store_id", binds.len() + 1);
    binds.extend(pbinds);
    let store_filter = if filter.store_ids.is_empty() {
        String::new()
    } else {
        let first = binds.len() + 1;
        binds.extend(filter.store_ids.iter().cloned());
        format!(
            " WHERE s.store_id IN ({})",
            placeholders(first, filter.store_ids.len())
        )
    };
    let sql = format!(
        "SELECT s.store_id, s.store_name,
                COUNT(so.id) AS total_orders,
                COALESCE(SUM(so.total - so.discount), 0.0) AS total_revenue,
                COALESCE(AVG(so.total - so.discount), 0.0) AS avg_order_value,
                (SELECT COUNT(*)
                   FROM sale_products sp
                   JOIN sale_orders o2
                     ON o2.store_id = sp.store_id AND o2.id_sale_order = sp.id_sale_order
                  WHERE sp.store_id = s.store_id{pcond}) AS total_products
         FROM stores s
         LEFT JOIN sale_orders so ON so.store_id = s.store_id{ocond}{store_filter}
         GROUP BY s.store_id, s.store_name
         ORDER BY total_revenue DESC, s.store_name"
    );
    let rows = fetch(db, &sql, &binds).await?;
    rows.iter()
        .map(|r| -> Result<StoreTotals> {
            Ok(StoreTotals {
                store_id: r.try_get("store_id")?,
                store_name: r.try_get("store_name")?,
                total_orders: r.try_get("total_orders")?,
                total_products: r.try_get("total_products")?,
                total_revenue: round2(r.try_get("total_revenue")?),
                avg_order_value: round2(r.try_get("avg_order_value")?),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WeekdaySales {
    /// 0 = Sunday.
    pub day_number: u32,
    pub day_name: String,
    pub order_count: i64,
    pub total_revenue: f64,
    pub avg_order_value: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HourlySales {
    /// Two-digit hour of `order_date`.
    pub hour: String,
    pub order_count: i64,
    pub total_revenue: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Insight {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SalesPatterns {
    pub day_of_week: Vec<WeekdaySales>,
    pub hourly: Vec<HourlySales>,
    pub product_trends: Vec<TopProduct>,
    pub payment_methods: Vec<PaymentBreakdown>,
    pub insights: Vec<Insight>,
}

/// When in the week and in the day sales happen, plus the insights drawn
/// from them.
pub async fn sales_patterns(db: &Db, filter: &ReportFilter) -> Result<SalesPatterns> {
    let day_of_week = weekday_buckets(&daily_sales(db, filter).await?);
    let hourly = hourly_sales(db, filter).await?;
    let product_trends = top_products(db, filter, Some(PATTERN_PRODUCTS)).await?;
    let payment_methods = payment_methods(db, filter).await?;
    let insights = pattern_insights(&day_of_week, &hourly, &product_trends, &payment_methods);
    Ok(SalesPatterns {
        day_of_week,
        hourly,
        product_trends,
        payment_methods,
        insights,
    })
}

fn weekday_buckets(days: &[DailySales]) -> Vec<WeekdaySales> {
    let mut buckets: BTreeMap<u32, (i64, f64)> = BTreeMap::new();
    for d in days {
        let Ok(date) = parse_date(&d.date) else {
            continue;
        };
        let e = buckets
            .entry(date.weekday().num_days_from_sunday())
            .or_default();
        e.0 += d.order_count;
        e.1 += d.total_revenue;
    }
    buckets
        .into_iter()
        .map(|(n, (orders, revenue))| WeekdaySales {
            day_number: n,
            day_name: WEEKDAYS[n as usize].to_string(),
            order_count: orders,
            total_revenue: round2(revenue),
            avg_order_value: if orders > 0 {
                round2(revenue / orders as f64)
            } else {
                0.0
            },
        })
        .collect()
}

async fn hourly_sales(db: &Db, filter: &ReportFilter) -> Result<Vec<HourlySales>> {
    let (cond, binds) = filter.clause("so.order_date", "so.store_id", 1);
    let sql = format!(
        "SELECT substr(so.order_date, 12, 2) AS hour,
                COUNT(*) AS order_count,
                COALESCE(SUM(so.total - so.discount), 0.0) AS total_revenue
         FROM sale_orders so
         WHERE length(so.order_date) >= 13{cond}
         GROUP BY substr(so.order_date, 12, 2)
         ORDER BY hour"
    );
    let rows = fetch(db, &sql, &binds).await?;
    rows.iter()
        .map(|r| -> Result<HourlySales> {
            Ok(HourlySales {
                hour: r.try_get("hour")?,
                order_count: r.try_get("order_count")?,
                total_revenue: round2(r.try_get("total_revenue")?),
            })
        })
        .collect()
}

fn pattern_insights(
    days: &[WeekdaySales],
    hours: &[HourlySales],
    products: &[TopProduct],
    payments: &[PaymentBreakdown],
) -> Vec<Insight> {
    let mut out = Vec::new();
    if let Some(best) = days.iter().max_by(|a, b| a.total_revenue.total_cmp(&b.total_revenue)) {
        out.push(Insight {
            kind: "performance".into(),
            title: "Mejor dia de ventas".into(),
            message: format!(
                "{} es tu mejor dia con ${:.2} en ventas",
                best.day_name, best.total_revenue
            ),
            recommendation: format!(
                "Considera promociones especiales los {} para maximizar ingresos",
                best.day_name
            ),
        });
    }
    if let Some(peak) = hours.iter().max_by(|a, b| a.total_revenue.total_cmp(&b.total_revenue)) {
        out.push(Insight {
            kind: "timing".into(),
            title: "Horario pico".into(),
            message: format!(
                "La hora {}:00 es tu momento de mayor actividad con ${:.2}",
                peak.hour, peak.total_revenue
            ),
            recommendation: format!(
                "Asegurate de tener suficiente personal a las {}:00",
                peak.hour
            ),
        });
    }
    if let Some(star) = products
        .iter()
        .max_by(|a, b| a.total_quantity.total_cmp(&b.total_quantity))
    {
        out.push(Insight {
            kind: "product".into(),
            title: "Producto estrella".into(),
            message: format!(
                "\"{}\" es tu producto mas vendido con {} unidades",
                star.name, star.total_quantity
            ),
            recommendation: "Mantene stock suficiente y considera promociones relacionadas".into(),
        });
    }
    let cash = payments.iter().find(|p| p.payment_method == "cash");
    let has_other = payments.iter().any(|p| p.payment_method != "cash");
    if let (Some(cash), true) = (cash, has_other) {
        let total: f64 = payments.iter().map(|p| p.total_amount).sum();
        let share = if total > 0.0 {
            cash.total_amount / total * 100.0
        } else {
            0.0
        };
        out.push(Insight {
            kind: "payment".into(),
            title: "Analisis de pagos".into(),
            message: format!("{share:.1}% de tus ventas son en efectivo"),
            recommendation: if share > CASH_HEAVY_PCT {
                "Considera incentivar pagos con tarjeta para reducir el manejo de efectivo".into()
            } else {
                "Tu mix de pagos esta bien balanceado".into()
            },
        });
    }
    out
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SalesHistory {
    pub window: DateWindow,
    /// Oldest day first.
    pub daily: Vec<DailySales>,
    pub best_day: Option<String>,
    pub worst_day: Option<String>,
    pub avg_daily_revenue: f64,
    pub avg_daily_orders: f64,
    /// Percent change of the second half's average daily revenue over the first half's.
    pub trend_pct: f64,
}

/// Daily series over the `HISTORY_DAYS` days before the filter's end date.
pub async fn sales_history(db: &Db, filter: &ReportFilter) -> Result<SalesHistory> {
    let end = filter
        .window
        .unwrap_or_else(|| DateWindow::last_days(1))
        .to;
    let window = DateWindow {
        from: end - Duration::days(HISTORY_DAYS),
        to: end,
    };
    let scoped = ReportFilter {
        window: Some(window),
        store_ids: filter.store_ids.clone(),
    };
    let mut daily = daily_sales(db, &scoped).await?;
    daily.reverse();

    let by_revenue = |a: &&DailySales, b: &&DailySales| a.total_revenue.total_cmp(&b.total_revenue);
    let best_day = daily.iter().max_by(by_revenue).map(|d| d.date.clone());
    let worst_day = daily.iter().min_by(by_revenue).map(|d| d.date.clone());
    let n = daily.len();
    let (avg_daily_revenue, avg_daily_orders) = if n > 0 {
        (
            round2(daily.iter().map(|d| d.total_revenue).sum::<f64>() / n as f64),
            round2(daily.iter().map(|d| d.order_count).sum::<i64>() as f64 / n as f64),
        )
    } else {
        (0.0, 0.0)
    };
    let (first, second) = daily.split_at(n / 2);
    let mean = |days: &[DailySales]| {
        if days.is_empty() {
            0.0
        } else {
            days.iter().map(|d| d.total_revenue).sum::<f64>() / days.len() as f64
        }
    };
    let (first_avg, second_avg) = (mean(first), mean(second));
    let trend_pct = if first_avg > 0.0 {
        round2((second_avg - first_avg) / first_avg * 100.0)
    } else {
        0.0
    };

    Ok(SalesHistory {
        window,
        daily,
        best_day,
        worst_day,
        avg_daily_revenue,
        avg_daily_orders,
        trend_pct,
    })
}

/// Compact plain-text digest of the window, fed to the chat model as context.
pub async fn context_snapshot(db: &Db, filter: &ReportFilter) -> Result<String> {
    let stats = stats(db, filter).await?;
    let top = top_products(db, filter, Some(3)).await?;
    let mut days = daily_sales(db, filter).await?;
    days.truncate(7);

    let mut out = String::new();
    if let Some(w) = &filter.window {
        let _ = writeln!(out, "Periodo: {} a {}", w.from_day(), w.to_day());
    }
    let _ = writeln!(
        out,
        "Resumen: {} ordenes, ingresos ${:.2}, ticket promedio ${:.2}, {} dias con ventas, {} productos distintos, {} tiendas",
        stats.total_orders,
        stats.total_revenue,
        stats.avg_order_value,
        stats.days_with_sales,
        stats.total_products,
        stats.total_stores
    );

    // Same product name can appear once per store; fold them together.
    let mut products: IndexMap<&str, (f64, f64)> = IndexMap::new();
    for p in &top {
        let e = products.entry(p.name.as_str()).or_insert((0.0, 0.0));
        e.0 += p.total_quantity;
        e.1 += p.total_revenue;
    }
    if !products.is_empty() {
        let _ = writeln!(out, "Top productos:");
        for (name, (qty, revenue)) in &products {
            let _ = writeln!(out, "- {name}: {qty} unidades, ${revenue:.2}");
        }
    }
    if !stats.payment_breakdown.is_empty() {
        let _ = writeln!(out, "Medios de pago:");
        for p in &stats.payment_breakdown {
            let _ = writeln!(
                out,
                "- {}: {} ordenes, ${:.2} ({:.1}%)",
                p.payment_method, p.order_count, p.total_amount, p.percentage
            );
        }
    }
    if !days.is_empty() {
        let _ = writeln!(out, "Ultimos dias:");
        for d in &days {
            let _ = writeln!(
                out,
                "- {}: {} ordenes, ${:.2}",
                d.date, d.order_count, d.total_revenue
            );
        }
    }
    if !stats.store_breakdown.is_empty() {
        let _ = writeln!(out, "Tiendas:");
        for s in stats.store_breakdown.iter().take(5) {
            let _ = writeln!(
                out,
                "- {} ({}): {} ordenes, ${:.2} ({:.1}%)",
                s.store_name, s.store_id, s.order_count, s.revenue, s.percentage
            );
        }
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::seed::{march, seed};
    use super::*;
    use crate::util::db::test_support::sqlite_db;

    #[test]
    fn filter_clause_numbers_placeholders() {
        let f = ReportFilter::new(
            DateWindow::parse("2024-03-01", "2024-03-03").unwrap(),
            vec!["1".into(), " ".into(), "2".into()],
        );
        let (sql, binds) = f.clause("so.order_date", "so.store_id", 3);
        assert_eq!(
            sql,
            " AND substr(so.order_date, 1, 10) BETWEEN $3 AND $4 AND so.store_id IN ($5, $6)"
        );
        assert_eq!(binds, vec!["2024-03-01", "2024-03-03", "1", "2"]);
        let (sql, binds) = ReportFilter::default().clause("x", "y", 1);
        assert!(sql.is_empty() && binds.is_empty());
    }

    #[tokio::test]
    async fn stats_totals_and_breakdowns() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let s = stats(&db, &march()).await.unwrap();
        assert_eq!(s.total_orders, 5);
        assert_eq!(s.total_stores, 2);
        // 100 + 50 + 40 + 20 + 80
        assert_eq!(s.total_revenue, 290.0);
        assert_eq!(s.avg_order_value, 58.0);
        assert_eq!(s.days_with_sales, 3);
        // Burger, Fries, Soda in window (Norte's Burger counts once).
        assert_eq!(s.total_products, 3);

        assert_eq!(s.payment_breakdown[0].payment_method, "cash");
        assert_eq!(s.payment_breakdown[0].order_count, 3);
        assert_eq!(s.payment_breakdown[0].total_amount, 200.0);

        assert_eq!(s.store_breakdown[0].store_name, "Centro");
        assert_eq!(s.store_breakdown[0].revenue, 210.0);
        let pct: f64 = s.store_breakdown.iter().map(|b| b.percentage).sum();
        assert!((pct - 100.0).abs() < 0.05);
    }

    #[tokio::test]
    async fn stats_on_empty_window_are_zero() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let f = ReportFilter::new(
            DateWindow::parse("2023-01-01", "2023-01-31").unwrap(),
            Vec::new(),
        );
        let s = stats(&db, &f).await.unwrap();
        assert_eq!(s.total_orders, 0);
        assert_eq!(s.total_revenue, 0.0);
        assert!(s.store_breakdown.is_empty());
    }

    #[tokio::test]
    async fn store_filter_narrows_results() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let f = ReportFilter::new(march().window.unwrap(), vec!["20004".into()]);
        let s = stats(&db, &f).await.unwrap();
        assert_eq!(s.total_orders, 1);
        assert_eq!(s.total_revenue, 80.0);
        assert_eq!(s.store_breakdown.len(), 1);
        assert_eq!(s.store_breakdown[0].percentage, 100.0);
    }

    #[tokio::test]
    async fn sales_summary_groups_cash_against_other_tenders() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let rows = sales_summary(&db, &march()).await.unwrap();
        assert_eq!(rows[0].date, "2024-03-03");
        let day2: Vec<_> = rows.iter().filter(|r| r.date == "2024-03-02").collect();
        // Norte cash 80 sorts ahead of Centro otros_medios 40.
        assert_eq!(day2.len(), 2);
        assert_eq!(day2[0].store_id, "20004");
        assert_eq!(day2[1].payment_method, "otros_medios");
        let day1_other = rows
            .iter()
            .find(|r| r.date == "2024-03-01" && r.payment_method == "otros_medios")
            .unwrap();
        assert_eq!(day1_other.total_amount, 50.0);
    }

    #[tokio::test]
    async fn top_products_rank_by_revenue_and_respect_limit() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let top = top_products(&db, &march(), None).await.unwrap();
        assert_eq!(top[0].name, "Burger");
        assert_eq!(top[0].store_id, "20003");
        assert_eq!(top[0].times_sold, 2);
        assert_eq!(top[0].total_quantity, 3.0);
        assert_eq!(top[0].total_revenue, 120.0);
        // The February burger order is outside the window.
        assert!(top.iter().all(|p| p.total_revenue < 400.0));

        let one = top_products(&db, &march(), Some(0)).await.unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn daily_sessions_and_store_summaries() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let days = daily_sales(&db, &march()).await.unwrap();
        assert_eq!(
            days.iter().map(|d| d.date.as_str()).collect::<Vec<_>>(),
            vec!["2024-03-03", "2024-03-02", "2024-03-01"]
        );
        assert_eq!(days[2].total_revenue, 150.0);

        let sessions = session_summary(&db, &march()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].order_count, 1);

        let stores = stores_summary(&db, &march()).await.unwrap();
        assert_eq!(stores.len(), 3);
        assert_eq!(stores[0].store_name, "Centro");
        assert_eq!(stores[0].total_orders, 4);
        assert_eq!(stores[0].total_products, 4);
        let sur = stores.iter().find(|s| s.store_id == "20005").unwrap();
        assert_eq!(sur.total_orders, 0);
        assert_eq!(sur.total_revenue, 0.0);

        assert_eq!(list_stores(&db).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn sales_patterns_bucket_by_weekday_and_hour() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let p = sales_patterns(&db, &march()).await.unwrap();

        // 2024-03-01 is a Friday, 03-02 a Saturday, 03-03 a Sunday.
        let days: Vec<(u32, &str, i64)> = p
            .day_of_week
            .iter()
            .map(|d| (d.day_number, d.day_name.as_str(), d.order_count))
            .collect();
        assert_eq!(days, vec![(0, "Domingo", 1), (5, "Viernes", 2), (6, "Sabado", 2)]);
        assert_eq!(p.day_of_week[1].total_revenue, 150.0);
        assert_eq!(p.day_of_week[1].avg_order_value, 75.0);

        // Seeded orders are all rung up at noon.
        assert_eq!(p.hourly.len(), 1);
        assert_eq!(p.hourly[0].hour, "12");
        assert_eq!(p.hourly[0].order_count, 5);
        assert_eq!(p.hourly[0].total_revenue, 290.0);

        let kinds: Vec<&str> = p.insights.iter().map(|i| i.kind.as_str()).collect();
        assert_eq!(kinds, vec!["performance", "timing", "product", "payment"]);
        assert!(p.insights[0].message.starts_with("Viernes"));
        // Soda sold 4 units, more than any burger line.
        assert!(p.insights[2].message.contains("Soda"));
        // 200 of 290 in cash.
        assert!(p.insights[3].message.starts_with("69.0%"));
        assert!(p.insights[3].recommendation.contains("balanceado"));
    }

    #[tokio::test]
    async fn sales_patterns_on_empty_window_have_no_insights() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let f = ReportFilter::new(
            DateWindow::parse("2023-01-01", "2023-01-31").unwrap(),
            Vec::new(),
        );
        let p = sales_patterns(&db, &f).await.unwrap();
        assert!(p.day_of_week.is_empty() && p.hourly.is_empty());
        assert!(p.insights.is_empty());
    }

    #[tokio::test]
    async fn sales_history_looks_back_thirty_days() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let h = sales_history(&db, &march()).await.unwrap();
        assert_eq!(h.window.from_day(), "2024-02-02");
        assert_eq!(h.window.to_day(), "2024-03-03");
        let dates: Vec<&str> = h.daily.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-02-20", "2024-03-01", "2024-03-02", "2024-03-03"]);
        assert_eq!(h.best_day.as_deref(), Some("2024-02-20"));
        assert_eq!(h.worst_day.as_deref(), Some("2024-03-03"));
        // (999 + 150 + 120 + 20) / 4
        assert_eq!(h.avg_daily_revenue, 322.25);
        assert_eq!(h.avg_daily_orders, 1.5);
        // First half averages 574.5, second half 70.
        assert_eq!(h.trend_pct, -87.82);

        let empty = sales_history(
            &db,
            &ReportFilter::new(DateWindow::parse("2023-01-31", "2023-01-31").unwrap(), Vec::new()),
        )
        .await
        .unwrap();
        assert!(empty.daily.is_empty() && empty.best_day.is_none());
        assert_eq!(empty.trend_pct, 0.0);
    }

    #[tokio::test]
    async fn context_snapshot_mentions_key_figures() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let text = context_snapshot(&db, &march()).await.unwrap();
        assert!(text.contains("Periodo: 2024-03-01 a 2024-03-03"));
        assert!(text.contains("5 ordenes"));
        assert!(text.contains("Burger"));
        assert!(text.contains("cash"));
        assert!(text.contains("Centro (20003)"));
    }
}
