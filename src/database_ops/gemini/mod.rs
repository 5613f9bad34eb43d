//! Chat over the synced sales data, and natural-language questions turned
//! into guarded read-only SQL.
pub mod analysis;
pub mod provider;
pub mod sql_guard;

pub use analysis::{Forecast, PredictedDay, SalesAnalysis, SalesForecast};
pub use provider::{GeminiClient, GeminiConfig, GeminiError, Generated};
pub use sql_guard::{guard_sql, SqlGuardError};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::any::AnyRow;
use sqlx::{Column, Row};
use std::fmt::Write as _;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::database_ops::reports::{self, ReportFilter};
use crate::util::db::{Backend, Db};
use crate::window::DateWindow;

const SUMMARY_COLUMNS: usize = 6;
const SUMMARY_ROWS: usize = 10;

pub const NOT_CONFIGURED_NOTE: &str = "AI no configurada";

const SCHEMA_HINT: &str = "\
Tablas permitidas:
- sale_orders so (store_id, linisco_id, shop_number, id_sale_order, id_customer, number, order_date, id_session, payment_method, total, discount)
- sale_products sp (store_id, linisco_id, id_sale_order, id_product, name, fixed_name, quantity, sale_price)
- stores s (store_id, store_name, email)
Relaciones: sp.store_id = so.store_id AND sp.id_sale_order = so.id_sale_order; s.store_id = so.store_id.
Ingreso de una orden = so.total - so.discount. Ingreso de un producto = sp.sale_price * sp.quantity.
order_date es texto ISO; para el dia usa substr(so.order_date, 1, 10).";

fn tabular_intent() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| {
        Regex::new(
            r"(?i)\b(sql|tabla|tabular|listad\w*|ranking|top|detalles?|desglose|por d[ií]a|por tienda|promedios?|sumas|agrupaci[oó]n)\b",
        )
        .expect("static regex")
    })
}

/// True when the question reads like it wants rows rather than prose.
pub fn wants_table(message: &str) -> bool {
    tabular_intent().is_match(message)
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub message: String,
    pub fallback: bool,
    pub model: Option<String>,
    /// SQL whose result was folded into the prompt, if any.
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NlQueryResult {
    pub success: bool,
    pub sql: Option<String>,
    pub rows: Vec<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NlQueryResult {
    fn failed(sql: Option<String>, error: impl ToString) -> Self {
        Self {
            success: false,
            sql,
            rows: Vec::new(),
            note: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AiStatus {
    pub configured: bool,
    pub has_key: bool,
    pub model: String,
    pub fallback_models: Vec<String>,
}

#[derive(Clone)]
pub struct ChatService {
    db: Db,
    client: GeminiClient,
}

impl ChatService {
    pub fn new(db: Db, client: GeminiClient) -> Self {
        Self { db, client }
    }

    pub fn status(&self) -> AiStatus {
        let cfg = self.client.config();
        AiStatus {
            configured: self.client.is_configured(),
            has_key: cfg.api_key.is_some(),
            model: cfg.model.clone(),
            fallback_models: cfg.fallback_models.clone(),
        }
    }

    #[tracing::instrument(skip(self, message, window), fields(window = %window))]
    pub async fn chat(
        &self,
        message: &str,
        window: &DateWindow,
        store_id: Option<&str>,
    ) -> Result<ChatReply> {
        if !self.client.is_configured() {
            return Ok(canned_reply(message));
        }
        let filter = filter_for(window, store_id);
        let context = reports::context_snapshot(&self.db, &filter).await?;

        let mut sql_used = None;
        let mut table = String::new();
        if wants_table(message) {
            let nl = self.natural_language_query(message, window, store_id).await?;
            if nl.success && !nl.rows.is_empty() {
                table = summarize_rows(&nl.rows);
                sql_used = nl.sql;
            }
        }

        let mut prompt = String::from(
            "Sos un analista de ventas de una cadena de locales gastronomicos. \
             Responde en espanol, breve y con cifras concretas. \
             Usa solo los datos provistos.\n\n",
        );
        let _ = writeln!(prompt, "Datos:\n{context}");
        if !table.is_empty() {
            let _ = writeln!(prompt, "Resultado de consulta:\n{table}");
        }
        let _ = writeln!(prompt, "Pregunta: {message}");

        match self.client.generate(&prompt).await {
            Ok(Generated { text, model }) => Ok(ChatReply {
                message: text.trim().to_string(),
                fallback: false,
                model: Some(model),
                sql: sql_used,
            }),
            Err(e) => {
                warn!(error = %e, "gemini chat failed; answering with fallback");
                Ok(canned_reply(message))
            }
        }
    }

    /// Ask the model for one SELECT, guard it, run it read-only.
    /// Model and guard failures come back as `success = false`; only
    /// database trouble outside the query itself is an `Err`.
    #[tracing::instrument(skip(self, message, window), fields(window = %window))]
    pub async fn natural_language_query(
        &self,
        message: &str,
        window: &DateWindow,
        store_id: Option<&str>,
    ) -> Result<NlQueryResult> {
        if !self.client.is_configured() {
            return Ok(NlQueryResult {
                success: true,
                sql: None,
                rows: Vec::new(),
                note: Some(NOT_CONFIGURED_NOTE.to_string()),
                error: None,
            });
        }
        let prompt = sql_prompt(message, window, store_id);
        let generated = match self.client.generate(&prompt).await {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "gemini sql generation failed");
                return Ok(NlQueryResult::failed(None, e));
            }
        };
        let sql = match guard_sql(&generated.text, window, store_id) {
            Ok(sql) => sql,
            Err(e) => {
                warn!(error = %e, "rejected generated sql");
                return Ok(NlQueryResult::failed(Some(generated.text), e));
            }
        };
        match run_read_only(&self.db, &sql).await {
            Ok(rows) => {
                info!(rows = rows.len(), model = %generated.model, "nl query answered");
                Ok(NlQueryResult {
                    success: true,
                    sql: Some(sql),
                    rows,
                    note: None,
                    error: None,
                })
            }
            Err(e) => {
                warn!(error = %e, "generated sql failed to run");
                Ok(NlQueryResult::failed(Some(sql), format!("{e:#}")))
            }
        }
    }
}

fn filter_for(window: &DateWindow, store_id: Option<&str>) -> ReportFilter {
    ReportFilter::new(*window, store_id.map(|s| vec![s.to_string()]).unwrap_or_default())
}

fn canned_reply(message: &str) -> ChatReply {
    ChatReply {
        message: format!(
            "Entiendo tu consulta: \"{}\". Para respuestas con analisis, configura una API key de Gemini (GEMINI_API_KEY).",
            message.trim()
        ),
        fallback: true,
        model: None,
        sql: None,
    }
}

fn sql_prompt(message: &str, window: &DateWindow, store_id: Option<&str>) -> String {
    let mut p = String::from(
        "Genera UNA sola consulta SQL SELECT (sin comentarios ni punto y coma) que responda la pregunta.\n",
    );
    let _ = writeln!(p, "{SCHEMA_HINT}");
    let _ = writeln!(
        p,
        "Filtra por substr(so.order_date, 1, 10) BETWEEN '{}' AND '{}'.",
        window.from_day(),
        window.to_day()
    );
    if let Some(s) = store_id {
        let _ = writeln!(p, "Filtra por so.store_id = '{s}'.");
    }
    let _ = writeln!(p, "Devuelve solo el SQL.\nPregunta: {message}");
    p
}

async fn run_read_only(db: &Db, sql: &str) -> Result<Vec<Map<String, Value>>> {
    let mut tx = db.pool.begin().await.context("begin read-only tx")?;
    if db.backend == Backend::Postgres {
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
    }
    let rows = sqlx::query(sql)
        .fetch_all(&mut *tx)
        .await
        .context("generated query failed")?;
    tx.rollback().await?;
    Ok(rows.iter().map(row_to_json).collect())
}

/// Column-by-column best effort: integer, float, text, bool, else null.
pub(crate) fn row_to_json(row: &AnyRow) -> Map<String, Value> {
    let mut out = Map::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        out.insert(col.name().to_string(), value);
    }
    out
}

/// `col=val, ...` lines, capped in width and height.
pub fn summarize_rows(rows: &[Map<String, Value>]) -> String {
    let mut out = String::new();
    for row in rows.iter().take(SUMMARY_ROWS) {
        let line = row
            .iter()
            .take(SUMMARY_COLUMNS)
            .map(|(k, v)| match v {
                Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "- {line}");
    }
    if rows.len() > SUMMARY_ROWS {
        let _ = writeln!(out, "(+{} filas)", rows.len() - SUMMARY_ROWS);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::reports::seed::{march, seed};
    use crate::util::db::test_support::sqlite_db;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base: &str, key: Option<&str>) -> GeminiClient {
        GeminiClient::new(GeminiConfig {
            api_key: key.map(str::to_string),
            base_url: base.to_string(),
            model: "m".into(),
            fallback_models: Vec::new(),
            timeout_secs: 5,
            ..GeminiConfig::default()
        })
        .unwrap()
    }

    fn answer(text: &str) -> serde_json::Value {
        json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
    }

    #[test]
    fn detects_tabular_intent() {
        assert!(wants_table("dame el top 5 de productos"));
        assert!(wants_table("ventas POR DÍA de marzo"));
        assert!(wants_table("un listado por tienda"));
        assert!(!wants_table("como vienen las ventas?"));
    }

    #[test]
    fn summary_caps_rows_and_columns() {
        let rows: Vec<Map<String, Value>> = (0..12)
            .map(|i| {
                let mut m = Map::new();
                for c in 0..8 {
                    m.insert(format!("c{c}"), json!(i));
                }
                m
            })
            .collect();
        let s = summarize_rows(&rows);
        assert_eq!(s.lines().count(), 11);
        assert!(s.lines().next().unwrap().contains("c5=0"));
        assert!(!s.contains("c6="));
        assert!(s.ends_with("(+2 filas)\n"));
    }

    #[tokio::test]
    async fn unconfigured_answers_with_fallbacks() {
        let (db, _dir) = sqlite_db().await;
        let svc = ChatService::new(db, client("http://127.0.0.1:9", None));
        let w = march().window.unwrap();

        let reply = svc.chat("hola", &w, None).await.unwrap();
        assert!(reply.fallback);
        assert!(reply.message.contains("Gemini"));

        let nl = svc.natural_language_query("top", &w, None).await.unwrap();
        assert!(nl.success);
        assert!(nl.sql.is_none());
        assert_eq!(nl.note.as_deref(), Some(NOT_CONFIGURED_NOTE));
        assert!(!svc.status().configured);
    }

    #[tokio::test]
    async fn nl_query_runs_guarded_sql() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/m:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer(
                "```sql\nSELECT so.payment_method AS method, COUNT(*) AS n, SUM(so.total - so.discount) AS revenue FROM sale_orders so GROUP BY so.payment_method ORDER BY revenue DESC;\n```",
            )))
            .mount(&server)
            .await;
        let svc = ChatService::new(db, client(&server.uri(), Some("k")));
        let w = march().window.unwrap();

        let nl = svc
            .natural_language_query("desglose por medio de pago", &w, Some("20003"))
            .await
            .unwrap();
        assert!(nl.success, "{:?}", nl.error);
        let sql = nl.sql.unwrap();
        assert!(sql.contains("so.store_id = '20003'"));
        assert!(sql.ends_with("LIMIT 100"));
        // Centro in March: cash 100 + 20, card 50, debit 40; the February order is excluded.
        assert_eq!(nl.rows.len(), 3);
        assert_eq!(nl.rows[0]["method"], json!("cash"));
        assert_eq!(nl.rows[0]["n"], json!(2));
        assert_eq!(nl.rows[0]["revenue"], json!(120.0));
    }

    #[tokio::test]
    async fn nl_query_reports_rejected_sql() {
        let (db, _dir) = sqlite_db().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer("DELETE FROM stores")))
            .mount(&server)
            .await;
        let svc = ChatService::new(db, client(&server.uri(), Some("k")));
        let nl = svc
            .natural_language_query("borra todo", &march().window.unwrap(), None)
            .await
            .unwrap();
        assert!(!nl.success);
        assert!(nl.rows.is_empty());
        assert!(nl.error.unwrap().contains("SELECT"));
    }

    #[tokio::test]
    async fn chat_uses_model_reply_and_falls_back_on_error() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/m:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer("Vendiste $290.")))
            .mount(&server)
            .await;
        let svc = ChatService::new(db.clone(), client(&server.uri(), Some("k")));
        let w = march().window.unwrap();
        let reply = svc.chat("como fue marzo?", &w, None).await.unwrap();
        assert!(!reply.fallback);
        assert_eq!(reply.message, "Vendiste $290.");
        assert_eq!(reply.model.as_deref(), Some("m"));

        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;
        let svc = ChatService::new(db, client(&down.uri(), Some("k")));
        let reply = svc.chat("como fue marzo?", &w, None).await.unwrap();
        assert!(reply.fallback);
    }
}
