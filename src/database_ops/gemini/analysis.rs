//! Written sales analysis and a 7-day forecast. Both answer from the local
//! data alone when the model is missing or failing.
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::OnceLock;
use tracing::{info, warn};

use super::{filter_for, ChatService, Generated};
use crate::database_ops::reports::{self, SalesHistory, SalesPatterns, Stats, TopProduct};
use crate::window::{DateWindow, DATE_FORMAT};

pub const FORECAST_DAYS: i64 = 7;
const BASELINE_CONFIDENCE: f64 = 0.3;
/// Trend below this percentage is flagged as a risk in the baseline forecast.
const DECLINE_RISK_PCT: f64 = -10.0;
const CONFIGURE_HINT: &str = "Para analisis avanzados, configura una API key de Gemini (GEMINI_API_KEY).";

#[derive(Debug, Clone, Serialize)]
pub struct SalesAnalysis {
    pub analysis: String,
    pub fallback: bool,
    pub model: Option<String>,
    pub stats: Stats,
    pub patterns: SalesPatterns,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictedDay {
    pub date: String,
    #[serde(default)]
    pub predicted_revenue: f64,
    #[serde(default)]
    pub predicted_orders: f64,
    #[serde(default)]
    pub confidence: f64,
}

/// Shape the model is asked to answer in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Forecast {
    #[serde(default)]
    pub predictions: Vec<PredictedDay>,
    #[serde(default)]
    pub trend_analysis: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SalesForecast {
    #[serde(flatten)]
    pub forecast: Forecast,
    pub fallback: bool,
    pub model: Option<String>,
    pub history: SalesHistory,
    pub generated_at: DateTime<Utc>,
}

impl ChatService {
    #[tracing::instrument(skip(self, window), fields(window = %window))]
    pub async fn analyze(&self, window: &DateWindow, store_id: Option<&str>) -> Result<SalesAnalysis> {
        let filter = filter_for(window, store_id);
        let stats = reports::stats(&self.db, &filter).await?;
        let patterns = reports::sales_patterns(&self.db, &filter).await?;

        let generated = if self.client.is_configured() {
            let top = reports::top_products(&self.db, &filter, Some(5)).await?;
            match self.client.generate(&analysis_prompt(window, &stats, &top)).await {
                Ok(g) => Some(g),
                Err(e) => {
                    warn!(error = %e, "gemini analysis failed; using basic analysis");
                    None
                }
            }
        } else {
            None
        };
        let (analysis, model) = match generated {
            Some(Generated { text, model }) => (text.trim().to_string(), Some(model)),
            None => (basic_analysis(window, &patterns), None),
        };
        Ok(SalesAnalysis {
            analysis,
            fallback: model.is_none(),
            model,
            stats,
            patterns,
            generated_at: Utc::now(),
        })
    }

    #[tracing::instrument(skip(self, window), fields(window = %window))]
    pub async fn predict(&self, window: &DateWindow, store_id: Option<&str>) -> Result<SalesForecast> {
        let history = reports::sales_history(&self.db, &filter_for(window, store_id)).await?;

        let generated = if self.client.is_configured() {
            match self.client.generate(&forecast_prompt(&history)).await {
                Ok(g) => Some(g),
                Err(e) => {
                    warn!(error = %e, "gemini forecast failed; using baseline");
                    None
                }
            }
        } else {
            None
        };
        let (forecast, model) = match generated {
            Some(Generated { text, model }) => (parse_forecast(&text), Some(model)),
            None => (baseline_forecast(&history), None),
        };
        info!(
            days = forecast.predictions.len(),
            fallback = model.is_none(),
            "forecast ready"
        );
        Ok(SalesForecast {
            forecast,
            fallback: model.is_none(),
            model,
            history,
            generated_at: Utc::now(),
        })
    }
}

fn analysis_prompt(window: &DateWindow, stats: &Stats, top: &[TopProduct]) -> String {
    let mut p = String::from("Analiza los siguientes datos de ventas y da insights concretos.\n\n");
    let _ = writeln!(p, "Periodo: {} a {}", window.from_day(), window.to_day());
    let _ = writeln!(
        p,
        "Ordenes: {}; ingresos: ${:.2}; ticket promedio: ${:.2}; tiendas activas: {}",
        stats.total_orders, stats.total_revenue, stats.avg_order_value, stats.total_stores
    );
    if !top.is_empty() {
        let _ = writeln!(p, "Productos mas vendidos:");
        for (i, t) in top.iter().enumerate() {
            let _ = writeln!(
                p,
                "{}. {} - {} unidades - ${:.2}",
                i + 1,
                t.name,
                t.total_quantity,
                t.total_revenue
            );
        }
    }
    if !stats.payment_breakdown.is_empty() {
        let _ = writeln!(p, "Medios de pago:");
        for m in &stats.payment_breakdown {
            let _ = writeln!(
                p,
                "- {}: {:.1}% ({} ordenes)",
                m.payment_method, m.percentage, m.order_count
            );
        }
    }
    p.push_str(
        "\nIncluye 3 insights clave, 2 recomendaciones especificas, 1 prediccion para la \
         proxima semana y los patrones importantes. Responde en espanol, claro y accionable.",
    );
    p
}

fn basic_analysis(window: &DateWindow, patterns: &SalesPatterns) -> String {
    let mut out = format!(
        "Analisis basico para el periodo {} a {}.\n",
        window.from_day(),
        window.to_day()
    );
    if patterns.insights.is_empty() {
        out.push_str("No hay ventas registradas en el periodo.\n");
    }
    for i in &patterns.insights {
        let _ = writeln!(out, "- {}: {}. {}", i.title, i.message, i.recommendation);
    }
    let _ = write!(out, "\n{CONFIGURE_HINT}");
    out
}

fn forecast_prompt(history: &SalesHistory) -> String {
    let mut p = format!(
        "Basandote en estos datos historicos de ventas, genera predicciones para los proximos {FORECAST_DAYS} dias.\n\n"
    );
    let _ = writeln!(
        p,
        "Datos historicos ({} a {}):",
        history.window.from_day(),
        history.window.to_day()
    );
    for d in &history.daily {
        let _ = writeln!(p, "{}: {} ordenes, ${:.2}", d.date, d.order_count, d.total_revenue);
    }
    let _ = writeln!(
        p,
        "Mejor dia: {}; peor dia: {}; tendencia: {:+.1}%",
        history.best_day.as_deref().unwrap_or("N/A"),
        history.worst_day.as_deref().unwrap_or("N/A"),
        history.trend_pct
    );
    p.push_str(
        "\nResponde solo con JSON de la forma {\"predictions\": [{\"date\": \"YYYY-MM-DD\", \
         \"predicted_revenue\": 0, \"predicted_orders\": 0, \"confidence\": 0}], \
         \"trend_analysis\": \"texto\", \"recommendations\": [\"...\"], \"risk_factors\": [\"...\"]}",
    );
    p
}

fn json_block() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("static regex"))
}

/// First `{...}` block of the reply as a `Forecast`; prose replies land in
/// `trend_analysis`.
pub fn parse_forecast(text: &str) -> Forecast {
    if let Some(m) = json_block().find(text) {
        match serde_json::from_str::<Forecast>(m.as_str()) {
            Ok(f) => return f,
            Err(e) => warn!(error = %e, "forecast reply is not the expected JSON"),
        }
    }
    Forecast {
        trend_analysis: text.trim().to_string(),
        ..Forecast::default()
    }
}

/// Flat forecast at the historical daily average.
pub fn baseline_forecast(history: &SalesHistory) -> Forecast {
    let predictions = if history.daily.is_empty() {
        Vec::new()
    } else {
        (1..=FORECAST_DAYS)
            .map(|i| PredictedDay {
                date: (history.window.to + Duration::days(i))
                    .format(DATE_FORMAT)
                    .to_string(),
                predicted_revenue: history.avg_daily_revenue,
                predicted_orders: history.avg_daily_orders,
                confidence: BASELINE_CONFIDENCE,
            })
            .collect()
    };
    let mut risk_factors = Vec::new();
    if history.trend_pct < DECLINE_RISK_PCT {
        risk_factors.push(format!(
            "Ventas en baja: {:+.1}% frente a la primera mitad del periodo",
            history.trend_pct
        ));
    }
    Forecast {
        predictions,
        trend_analysis: format!(
            "Tendencia {:+.1}%. Mejor dia: {}; peor dia: {}. Para predicciones avanzadas, configura una API key de Gemini.",
            history.trend_pct,
            history.best_day.as_deref().unwrap_or("N/A"),
            history.worst_day.as_deref().unwrap_or("N/A"),
        ),
        recommendations: vec!["Configura la API de Gemini para analisis mas precisos".to_string()],
        risk_factors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::gemini::{GeminiClient, GeminiConfig};
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

    async fn replying(text: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/m:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": text}]}}]
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn analysis_without_key_summarizes_patterns() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let svc = ChatService::new(db, client("http://127.0.0.1:9", None));
        let a = svc.analyze(&march().window.unwrap(), None).await.unwrap();
        assert!(a.fallback);
        assert!(a.model.is_none());
        assert!(a.analysis.starts_with("Analisis basico para el periodo 2024-03-01 a 2024-03-03"));
        assert!(a.analysis.contains("Viernes"));
        assert!(a.analysis.contains("GEMINI_API_KEY"));
        assert_eq!(a.stats.total_orders, 5);
        assert_eq!(a.patterns.insights.len(), 4);
    }

    #[tokio::test]
    async fn analysis_uses_model_text_for_one_store() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let server = replying("  Norte vendio $80.  ").await;
        let svc = ChatService::new(db, client(&server.uri(), Some("k")));
        let a = svc
            .analyze(&march().window.unwrap(), Some("20004"))
            .await
            .unwrap();
        assert!(!a.fallback);
        assert_eq!(a.model.as_deref(), Some("m"));
        assert_eq!(a.analysis, "Norte vendio $80.");
        assert_eq!(a.stats.total_orders, 1);
    }

    #[tokio::test]
    async fn baseline_forecast_without_key() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let svc = ChatService::new(db, client("http://127.0.0.1:9", None));
        let f = svc.predict(&march().window.unwrap(), None).await.unwrap();
        assert!(f.fallback);
        assert_eq!(f.forecast.predictions.len(), 7);
        assert_eq!(f.forecast.predictions[0].date, "2024-03-04");
        assert_eq!(f.forecast.predictions[6].date, "2024-03-10");
        assert_eq!(f.forecast.predictions[0].predicted_revenue, 322.25);
        assert_eq!(f.forecast.predictions[0].confidence, BASELINE_CONFIDENCE);
        assert_eq!(f.history.best_day.as_deref(), Some("2024-02-20"));
        // Revenue fell sharply between the two halves.
        assert_eq!(f.forecast.risk_factors.len(), 1);
        assert!(f.forecast.trend_analysis.starts_with("Tendencia -87.8%"));
    }

    #[tokio::test]
    async fn model_forecast_json_is_parsed_from_the_reply() {
        let (db, _dir) = sqlite_db().await;
        seed(&db).await;
        let server = replying(
            "Aqui va:\n```json\n{\"predictions\": [{\"date\": \"2024-03-04\", \"predicted_revenue\": 100, \"predicted_orders\": 3, \"confidence\": 0.7}], \"trend_analysis\": \"estable\", \"recommendations\": [\"abrir temprano\"], \"risk_factors\": []}\n```",
        )
        .await;
        let svc = ChatService::new(db, client(&server.uri(), Some("k")));
        let f = svc.predict(&march().window.unwrap(), None).await.unwrap();
        assert!(!f.fallback);
        assert_eq!(
            f.forecast.predictions,
            vec![PredictedDay {
                date: "2024-03-04".into(),
                predicted_revenue: 100.0,
                predicted_orders: 3.0,
                confidence: 0.7,
            }]
        );
        assert_eq!(f.forecast.trend_analysis, "estable");
        assert_eq!(f.forecast.recommendations, vec!["abrir temprano"]);
    }

    #[test]
    fn prose_forecast_lands_in_trend_analysis() {
        let f = parse_forecast(" Las ventas se mantendran estables. ");
        assert!(f.predictions.is_empty());
        assert_eq!(f.trend_analysis, "Las ventas se mantendran estables.");

        let f = parse_forecast("{ no es json }");
        assert_eq!(f.trend_analysis, "{ no es json }");
    }
}
