use anyhow::Result;
use std::fmt::Write as _;

use crate::cli::reports::render;
use crate::database_ops::gemini::{ChatService, Forecast, GeminiClient};
use crate::util::db::Db;
use crate::window::DateWindow;

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub message: String,
    pub window: DateWindow,
    pub store_id: Option<String>,
    /// Only generate and run SQL; skip the prose answer.
    pub sql_only: bool,
    pub json: bool,
}

pub async fn run(db: Db, cfg: ChatConfig) -> Result<()> {
    let service = ChatService::new(db, GeminiClient::from_env()?);
    let store = cfg.store_id.as_deref();

    if cfg.sql_only {
        let result = service
            .natural_language_query(&cfg.message, &cfg.window, store)
            .await?;
        if cfg.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }
        if let Some(sql) = &result.sql {
            println!("{sql}\n");
        }
        if let Some(note) = &result.note {
            println!("{note}");
        }
        if let Some(err) = &result.error {
            anyhow::bail!("query failed: {err}");
        }
        print!("{}", render(&serde_json::to_value(&result.rows)?));
        return Ok(());
    }

    let reply = service.chat(&cfg.message, &cfg.window, store).await?;
    if cfg.json {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    } else {
        println!("{}", reply.message);
        if let Some(model) = &reply.model {
            tracing::debug!(model = %model, sql = ?reply.sql, "chat answered");
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum InsightKind {
    Analysis,
    Predictions,
}

#[derive(Debug, Clone)]
pub struct InsightConfig {
    pub kind: InsightKind,
    pub window: DateWindow,
    pub store_id: Option<String>,
    pub json: bool,
}

pub async fn run_insights(db: Db, cfg: InsightConfig) -> Result<()> {
    let service = ChatService::new(db, GeminiClient::from_env()?);
    let store = cfg.store_id.as_deref();
    match cfg.kind {
        InsightKind::Analysis => {
            let analysis = service.analyze(&cfg.window, store).await?;
            if cfg.json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                println!("{}", analysis.analysis);
            }
        }
        InsightKind::Predictions => {
            let forecast = service.predict(&cfg.window, store).await?;
            if cfg.json {
                println!("{}", serde_json::to_string_pretty(&forecast)?);
            } else {
                print!("{}", render_forecast(&forecast.forecast)?);
            }
        }
    }
    Ok(())
}

pub fn render_forecast(f: &Forecast) -> Result<String> {
    let mut out = render(&serde_json::to_value(&f.predictions)?);
    if !f.trend_analysis.is_empty() {
        let _ = writeln!(out, "\n{}", f.trend_analysis);
    }
    for (title, items) in [
        ("Recomendaciones", &f.recommendations),
        ("Riesgos", &f.risk_factors),
    ] {
        if !items.is_empty() {
            let _ = writeln!(out, "\n{title}:");
            for item in items {
                let _ = writeln!(out, "- {item}");
            }
        }
    }
    Ok(out)
}
