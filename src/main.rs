use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use linisco_sync::cli::{self, chat, reports, sync};
use linisco_sync::database_ops::export::ExportKind;
use linisco_sync::database_ops::reports::ReportFilter;
use linisco_sync::util::env as env_util;
use linisco_sync::window::DateWindow;

/// Default report window for `query`, `stores summary`, `export` and `chat`.
const REPORT_DAYS: u32 = 7;

#[derive(Parser, Debug)]
#[command(name = "linisco", version, about = "Linisco POS multi-store sync and reports")]
struct Cli {
    /// Database URL; defaults to DATABASE_URL / DATABASE_PATH
    #[arg(long, global = true)]
    db_url: Option<String>,
    /// Print JSON instead of text
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct Range {
    /// First day, YYYY-MM-DD
    from: Option<String>,
    /// Last day, YYYY-MM-DD (defaults to `from`)
    to: Option<String>,
}

impl Range {
    fn window(&self, default: DateWindow) -> Result<DateWindow> {
        cli::window_args(self.from.as_deref(), self.to.as_deref(), default)
    }
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Sync every configured store (default: yesterday)
    Sync {
        #[command(flatten)]
        range: Range,
    },
    /// Sync one store by id
    SyncStore {
        store_id: String,
        #[command(flatten)]
        range: Range,
    },
    /// Configured stores
    Stores {
        #[command(subcommand)]
        command: StoresCommand,
    },
    /// Run a report over the synced data
    Query {
        #[arg(value_enum)]
        report: reports::ReportKind,
        #[command(flatten)]
        range: Range,
        /// Restrict to these store ids (repeatable or comma-separated)
        #[arg(long = "store", value_delimiter = ',')]
        stores: Vec<String>,
        /// Row cap for ranked reports
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Write orders, products or sessions to CSV
    Export {
        #[arg(value_enum)]
        kind: ExportKind,
        #[command(flatten)]
        range: Range,
        #[arg(long = "store", value_delimiter = ',')]
        stores: Vec<String>,
        /// Output directory (default EXPORT_DIR or ./exports)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// File name inside the output directory
        #[arg(long)]
        file: Option<String>,
    },
    /// Ask a question about the sales data
    Chat {
        message: String,
        #[command(flatten)]
        range: Range,
        #[arg(long)]
        store: Option<String>,
        /// Show the generated SQL and its rows instead of a prose answer
        #[arg(long, default_value_t = false)]
        sql: bool,
    },
    /// Written analysis or a 7-day forecast of the window
    Insights {
        #[arg(value_enum)]
        kind: chat::InsightKind,
        #[command(flatten)]
        range: Range,
        #[arg(long)]
        store: Option<String>,
    },
    /// Apply pending schema migrations
    Migrate,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum StoresCommand {
    /// List configured stores (no credentials)
    List,
    /// Orders, products and revenue per store
    Summary {
        #[command(flatten)]
        range: Range,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    linisco_sync::tracing::init_tracing(linisco_sync::tracing::DEFAULT_FILTER)?;

    let args = Cli::parse();
    let db_url = args.db_url.as_deref();
    let json = args.json;
    let report_default = DateWindow::last_days(REPORT_DAYS);

    match args.command {
        Commands::Sync { range } => {
            let window = range.window(DateWindow::yesterday())?;
            let db = cli::connect(db_url).await?;
            sync::run(db, sync::SyncConfig { window, store_id: None, json }).await?;
        }
        Commands::SyncStore { store_id, range } => {
            let window = range.window(DateWindow::yesterday())?;
            let db = cli::connect(db_url).await?;
            sync::run(
                db,
                sync::SyncConfig {
                    window,
                    store_id: Some(store_id),
                    json,
                },
            )
            .await?;
        }
        Commands::Stores { command } => match command {
            StoresCommand::List => reports::list_stores(json)?,
            StoresCommand::Summary { range } => {
                let filter = ReportFilter::new(range.window(report_default)?, Vec::new());
                let db = cli::connect(db_url).await?;
                reports::stores_summary(&db, &filter, json).await?;
            }
        },
        Commands::Query {
            report,
            range,
            stores,
            limit,
        } => {
            let filter = ReportFilter::new(range.window(report_default)?, stores);
            let db = cli::connect(db_url).await?;
            reports::run_query(
                &db,
                reports::QueryConfig {
                    kind: report,
                    filter,
                    limit,
                    json,
                },
            )
            .await?;
        }
        Commands::Export {
            kind,
            range,
            stores,
            dir,
            file,
        } => {
            let filter = ReportFilter::new(range.window(report_default)?, stores);
            let db = cli::connect(db_url).await?;
            reports::run_export(
                &db,
                reports::ExportConfig {
                    kind,
                    filter,
                    dir,
                    file,
                },
            )
            .await?;
        }
        Commands::Chat {
            message,
            range,
            store,
            sql,
        } => {
            let window = range.window(report_default)?;
            let db = cli::connect(db_url).await?;
            chat::run(
                db,
                chat::ChatConfig {
                    message,
                    window,
                    store_id: store,
                    sql_only: sql,
                    json,
                },
            )
            .await?;
        }
        Commands::Insights { kind, range, store } => {
            let window = range.window(report_default)?;
            let db = cli::connect(db_url).await?;
            chat::run_insights(
                db,
                chat::InsightConfig {
                    kind,
                    window,
                    store_id: store,
                    json,
                },
            )
            .await?;
        }
        Commands::Migrate => {
            let url = db_url.map(str::to_string).unwrap_or_else(env_util::db_url);
            let db = linisco_sync::util::db::Db::connect_no_migrate(&url, 1).await?;
            db.run_migrations().await?;
            info!(backend = %db.backend, "migrations applied");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_kebab_case_subcommands() {
        let cli = Cli::try_parse_from([
            "linisco", "query", "top-products", "2024-03-01", "2024-03-07", "--limit", "5",
            "--store", "20003,20004",
        ])
        .unwrap();
        match cli.command {
            Commands::Query { report, range, stores, limit } => {
                assert_eq!(report, reports::ReportKind::TopProducts);
                assert_eq!(range.from.as_deref(), Some("2024-03-01"));
                assert_eq!(stores, vec!["20003", "20004"]);
                assert_eq!(limit, Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::try_parse_from([
            "linisco", "insights", "predictions", "2024-03-01", "--store", "20003",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Insights { kind: chat::InsightKind::Predictions, ref store, .. }
                if store.as_deref() == Some("20003")
        ));

        let cli = Cli::try_parse_from(["linisco", "sync-store", "20003", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::SyncStore { ref store_id, .. } if store_id == "20003"));
    }
}
