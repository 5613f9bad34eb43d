// HTTP API server binary for linisco-sync

use anyhow::Result;
use linisco_sync::api::ApiServer;
use linisco_sync::util::db::Db;
use linisco_sync::util::env as env_util;

#[actix_web::main]
async fn main() -> Result<()> {
    // Load dotenv/env once (safe to call multiple times)
    env_util::init_env();
    linisco_sync::tracing::init_tracing(linisco_sync::tracing::DEFAULT_FILTER)?;

    tracing::info!("Initializing linisco-sync API server");
    env_util::preflight_check(
        "api_server",
        &[],
        &[
            "DATABASE_URL",
            "DATABASE_PATH",
            "API_HOST",
            "API_PORT",
            "API_SECRET",
            "LINISCO_API_URL",
            "GEMINI_API_KEY",
            "GEMINI_MODEL",
            "SYNC_INTERVAL_MINUTES",
        ],
    )?;

    // Load configuration from environment
    let server = ApiServer::from_env()?;

    // Initialize database connection
    let database_url = env_util::db_url();
    let max_connections: u32 = env_util::env_parse("DB_MAX_CONNS", 10u32);
    let db = Db::connect(&database_url, max_connections).await?;

    tracing::info!("Database connected successfully");

    // Start HTTP server
    server.run(db).await?;

    Ok(())
}
