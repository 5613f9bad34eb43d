// API server implementation using actix-web

use crate::api::handlers::{AppState, SharedSync};
use crate::api::{auth, middleware, routes};
use crate::database_ops::gemini::{ChatService, GeminiClient};
use crate::database_ops::linisco::{spawn_periodic_sync, LiniscoProvider, PosSource, SyncService};
use crate::stores::StoreRegistry;
use crate::util::db::Db;
use crate::util::env as env_util;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub api_secret: Option<String>,
    pub allowed_origins: String,
    /// 0 disables the background sync loop.
    pub sync_interval_minutes: u64,
    pub sync_lookback_days: u32,
}

impl ApiServer {
    /// Create server from environment variables
    pub fn from_env() -> Result<Self> {
        env_util::init_env();

        let host = env_util::env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env_util::env_opt("API_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse()
            .context("Invalid API_PORT")?;

        let api_secret = env_util::env_opt("API_SECRET");
        if api_secret.is_none() {
            tracing::warn!("API_SECRET is not set; /api/v1 is open to anyone who can reach it");
        }

        let allowed_origins = env_util::env_opt("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://localhost:8080".to_string());

        Ok(Self {
            host,
            port,
            api_secret,
            allowed_origins,
            sync_interval_minutes: env_util::env_parse("SYNC_INTERVAL_MINUTES", 0u64),
            sync_lookback_days: env_util::env_parse("SYNC_LOOKBACK_DAYS", 1u32),
        })
    }

    /// Wire the shared state: store registry, upstream client, chat client.
    pub async fn build_state(db: Db) -> Result<web::Data<AppState>> {
        let stores = StoreRegistry::load().context("load store configuration")?;
        let source: Arc<dyn PosSource> = Arc::new(LiniscoProvider::from_env()?);
        let sync: SharedSync = Arc::new(SyncService::new(db.clone(), source, stores));
        sync.initialize_stores().await?;
        let chat = ChatService::new(db.clone(), GeminiClient::from_env()?);
        Ok(web::Data::new(AppState {
            db,
            sync,
            chat,
            started: Instant::now(),
        }))
    }

    /// Start the HTTP server
    pub async fn run(self, db: Db) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);

        tracing::info!(
            host = %self.host,
            port = %self.port,
            backend = %db.backend,
            "Starting linisco-sync API server"
        );

        let state = Self::build_state(db).await?;
        let periodic = (self.sync_interval_minutes > 0).then(|| {
            spawn_periodic_sync(
                state.sync.clone(),
                Duration::from_secs(self.sync_interval_minutes * 60),
                self.sync_lookback_days,
            )
        });

        let api_secret = self.api_secret.clone();
        let allowed_origins = self.allowed_origins.clone();

        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);
            let auth = auth::Auth::new(api_secret.clone());

            App::new()
                .app_data(state.clone())
                .app_data(web::JsonConfig::default().limit(64 * 1024))
                .wrap(auth)
                .wrap(cors)
                .wrap(compress)
                .wrap(logger)
                .configure(routes::configure_routes)
        })
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind to {}", bind_addr))?
        .run()
        .await
        .context("HTTP server error")?;

        if let Some(handle) = periodic {
            handle.abort();
        }
        Ok(())
    }
}
