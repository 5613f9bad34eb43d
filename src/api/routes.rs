// API route configuration

use crate::api::handlers::{self, ApiError};
use actix_web::web;

/// Required JSON bodies that fail to parse answer 400 in the usual envelope.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| ApiError::BadRequest(format!("invalid request body: {err}")).into())
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check (no auth required)
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        // API v1 routes (all require authentication)
        .service(
            web::scope("/api/v1")
                .app_data(json_config())
                // Sync control; `/sync/log` must be registered before `/sync/{store_id}`
                .route("/sync", web::post().to(handlers::trigger_sync))
                .route("/sync/log", web::get().to(handlers::sync_log))
                .route("/sync/{store_id}", web::post().to(handlers::trigger_store_sync))
                // Stores
                .route("/stores", web::get().to(handlers::list_stores))
                .route("/stores/summary", web::get().to(handlers::stores_summary))
                // Reports
                .route("/stats", web::get().to(handlers::get_stats))
                .route("/stats", web::post().to(handlers::post_stats))
                .route("/sales-summary", web::get().to(handlers::sales_summary))
                .route("/top-products", web::get().to(handlers::top_products))
                .route("/daily-sales", web::get().to(handlers::daily_sales))
                .route("/payment-methods", web::get().to(handlers::payment_methods))
                .route("/sessions", web::get().to(handlers::sessions))
                .route("/sales-patterns", web::get().to(handlers::sales_patterns))
                // AI
                .route("/ai/chat", web::post().to(handlers::ai_chat))
                .route("/ai/sql", web::post().to(handlers::ai_sql))
                .route("/ai/status", web::get().to(handlers::ai_status))
                .route("/ai/analysis", web::post().to(handlers::ai_analysis))
                .route("/ai/predictions", web::post().to(handlers::ai_predictions)),
        );
}
