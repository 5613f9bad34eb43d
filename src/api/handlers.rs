// HTTP request handlers for API endpoints

use crate::api::models::*;
use crate::database_ops::gemini::ChatService;
use crate::database_ops::linisco::{PosSource, SyncError, SyncService};
use crate::database_ops::reports::{self, ReportFilter};
use crate::database_ops::upsert::recent_sync_log;
use crate::util::db::Db;
use crate::window::{DateWindow, WindowError};
use actix_web::{http::StatusCode, web, HttpResponse, ResponseError};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Reports and chat default to this many days ending today.
pub const DEFAULT_REPORT_DAYS: u32 = 7;
pub const DEFAULT_SYNC_LOG_LIMIT: i64 = 50;

pub type SharedSync = Arc<SyncService<Arc<dyn PosSource>>>;

/// Everything handlers need, shared across workers.
pub struct AppState {
    pub db: Db,
    pub sync: SharedSync,
    pub chat: ChatService,
    pub started: Instant,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("a sync run is already in progress")]
    SyncInProgress,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::SyncInProgress => "SYNC_IN_PROGRESS",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<WindowError> for ApiError {
    fn from(e: WindowError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::InProgress => ApiError::SyncInProgress,
            SyncError::UnknownStore(_) => ApiError::NotFound(e.to_string()),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SyncInProgress => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let ApiError::Internal(e) = self {
            tracing::error!(error = %format!("{e:#}"), "request failed");
        }
        HttpResponse::build(self.status_code()).json(ApiResponse::<()>::error(self.code(), self.to_string()))
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

fn ok<T: serde::Serialize>(data: T) -> ApiResult {
    Ok(HttpResponse::Ok().json(ApiResponse::success(data)))
}

/// Optional JSON body: empty means all defaults, anything that does not
/// parse as `T` is a 400.
fn optional_body<T: DeserializeOwned + Default>(body: &web::Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))
}

/// Sync work runs on its own task so a dropped request cannot abandon a
/// run halfway or skip its sync_log row.
async fn detached<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, SyncError>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("sync task failed: {e}")))?
        .map_err(ApiError::from)
}

fn report_filter(q: &ReportQuery) -> Result<ReportFilter, ApiError> {
    let window = q.window().resolve(DateWindow::last_days(DEFAULT_REPORT_DAYS))?;
    Ok(ReportFilter::new(window, q.store_ids()))
}

/// Health check endpoint
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let connected = state.db.ping().await;
    let body = ApiResponse::success(HealthResponse {
        status: if connected { "healthy" } else { "degraded" }.to_string(),
        database: if connected { "connected" } else { "disconnected" }.to_string(),
        backend: state.db.backend.to_string(),
        stores: state.sync.stores().len(),
        sync_running: state.sync.is_running(),
        uptime_seconds: state.started.elapsed().as_secs(),
    });
    if connected {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Sync every configured store. Defaults to yesterday.
pub async fn trigger_sync(state: web::Data<AppState>, body: web::Bytes) -> ApiResult {
    let params: WindowParams = optional_body(&body)?;
    let window = params.resolve(DateWindow::yesterday())?;
    tracing::info!(window = %window, "sync requested");
    let sync = state.sync.clone();
    let report = detached(async move { sync.try_sync_all_stores(&window).await }).await?;
    ok(report)
}

pub async fn trigger_store_sync(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> ApiResult {
    let store_id = path.into_inner();
    let params: WindowParams = optional_body(&body)?;
    let window = params.resolve(DateWindow::yesterday())?;
    tracing::info!(store_id = %store_id, window = %window, "store sync requested");
    let sync = state.sync.clone();
    let outcome = detached(async move { sync.sync_store_by_id(&store_id, &window).await }).await?;
    ok(outcome)
}

pub async fn sync_log(state: web::Data<AppState>, query: web::Query<LimitQuery>) -> ApiResult {
    let rows = recent_sync_log(&state.db, query.limit.unwrap_or(DEFAULT_SYNC_LOG_LIMIT)).await?;
    ok(rows)
}

pub async fn list_stores(state: web::Data<AppState>) -> ApiResult {
    ok(reports::list_stores(&state.db).await?)
}

pub async fn stores_summary(state: web::Data<AppState>, query: web::Query<ReportQuery>) -> ApiResult {
    let filter = report_filter(&query)?;
    ok(reports::stores_summary(&state.db, &filter).await?)
}

pub async fn get_stats(state: web::Data<AppState>, query: web::Query<ReportQuery>) -> ApiResult {
    let filter = report_filter(&query)?;
    ok(reports::stats(&state.db, &filter).await?)
}

pub async fn post_stats(state: web::Data<AppState>, body: web::Bytes) -> ApiResult {
    let req: StatsRequest = optional_body(&body)?;
    let window = req.window.resolve(DateWindow::last_days(DEFAULT_REPORT_DAYS))?;
    let filter = ReportFilter::new(window, req.store_ids);
    ok(reports::stats(&state.db, &filter).await?)
}

pub async fn sales_summary(state: web::Data<AppState>, query: web::Query<ReportQuery>) -> ApiResult {
    let filter = report_filter(&query)?;
    ok(reports::sales_summary(&state.db, &filter).await?)
}

pub async fn top_products(state: web::Data<AppState>, query: web::Query<ReportQuery>) -> ApiResult {
    let filter = report_filter(&query)?;
    ok(reports::top_products(&state.db, &filter, query.limit).await?)
}

pub async fn daily_sales(state: web::Data<AppState>, query: web::Query<ReportQuery>) -> ApiResult {
    let filter = report_filter(&query)?;
    ok(reports::daily_sales(&state.db, &filter).await?)
}

pub async fn payment_methods(
    state: web::Data<AppState>,
    query: web::Query<ReportQuery>,
) -> ApiResult {
    let filter = report_filter(&query)?;
    ok(reports::payment_methods(&state.db, &filter).await?)
}

pub async fn sessions(state: web::Data<AppState>, query: web::Query<ReportQuery>) -> ApiResult {
    let filter = report_filter(&query)?;
    ok(reports::session_summary(&state.db, &filter).await?)
}

pub async fn sales_patterns(state: web::Data<AppState>, query: web::Query<ReportQuery>) -> ApiResult {
    let filter = report_filter(&query)?;
    ok(reports::sales_patterns(&state.db, &filter).await?)
}

fn chat_args(req: &ChatRequest) -> Result<(DateWindow, Option<&str>), ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".into()));
    }
    scoped_window(&req.window, req.store_id.as_deref())
}

fn scoped_window<'a>(
    window: &WindowParams,
    store_id: Option<&'a str>,
) -> Result<(DateWindow, Option<&'a str>), ApiError> {
    let window = window.resolve(DateWindow::last_days(DEFAULT_REPORT_DAYS))?;
    let store = store_id.map(str::trim).filter(|s| !s.is_empty());
    Ok((window, store))
}

pub async fn ai_chat(state: web::Data<AppState>, body: web::Json<ChatRequest>) -> ApiResult {
    let (window, store) = chat_args(&body)?;
    ok(state.chat.chat(&body.message, &window, store).await?)
}

pub async fn ai_sql(state: web::Data<AppState>, body: web::Json<ChatRequest>) -> ApiResult {
    let (window, store) = chat_args(&body)?;
    ok(state
        .chat
        .natural_language_query(&body.message, &window, store)
        .await?)
}

pub async fn ai_status(state: web::Data<AppState>) -> ApiResult {
    ok(state.chat.status())
}

pub async fn ai_analysis(state: web::Data<AppState>, body: web::Bytes) -> ApiResult {
    let req: InsightRequest = optional_body(&body)?;
    let (window, store) = scoped_window(&req.window, req.store_id.as_deref())?;
    ok(state.chat.analyze(&window, store).await?)
}

pub async fn ai_predictions(state: web::Data<AppState>, body: web::Bytes) -> ApiResult {
    let req: InsightRequest = optional_body(&body)?;
    let (window, store) = scoped_window(&req.window, req.store_id.as_deref())?;
    ok(state.chat.predict(&window, store).await?)
}
