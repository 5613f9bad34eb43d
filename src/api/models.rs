// API request/response models (DTOs)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::{DateWindow, WindowError};

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
            meta: Some(Meta::now()),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code.into()),
            meta: Some(Meta::now()),
        }
    }
}

/// Metadata included in all API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub backend: String,
    pub stores: usize,
    pub sync_running: bool,
    pub uptime_seconds: u64,
}

/// Date range as sent by clients. Both camelCase and snake_case are accepted.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WindowParams {
    #[serde(default, rename = "fromDate", alias = "from_date", alias = "from")]
    pub from_date: Option<String>,
    #[serde(default, rename = "toDate", alias = "to_date", alias = "to")]
    pub to_date: Option<String>,
}

impl WindowParams {
    /// Missing bounds fall back to `default`.
    pub fn resolve(&self, default: DateWindow) -> Result<DateWindow, WindowError> {
        DateWindow::parse_or(self.from_date.as_deref(), self.to_date.as_deref(), default)
    }
}

/// Query string for report endpoints: window, optional comma-separated
/// `store_id` list and a `limit` for ranked lists.
// Not flattened: urlencoded values only reach numeric fields when they are
// deserialized directly.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ReportQuery {
    #[serde(default, rename = "fromDate", alias = "from_date", alias = "from")]
    pub from_date: Option<String>,
    #[serde(default, rename = "toDate", alias = "to_date", alias = "to")]
    pub to_date: Option<String>,
    #[serde(default, alias = "storeId", alias = "stores")]
    pub store_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl ReportQuery {
    pub fn window(&self) -> WindowParams {
        WindowParams {
            from_date: self.from_date.clone(),
            to_date: self.to_date.clone(),
        }
    }

    pub fn store_ids(&self) -> Vec<String> {
        self.store_id
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Body of `POST /stats`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StatsRequest {
    #[serde(flatten)]
    pub window: WindowParams,
    #[serde(default, alias = "storeIds", alias = "stores")]
    pub store_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(flatten)]
    pub window: WindowParams,
    #[serde(default, alias = "storeId")]
    pub store_id: Option<String>,
}

/// Body of `POST /ai/analysis` and `POST /ai/predictions`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct InsightRequest {
    #[serde(flatten)]
    pub window: WindowParams,
    #[serde(default, alias = "storeId")]
    pub store_id: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}
