use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::util::env as env_util;
use crate::util::text::truncate_for_log;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_FALLBACK_MODELS: &str = "gemini-1.5-pro,gemini-1.5-flash,gemini-pro";

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("GEMINI_API_KEY is not set")]
    NotConfigured,
    #[error("model {0} is overloaded")]
    Overloaded(String),
    #[error("gemini {model} failed: {status} body={body}")]
    Http {
        model: String,
        status: StatusCode,
        body: String,
    },
    #[error("gemini {0} returned no text")]
    EmptyResponse(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

impl GeminiError {
    pub fn is_overloaded(&self) -> bool {
        matches!(self, GeminiError::Overloaded(_))
    }
}

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub fallback_models: Vec<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_secs: u64,
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("fallback_models", &self.fallback_models)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            fallback_models: split_models(DEFAULT_FALLBACK_MODELS),
            temperature: 0.7,
            max_output_tokens: 2048,
            timeout_secs: 60,
        }
    }
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_key: env_util::env_opt("GEMINI_API_KEY"),
            base_url: env_util::env_opt("GEMINI_API_URL").unwrap_or(d.base_url),
            model: env_util::env_opt("GEMINI_MODEL").unwrap_or(d.model),
            fallback_models: env_util::env_opt("GEMINI_FALLBACK_MODELS")
                .map(|v| split_models(&v))
                .unwrap_or(d.fallback_models),
            temperature: env_util::env_parse("GEMINI_TEMPERATURE", d.temperature),
            max_output_tokens: env_util::env_parse("GEMINI_MAX_TOKENS", d.max_output_tokens),
            timeout_secs: env_util::env_parse("GEMINI_TIMEOUT_SECS", d.timeout_secs),
        }
    }
}

fn split_models(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Text produced by a model, with the model that actually answered.
#[derive(Debug, Clone, Serialize)]
pub struct Generated {
    pub text: String,
    pub model: String,
}

/// Thin client over the `generateContent` REST endpoint.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    http: Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GeminiError> {
        let http = Client::builder()
            .user_agent("linisco-sync/0.1")
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self, GeminiError> {
        Self::new(GeminiConfig::from_env())
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// One call against `model`. 503 and "overloaded" bodies map to
    /// [`GeminiError::Overloaded`] so callers can move on to another model.
    pub async fn generate_with(&self, model: &str, prompt: &str) -> Result<String, GeminiError> {
        let key = self.config.api_key.as_deref().ok_or(GeminiError::NotConfigured)?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );
        let payload = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_output_tokens,
            }
        });
        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status == StatusCode::SERVICE_UNAVAILABLE
                || body.to_ascii_lowercase().contains("overloaded")
            {
                return Err(GeminiError::Overloaded(model.to_string()));
            }
            return Err(GeminiError::Http {
                model: model.to_string(),
                status,
                body: truncate_for_log(body, 300),
            });
        }
        let parsed: GenerateResponse = resp.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();
        if text.trim().is_empty() {
            return Err(GeminiError::EmptyResponse(model.to_string()));
        }
        debug!(model, chars = text.len(), "gemini response");
        Ok(text)
    }

    /// Primary model first, then each fallback while the previous one
    /// reports overload. Any other error stops the walk.
    pub async fn generate(&self, prompt: &str) -> Result<Generated, GeminiError> {
        let models = std::iter::once(&self.config.model).chain(
            self.config
                .fallback_models
                .iter()
                .filter(|m| **m != self.config.model),
        );
        let mut last = GeminiError::Overloaded(self.config.model.clone());
        for model in models {
            match self.generate_with(model, prompt).await {
                Ok(text) => {
                    return Ok(Generated {
                        text,
                        model: model.clone(),
                    })
                }
                Err(e) if e.is_overloaded() => {
                    warn!(model = %model, "gemini model overloaded; trying next");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}
