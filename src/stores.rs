//! Store registry: which POS locations to sync and the credentials for each.
//!
//! Loaded from `config/stores.json` (or `STORES_FILE`) when present, otherwise
//! from the `STORES_CONFIG` env var holding the same JSON array.
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::database_ops::linisco::provider::lenient;
use crate::util::env as env_util;

pub const DEFAULT_STORES_FILE: &str = "config/stores.json";

#[derive(Debug, Error)]
pub enum StoreConfigError {
    #[error("no store configuration: set STORES_CONFIG or create {0}")]
    Missing(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store configuration is not a valid JSON array: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("store configuration must contain at least one store")]
    Empty,
    #[error("invalid store configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// One POS location and the credentials used to sign in to the upstream API.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Numeric id; a JSON number is accepted too.
    #[serde(default, deserialize_with = "lenient::string_or_empty")]
    pub store_id: String,
    #[serde(default)]
    pub store_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("store_id", &self.store_id)
            .field("store_name", &self.store_name)
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// Password-free view used by listings.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct StoreRegistry {
    stores: Vec<StoreConfig>,
}

impl StoreRegistry {
    /// Build from an already-parsed list, validating it.
    pub fn new(stores: Vec<StoreConfig>) -> Result<Self, StoreConfigError> {
        validate(&stores)?;
        Ok(Self { stores })
    }

    /// Resolve the configuration source from the environment.
    pub fn load() -> Result<Self, StoreConfigError> {
        let file = env_util::env_opt("STORES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORES_FILE));
        if file.exists() {
            return Self::from_file(&file);
        }
        match env_util::env_opt("STORES_CONFIG") {
            Some(raw) => {
                let registry = Self::from_json(&raw)?;
                info!(
                    target = "stores",
                    count = registry.len(),
                    "store configuration loaded from STORES_CONFIG"
                );
                Ok(registry)
            }
            None => Err(StoreConfigError::Missing(file.display().to_string())),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, StoreConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_json(&raw)?;
        info!(
            target = "stores",
            count = registry.len(),
            file = %path.display(),
            "store configuration loaded from file"
        );
        Ok(registry)
    }

    /// Parse a JSON array, tolerating `//` and `/* */` comments.
    pub fn from_json(raw: &str) -> Result<Self, StoreConfigError> {
        let cleaned = strip_json_comments(raw);
        let stores: Vec<StoreConfig> = serde_json::from_str(cleaned.trim())?;
        Self::new(stores)
    }

    pub fn stores(&self) -> &[StoreConfig] {
        &self.stores
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn get(&self, store_id: &str) -> Option<&StoreConfig> {
        self.stores.iter().find(|s| s.store_id == store_id.trim())
    }

    pub fn get_by_email(&self, email: &str) -> Option<&StoreConfig> {
        self.stores
            .iter()
            .find(|s| s.email.eq_ignore_ascii_case(email.trim()))
    }

    pub fn summaries(&self) -> Vec<StoreSummary> {
        self.stores
            .iter()
            .map(|s| StoreSummary {
                id: s.store_id.clone(),
                name: s.store_name.clone(),
                email: s.email.clone(),
            })
            .collect()
    }
}

/// Drop `//` and `/* */` comments that sit outside string literals.
fn strip_json_comments(raw: &str) -> String {
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    let tokens = TOKENS.get_or_init(|| {
        Regex::new(r#"(?s)"(?:\\.|[^"\\])*"|/\*.*?\*/|//[^\n]*"#).expect("static regex")
    });
    tokens
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let m = &caps[0];
            if m.starts_with('"') {
                m.to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

fn email_shape() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static regex"))
}

fn validate(stores: &[StoreConfig]) -> Result<(), StoreConfigError> {
    if stores.is_empty() {
        return Err(StoreConfigError::Empty);
    }
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    for (idx, store) in stores.iter().enumerate() {
        let n = idx + 1;
        let mut missing = Vec::new();
        for (field, value) in [
            ("store_id", &store.store_id),
            ("store_name", &store.store_name),
            ("email", &store.email),
            ("password", &store.password),
        ] {
            if value.trim().is_empty() {
                missing.push(field);
            }
        }
        if !missing.is_empty() {
            problems.push(format!("store {n}: missing {}", missing.join(", ")));
            continue;
        }
        if !email_shape().is_match(store.email.trim()) {
            problems.push(format!("store {n}: invalid email ({})", store.email));
        }
        if !store.store_id.trim().chars().all(|c| c.is_ascii_digit()) {
            problems.push(format!(
                "store {n}: store_id must be numeric ({})",
                store.store_id
            ));
        }
        if !seen.insert(store.store_id.trim().to_string()) {
            problems.push(format!("store {n}: duplicate store_id {}", store.store_id));
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(StoreConfigError::Invalid(problems))
    }
}
