use anyhow::{anyhow, Context, Result};
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::{AnyPool, Row};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env as env_util;

/// Which engine sits behind the pool. Only DDL differs between the two; all
/// query text uses `$N` placeholders, which both drivers accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self> {
        let lower = url.trim().to_ascii_lowercase();
        if lower.starts_with("sqlite:") {
            Ok(Backend::Sqlite)
        } else if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Ok(Backend::Postgres)
        } else {
            Err(anyhow!(
                "unsupported database URL scheme (expected sqlite: or postgres://)"
            ))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Migration {
    version: i64,
    description: &'static str,
    sqlite: &'static str,
    postgres: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "init",
    sqlite: include_str!("../../migrations/sqlite/0001_init.sql"),
    postgres: include_str!("../../migrations/postgres/0001_init.sql"),
}];

#[derive(Clone)]
pub struct Db {
    pub pool: AnyPool,
    pub backend: Backend,
}

impl Db {
    /// Connect and, unless `AUTO_MIGRATE` is switched off, bring the schema up to date.
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let db = Self::connect_no_migrate(database_url, max_connections).await?;
        if env_util::env_flag("AUTO_MIGRATE", true) {
            db.run_migrations().await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(db)
    }

    // Variant that NEVER runs migrations regardless of env.
    #[instrument(skip(database_url))]
    pub async fn connect_no_migrate(database_url: &str, max_connections: u32) -> Result<Self> {
        install_default_drivers();
        let backend = Backend::from_url(database_url)?;
        if backend == Backend::Sqlite {
            ensure_sqlite_parent_dir(database_url)?;
        }

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if backend == Backend::Sqlite {
                        sqlx::query("PRAGMA foreign_keys = ON")
                            .execute(&mut *conn)
                            .await?;
                        // Best-effort; not every SQLite target supports WAL.
                        let _ = sqlx::query("PRAGMA journal_mode = WAL")
                            .execute(&mut *conn)
                            .await;
                    }
                    Ok(())
                })
            })
            .connect(database_url)
            .await
            .with_context(|| format!("connect to {backend} database"))?;
        info!(%backend, max_connections, "connected to db");
        Ok(Self { pool, backend })
    }

    /// Cheap connectivity check used by the health endpoint.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Apply every embedded migration not yet recorded in `schema_migrations`.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT NOT NULL,
                installed_at TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;

        let applied: HashSet<i64> = sqlx::query("SELECT version FROM schema_migrations")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| r.try_get::<i64, _>(0))
            .collect::<Result<_, _>>()?;

        for migration in MIGRATIONS {
            if applied.contains(&migration.version) {
                continue;
            }
            let sql = match self.backend {
                Backend::Sqlite => migration.sqlite,
                Backend::Postgres => migration.postgres,
            };
            info!(
                version = migration.version,
                description = migration.description,
                backend = %self.backend,
                "applying migration"
            );
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {} failed", migration.version))?;
            sqlx::query(
                "INSERT INTO schema_migrations (version, description, installed_at)
                 VALUES ($1, $2, $3)",
            )
            .bind(migration.version)
            .bind(migration.description)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        }

        let latest: Option<i64> =
            sqlx::query("SELECT MAX(version) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?
                .try_get(0)?;
        info!(version = latest.unwrap_or_default(), "migrations up-to-date");
        Ok(())
    }
}

/// Comma-separated `$N` placeholders starting at `first`, e.g. `$3, $4, $5`.
pub fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn ensure_sqlite_parent_dir(url: &str) -> Result<()> {
    let rest = url
        .trim()
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create sqlite directory {}", parent.display()))?;
        }
    }
    Ok(())
}
