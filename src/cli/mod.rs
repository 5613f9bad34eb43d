//! Command implementations behind the `linisco` binary. Each submodule
//! exposes a `run(db, config)` that does the work and prints the result.
pub mod chat;
pub mod reports;
pub mod sync;

use anyhow::{Context, Result};

use crate::util::db::Db;
use crate::util::env as env_util;
use crate::window::DateWindow;

/// Connect using `--db-url` or the environment. Migrations follow `AUTO_MIGRATE`.
pub async fn connect(db_url: Option<&str>) -> Result<Db> {
    let url = db_url.map(str::to_string).unwrap_or_else(env_util::db_url);
    let max = env_util::env_parse("DB_MAX_CONNS", 5u32);
    Db::connect(&url, max).await
}

/// Positional `[from] [to]` with `default` filling what is missing. A lone
/// `from` means that single day.
pub fn window_args(
    from: Option<&str>,
    to: Option<&str>,
    default: DateWindow,
) -> Result<DateWindow> {
    let to = to.or(from);
    DateWindow::parse_or(from, to, default).context("invalid date range")
}
