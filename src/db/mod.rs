//! Database module: connection provider and SQL repositories.
//!
//! - `ConnectionProvider` opens one physical connection per caller; nothing
//!   is pooled or registered globally.
//! - `repo`: SQL-only functions over an open connection that map rows into
//!   entities.

pub mod repo;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

/// Opens physical connections and starts short write transactions on them.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn open_connection(&self) -> Result<SqliteConnection, StoreError>;

    /// `BEGIN IMMEDIATE` takes SQLite's database-wide write lock up front.
    /// Callers must commit or roll back before doing anything slow.
    async fn begin_transaction(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(StoreError::Connection)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConnectionProvider {
    options: SqliteConnectOptions,
}

impl SqliteConnectionProvider {
    pub fn new(options: SqliteConnectOptions) -> Self {
        Self { options }
    }

    /// WAL journal, full sync, create-if-missing, and the given busy timeout.
    pub fn from_url(database_url: &str, busy_timeout: Duration) -> Result<Self, StoreError> {
        let normalized = prepare_sqlite_url(database_url);
        let options = SqliteConnectOptions::from_str(&normalized)
            .map_err(StoreError::Connection)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(busy_timeout);
        Ok(Self::new(options))
    }

    pub fn from_config(cfg: &DatabaseConfig) -> Result<Self, StoreError> {
        Self::from_url(&cfg.url, cfg.busy_timeout())
    }
}

#[async_trait]
impl ConnectionProvider for SqliteConnectionProvider {
    async fn open_connection(&self) -> Result<SqliteConnection, StoreError> {
        self.options
            .connect()
            .await
            .map_err(StoreError::Connection)
    }
}

/// Close a connection, logging instead of failing; used on paths that
/// already have a result to return.
pub async fn release(conn: SqliteConnection) {
    if let Err(err) = conn.close().await {
        debug!(?err, "failed to close connection");
    }
}

/// True for `SQLITE_BUSY`/`SQLITE_LOCKED` (and their extended codes): another
/// connection held the write lock past the busy timeout.
pub fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    match db_err.code().and_then(|code| code.parse::<i32>().ok()) {
        Some(code) => matches!(code & 0xff, 5 | 6),
        None => false,
    }
}

/// Roll back whatever is open on `conn`, then close it.
pub async fn rollback_and_release(mut conn: SqliteConnection) {
    if let Err(err) = sqlx::query("ROLLBACK").execute(&mut conn).await {
        debug!(?err, "rollback before release failed");
    }
    release(conn).await;
}

#[instrument(skip_all)]
pub async fn run_migrations(provider: &dyn ConnectionProvider) -> Result<(), StoreError> {
    let mut conn = provider.open_connection().await?;
    let result = sqlx::migrate!("./migrations").run(&mut conn).await;
    release(conn).await;
    result?;
    Ok(())
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}
