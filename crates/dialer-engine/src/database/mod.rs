//! # Persistence layer
//!
//! Async SQLite access through `sqlx`. The store holds campaigns and their
//! pacing configuration, leads, call records, disposition reference data, the
//! internal do-not-call list and an audit trail of agent sessions.
//!
//! Everything that the engine mutates from more than one loop at the same time
//! (hopper entries, live agent sessions, in-flight attempts) lives in memory;
//! the database only sees per-entity writes handed off by whichever component
//! owns the entity at that moment. Where a write must happen exactly once (the
//! terminal outcome of a call, its disposition) the statement carries its own
//! guard in the `WHERE` clause and reports whether it applied.
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch so that
//! range comparisons in SQL are exact.

pub mod call_records;
pub mod campaigns;
pub mod dispositions;
pub mod dnc;
pub mod leads;
pub mod sessions;

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::DatabaseConfig;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS campaigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    dial_method TEXT NOT NULL DEFAULT 'predictive',
    dial_ratio REAL NOT NULL DEFAULT 1.0,
    dial_ratio_min REAL NOT NULL DEFAULT 1.0,
    dial_ratio_max REAL NOT NULL DEFAULT 3.0,
    abandon_threshold REAL NOT NULL DEFAULT 3.0,
    max_concurrent_calls INTEGER NOT NULL DEFAULT 50,
    max_lines INTEGER NOT NULL DEFAULT 50,
    hopper_size INTEGER NOT NULL DEFAULT 100,
    wrapup_timeout_secs INTEGER NOT NULL DEFAULT 60,
    auto_available INTEGER NOT NULL DEFAULT 0,
    auto_wrapup_disposition TEXT,
    call_timeout_secs INTEGER NOT NULL DEFAULT 30,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    retry_delay_secs INTEGER NOT NULL DEFAULT 3600,
    dial_prefix TEXT,
    caller_id TEXT,
    server_id TEXT,
    pause_reason TEXT
);

CREATE TABLE IF NOT EXISTS leads (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
    phone_number TEXT NOT NULL,
    first_name TEXT,
    last_name TEXT,
    status TEXT NOT NULL DEFAULT 'new',
    priority INTEGER NOT NULL DEFAULT 0,
    call_count INTEGER NOT NULL DEFAULT 0,
    last_called_at INTEGER,
    callback_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_leads_campaign_status ON leads(campaign_id, status);

CREATE TABLE IF NOT EXISTS call_records (
    id TEXT PRIMARY KEY,
    campaign_id INTEGER NOT NULL,
    lead_id INTEGER NOT NULL,
    phone_number TEXT NOT NULL,
    channel_id TEXT NOT NULL UNIQUE,
    server_id TEXT NOT NULL,
    state TEXT NOT NULL,
    outcome TEXT,
    agent_id TEXT,
    started_at INTEGER NOT NULL,
    answered_at INTEGER,
    bridged_at INTEGER,
    ended_at INTEGER,
    talk_secs INTEGER,
    hangup_cause TEXT,
    disposition TEXT,
    notes TEXT
);

CREATE INDEX IF NOT EXISTS idx_call_records_campaign ON call_records(campaign_id, started_at);

CREATE TABLE IF NOT EXISTS dispositions (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    lead_status TEXT NOT NULL,
    is_sale INTEGER NOT NULL DEFAULT 0,
    triggers_callback INTEGER NOT NULL DEFAULT 0,
    callback_delay_secs INTEGER NOT NULL DEFAULT 3600,
    triggers_dnc INTEGER NOT NULL DEFAULT 0,
    auto_available INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS dnc_numbers (
    phone_number TEXT PRIMARY KEY,
    reason TEXT,
    added_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_sessions (
    session_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    campaign_id INTEGER NOT NULL,
    server_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    state TEXT NOT NULL,
    login_at INTEGER NOT NULL,
    ended_at INTEGER,
    end_reason TEXT
);
"#;

/// Async database manager using sqlx
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Open (or create) the database described by `config`
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        if config.path == ":memory:" {
            return Self::new_in_memory().await;
        }

        info!("🗄️ Opening dialer database at {}", config.path);

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let manager = Self { pool };
        manager.initialize_schema().await?;
        Ok(manager)
    }

    /// Private in-memory database. Every SQLite connection to `:memory:` gets
    /// its own database, so the pool is pinned to a single connection that is
    /// never recycled.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let manager = Self { pool };
        manager.initialize_schema().await?;
        Ok(manager)
    }

    async fn initialize_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        self.seed_default_dispositions().await?;
        debug!("Database schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn opt_from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.map(from_millis)
}
