//! Persistence layer
//!
//! A single SQLite database holds four logical tables: wallets, strategies,
//! strategy runs, and tool events. The database runs in WAL mode; schema
//! evolution goes through a `PRAGMA user_version` migration ladder so
//! existing deployments upgrade without loss.
//!
//! Connection access is a short-lived `Mutex<Connection>` lock. Callers
//! never hold it across await points; every store operation is a single
//! synchronous transaction.

pub mod journal;
pub mod keystore;
pub mod strategies;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::{Error, Result};

/// Migration ladder. Entry `i` migrates `user_version` from `i` to `i + 1`.
const MIGRATIONS: &[&str] = &[
    // v0 -> v1: initial schema
    r#"
    CREATE TABLE wallets (
        agent_id    TEXT PRIMARY KEY,
        address     TEXT NOT NULL UNIQUE,        -- lowercase 0x hex
        ciphertext  BLOB NOT NULL,               -- nonce || AEAD ciphertext
        chain_id    INTEGER NOT NULL,
        last_nonce  INTEGER,                     -- NULL until first broadcast
        metadata    TEXT NOT NULL DEFAULT '{}',  -- JSON
        created_at  INTEGER NOT NULL,            -- epoch ms
        updated_at  INTEGER NOT NULL
    );

    -- Key-check and other store-level values
    CREATE TABLE meta (
        key   TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );

    CREATE TABLE strategies (
        label             TEXT PRIMARY KEY,
        agent_id          TEXT NOT NULL,
        kind              TEXT NOT NULL,
        to_address        TEXT NOT NULL,
        amount_wei        TEXT NOT NULL,         -- decimal wei string
        interval_seconds  INTEGER NOT NULL,
        enabled           INTEGER NOT NULL DEFAULT 0,
        max_base_fee_gwei INTEGER,
        daily_cap_wei     TEXT,
        next_run_at       INTEGER,               -- epoch ms, NULL when unscheduled
        last_run_at       INTEGER,
        last_tx_hash      TEXT,
        spent_day         TEXT,                  -- UTC calendar date YYYY-MM-DD
        spent_today_wei   TEXT NOT NULL DEFAULT '0',
        confirmation_code TEXT,
        created_at        INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL
    );

    -- Append-only audit children of strategies
    CREATE TABLE strategy_runs (
        id             INTEGER PRIMARY KEY,
        strategy_label TEXT NOT NULL,
        ran_at         INTEGER NOT NULL,
        outcome        TEXT NOT NULL,
        tx_hash        TEXT,
        detail         TEXT
    );
    CREATE INDEX idx_runs_label_time ON strategy_runs(strategy_label, ran_at);

    -- Append-only journal of tool invocations; doubles as the rate-limit
    -- source of truth
    CREATE TABLE events (
        id              INTEGER PRIMARY KEY,
        occurred_at     INTEGER NOT NULL,
        tool_name       TEXT NOT NULL,
        agent_id        TEXT,
        status          TEXT NOT NULL,           -- ok | denied | error
        request_digest  TEXT,
        response_digest TEXT,
        error_kind      TEXT
    );
    CREATE INDEX idx_events_tool_agent_time ON events(tool_name, agent_id, occurred_at);
    CREATE INDEX idx_events_time ON events(occurred_at);
    "#,
];

/// Shared database handle.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("open database: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            let mut version: i64 =
                conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            while (version as usize) < MIGRATIONS.len() {
                let target = version + 1;
                let tx = conn.unchecked_transaction()?;
                tx.execute_batch(MIGRATIONS[version as usize])?;
                tx.pragma_update(None, "user_version", target)?;
                tx.commit()?;
                tracing::info!(from = version, to = target, "applied schema migration");
                version = target;
            }
            Ok(())
        })
    }

    /// Run `f` with the connection lock held. The closure must not block on
    /// anything but SQLite itself.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("database lock poisoned".into()))?;
        f(&conn)
    }

    /// Run `f` inside a transaction; commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("database lock poisoned".into()))?;
        let tx = conn.unchecked_transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}
