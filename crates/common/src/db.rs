use crate::types::{
    ClassifiedTrade, InsertOutcome, SignalStatus, TokenMetadata, TrackedWallet, TradeSignal,
};
use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use std::collections::HashSet;

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
///
/// This is the row store behind the trade recorder and wallet registry:
/// every write is an upsert or insert-or-ignore keyed by a unique column.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, busy_timeout)
    /// and create the schema, all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create DB directory: {}", parent.display())
                })?;
            }
        }

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .with_context(|| format!("failed to open store DB: {path}"))?;

        // The schema step needs a write lock. If another process holds it we retry
        // with backoff instead of crash-looping under the supervisor.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(5 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                    conn.execute_batch(SCHEMA)?;
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: schema setup failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: schema setup failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying schema setup"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Open an in-memory database with the full schema. Used by tests.
    pub async fn open_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(":memory:")
            .await
            .context("failed to open in-memory DB")?;
        let db = Self { conn };
        db.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(db)
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!("watcher_db_query_latency_ms", "op" => op, "status" => status)
            .record(ms);
        if res.is_err() {
            metrics::counter!("watcher_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }

    // ── tracked wallets ──

    pub async fn load_tracked_wallets(&self) -> Result<Vec<TrackedWallet>> {
        self.call_named("wallets.load", |conn| {
            let mut stmt = conn.prepare(
                "SELECT address, alias, is_active FROM tracked_wallets ORDER BY address",
            )?;
            let wallets = stmt
                .query_map([], |row| {
                    Ok(TrackedWallet {
                        address: row.get(0)?,
                        alias: row.get(1)?,
                        active: row.get::<_, i64>(2)? != 0,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(wallets)
        })
        .await
        .context("failed to load tracked wallets")
    }

    pub async fn upsert_tracked_wallet(&self, wallet: &TrackedWallet) -> Result<()> {
        let wallet = wallet.clone();
        self.call_named("wallets.upsert", move |conn| {
            conn.execute(
                "INSERT INTO tracked_wallets (address, alias, is_active)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(address) DO UPDATE SET
                    alias = excluded.alias,
                    is_active = excluded.is_active,
                    updated_at = datetime('now')",
                rusqlite::params![wallet.address, wallet.alias, i64::from(wallet.active)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_tracked_wallet(&self, address: &str) -> Result<()> {
        let addr = address.to_string();
        self.call_named("wallets.delete", move |conn| {
            conn.execute("DELETE FROM tracked_wallets WHERE address = ?1", [addr])?;
            Ok(())
        })
        .await
    }

    // ── tokens ──

    /// Insert token metadata, keeping previously known symbol/name when the new value is absent.
    pub async fn upsert_token(
        &self,
        address: &str,
        symbol: Option<&str>,
        name: Option<&str>,
    ) -> Result<()> {
        let address = address.to_string();
        let symbol = symbol.map(str::to_string);
        let name = name.map(str::to_string);
        self.call_named("tokens.upsert", move |conn| {
            conn.execute(
                "INSERT INTO tokens (address, symbol, name)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(address) DO UPDATE SET
                    symbol = COALESCE(excluded.symbol, tokens.symbol),
                    name = COALESCE(excluded.name, tokens.name),
                    updated_at = datetime('now')",
                rusqlite::params![address, symbol, name],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn token_metadata(&self, address: &str) -> Result<Option<TokenMetadata>> {
        let address = address.to_string();
        self.call_named("tokens.get", move |conn| {
            let meta = conn
                .query_row(
                    "SELECT address, symbol, name FROM tokens WHERE address = ?1",
                    [&address],
                    |row| {
                        Ok(TokenMetadata {
                            address: row.get(0)?,
                            symbol: row.get(1)?,
                            name: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(meta)
        })
        .await
    }

    // ── trades ──

    /// Insert a trade keyed by (transaction_hash, wallet_address).
    /// A repeated key is a no-op reported as [`InsertOutcome::Duplicate`].
    pub async fn insert_trade(&self, trade: &ClassifiedTrade) -> Result<InsertOutcome> {
        let trade = trade.clone();
        self.call_named("trades.insert", move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO trades
                 (wallet_address, coin_address, trade_type, sol_amount, token_amount, transaction_hash, trade_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    trade.wallet_address,
                    trade.token_address,
                    trade.kind.as_str(),
                    trade.sol_amount,
                    trade.token_amount,
                    trade.signature,
                    trade.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(if changed == 0 {
                InsertOutcome::Duplicate
            } else {
                InsertOutcome::Inserted
            })
        })
        .await
    }

    pub async fn count_trades(&self) -> Result<i64> {
        self.call(|conn| {
            let n = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
            Ok(n)
        })
        .await
    }

    // ── signals ──

    /// Persist a signal and return its row id.
    pub async fn insert_signal(&self, signal: &TradeSignal) -> Result<i64> {
        let wallets: Vec<&String> = signal.triggering_wallets.iter().collect();
        let metadata = serde_json::json!({
            "whale_addresses": wallets,
            "whale_count": signal.whale_count(),
            "total_sol": signal.total_sol_amount,
        })
        .to_string();
        let coin = signal.token_address.clone();
        let status = signal.status.as_str();
        let reason = signal.reason.clone();
        let created_at = signal.created_at.to_rfc3339();

        self.call_named("signals.insert", move |conn| {
            conn.execute(
                "INSERT INTO signals (coin_address, status, trigger_reason, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![coin, status, reason, metadata, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Move a signal out of (or back into) `OPEN`. The watcher only ever writes
    /// `OPEN`; execution and expiry belong to the trading side, which links this
    /// crate and calls here. The `signal_resync` job then re-arms the token via
    /// [`Self::open_signal_ids`].
    pub async fn set_signal_status(&self, id: i64, status: SignalStatus) -> Result<()> {
        self.call_named("signals.set_status", move |conn| {
            conn.execute(
                "UPDATE signals SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                rusqlite::params![status.as_str(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn open_signal_ids(&self) -> Result<HashSet<i64>> {
        self.call_named("signals.open_ids", |conn| {
            let mut stmt = conn.prepare("SELECT id FROM signals WHERE status = 'OPEN'")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<HashSet<i64>, _>>()?;
            Ok(ids)
        })
        .await
    }
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tracked_wallets (
    address TEXT PRIMARY KEY,
    alias TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    added_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS tokens (
    address TEXT PRIMARY KEY,
    symbol TEXT,
    name TEXT,
    first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    coin_address TEXT NOT NULL,
    trade_type TEXT NOT NULL,          -- BUY, SELL, TRANSFER_IN, TRANSFER_OUT
    sol_amount REAL NOT NULL,
    token_amount REAL NOT NULL,
    transaction_hash TEXT NOT NULL,
    trade_timestamp TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(transaction_hash, wallet_address)
);

CREATE INDEX IF NOT EXISTS idx_trades_coin_time ON trades(coin_address, trade_timestamp);

CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    coin_address TEXT NOT NULL,
    status TEXT NOT NULL,              -- OPEN, EXECUTED, EXPIRED
    trigger_reason TEXT NOT NULL,
    metadata_json TEXT NOT NULL,       -- {whale_addresses, whale_count, total_sol}
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status);
";
