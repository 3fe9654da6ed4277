//! Database persistence for the trading cycle.
//!
//! Stores everything needed to resume after restart:
//! - The cycle state of every trading pair
//! - A bounded history of raw inbound alerts

mod memory;

pub use memory::MemoryStore;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::warn;

use crate::models::{Alert, CycleState, Mode, Signal};

/// Raw alerts kept in the `alerts` table.
pub const ALERT_HISTORY_LIMIT: i64 = 300;

/// Durable home of the per-pair cycle state.
///
/// A pair that was never saved loads as the initial state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, pair: &str) -> Result<CycleState>;

    async fn save(&self, pair: &str, state: &CycleState) -> Result<()>;
}

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored cycle state row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredState {
    pub pair: String,
    pub mode: String,
    pub pending_entry: Option<String>,
    pub consecutive_losses: i64,
    pub size_multiplier: i64,
    pub halt_profit_count: i64,
}

impl StoredState {
    /// Decode the row, falling back to the initial state when it is
    /// unreadable or inconsistent.
    pub fn into_state(self) -> CycleState {
        let decoded = self.decode();
        match decoded {
            Ok(state) if state.is_consistent() => state,
            Ok(state) => {
                warn!(pair = %self.pair, mode = %state.mode, "Inconsistent stored state, resetting");
                CycleState::default()
            }
            Err(e) => {
                warn!(pair = %self.pair, error = %e, "Unreadable stored state, resetting");
                CycleState::default()
            }
        }
    }

    fn decode(&self) -> Result<CycleState> {
        let mode: Mode = self.mode.parse().map_err(anyhow::Error::msg)?;
        let pending_entry = self
            .pending_entry
            .as_deref()
            .map(|json| serde_json::from_str::<Signal>(json))
            .transpose()
            .context("Malformed pending entry")?;

        Ok(CycleState {
            mode,
            pending_entry,
            consecutive_losses: u32::try_from(self.consecutive_losses)?,
            size_multiplier: u32::try_from(self.size_multiplier)?,
            halt_profit_count: u32::try_from(self.halt_profit_count)?,
        })
    }
}

/// Stored raw alert.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAlert {
    pub signal: Option<String>,
    pub pair: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection keeps every query
    /// on the same memory database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // One cycle per trading pair
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signal_state (
                pair TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                pending_entry TEXT,
                consecutive_losses INTEGER NOT NULL DEFAULT 0,
                size_multiplier INTEGER NOT NULL DEFAULT 1,
                halt_profit_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Raw inbound alerts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal TEXT,
                pair TEXT NOT NULL,
                payload TEXT NOT NULL,
                received_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_received ON alerts(received_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Cycle State ====================

    /// Create the initial state for `pair` unless a record already exists.
    pub async fn ensure_state(&self, pair: &str) -> Result<CycleState> {
        let initial = CycleState::default();
        sqlx::query(
            r#"
            INSERT INTO signal_state
                (pair, mode, pending_entry, consecutive_losses, size_multiplier, halt_profit_count, updated_at)
            VALUES (?, ?, NULL, ?, ?, ?, ?)
            ON CONFLICT(pair) DO NOTHING
            "#,
        )
        .bind(pair)
        .bind(initial.mode.as_str())
        .bind(initial.consecutive_losses as i64)
        .bind(initial.size_multiplier as i64)
        .bind(initial.halt_profit_count as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to create initial state")?;

        self.load_state(pair).await
    }

    /// Load the state of `pair`; a missing row is the initial state.
    pub async fn load_state(&self, pair: &str) -> Result<CycleState> {
        let row = self.get_state_row(pair).await?;
        Ok(row.map(StoredState::into_state).unwrap_or_default())
    }

    /// Raw state row for `pair`.
    pub async fn get_state_row(&self, pair: &str) -> Result<Option<StoredState>> {
        sqlx::query_as::<_, StoredState>("SELECT * FROM signal_state WHERE pair = ?")
            .bind(pair)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch state")
    }

    /// Replace the state of `pair`.
    pub async fn save_state(&self, pair: &str, state: &CycleState) -> Result<()> {
        let pending_entry = state
            .pending_entry
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode pending entry")?;

        sqlx::query(
            r#"
            INSERT INTO signal_state
                (pair, mode, pending_entry, consecutive_losses, size_multiplier, halt_profit_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pair) DO UPDATE SET
                mode = excluded.mode,
                pending_entry = excluded.pending_entry,
                consecutive_losses = excluded.consecutive_losses,
                size_multiplier = excluded.size_multiplier,
                halt_profit_count = excluded.halt_profit_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(pair)
        .bind(state.mode.as_str())
        .bind(pending_entry)
        .bind(state.consecutive_losses as i64)
        .bind(state.size_multiplier as i64)
        .bind(state.halt_profit_count as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to save state")?;

        Ok(())
    }

    /// Put `pair` back at the start of the cycle.
    pub async fn reset_state(&self, pair: &str) -> Result<CycleState> {
        let initial = CycleState::default();
        self.save_state(pair, &initial).await?;
        Ok(initial)
    }

    /// Every stored pair with its state.
    pub async fn list_states(&self) -> Result<Vec<(String, CycleState)>> {
        let rows = sqlx::query_as::<_, StoredState>("SELECT * FROM signal_state ORDER BY pair")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch states")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.pair.clone(), row.into_state()))
            .collect())
    }

    // ==================== Alerts ====================

    /// Store a raw alert and trim the history to the newest entries.
    pub async fn save_alert(
        &self,
        alert: &Alert,
        pair: &str,
        received_at: DateTime<Utc>,
    ) -> Result<i64> {
        let payload = serde_json::to_string(alert).context("Failed to encode alert")?;

        let result = sqlx::query(
            "INSERT INTO alerts (signal, pair, payload, received_at) VALUES (?, ?, ?, ?)",
        )
        .bind(alert.signal.as_deref())
        .bind(pair)
        .bind(payload)
        .bind(received_at)
        .execute(&self.pool)
        .await
        .context("Failed to save alert")?;

        sqlx::query(
            "DELETE FROM alerts WHERE id NOT IN (SELECT id FROM alerts ORDER BY id DESC LIMIT ?)",
        )
        .bind(ALERT_HISTORY_LIMIT)
        .execute(&self.pool)
        .await
        .context("Failed to trim alerts")?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent alerts, newest first.
    pub async fn recent_alerts(&self, limit: i64) -> Result<Vec<StoredAlert>> {
        sqlx::query_as::<_, StoredAlert>("SELECT * FROM alerts ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch alerts")
    }

    #[cfg(test)]
    pub async fn alert_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alerts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl StateStore for Database {
    async fn load(&self, pair: &str) -> Result<CycleState> {
        self.load_state(pair).await
    }

    async fn save(&self, pair: &str, state: &CycleState) -> Result<()> {
        self.save_state(pair, state).await
    }
}
