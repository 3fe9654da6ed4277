//! Append-only activity log of accepted trades, kept as a JSON array file.

use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;

use super::{Event, EventSink};

/// Entries kept in the log file.
pub const ACTIVITY_LOG_LIMIT: usize = 1000;

/// Newest-first log of trade events.
///
/// Only trade events are recorded. A file that cannot be parsed is
/// replaced with a fresh log.
pub struct ActivityLog {
    path: PathBuf,
    limit: usize,
    /// Serializes read-modify-write cycles on the file
    write_lock: Mutex<()>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            limit: ACTIVITY_LOG_LIMIT,
            write_lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Current entries, newest first.
    pub async fn entries(&self) -> Result<Vec<Value>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str::<Vec<Value>>(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Malformed activity log, resetting");
                Ok(Vec::new())
            }
        }
    }

    /// Log entry for a trade event; `None` for anything else.
    fn entry_for(event: &Event) -> Option<Value> {
        let trade = event.trade_details()?;

        let mut entry = serde_json::Map::new();
        match event {
            Event::Entry(_) => {
                entry.insert("phase".to_string(), json!("entry"));
            }
            _ => {
                entry.insert("phase".to_string(), json!("outcome"));
                entry.insert("outcome".to_string(), json!(event.kind()));
            }
        }
        entry.extend(trade.alert.clone());
        entry.insert("sizeMultiplier".to_string(), json!(trade.size_multiplier));
        entry.insert("loggedAt".to_string(), json!(Utc::now().to_rfc3339()));

        Some(Value::Object(entry))
    }

    async fn append(&self, entry: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.entries().await?;
        entries.insert(0, entry);
        entries.truncate(self.limit);

        let body = serde_json::to_string_pretty(&entries)?;
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

#[async_trait]
impl EventSink for ActivityLog {
    fn name(&self) -> &str {
        "activity_log"
    }

    async fn emit(&self, event: &Event) -> Result<()> {
        match Self::entry_for(event) {
            Some(entry) => self.append(entry).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TradeEvent;
    use crate::models::{Alert, Mode};

    fn temp_log() -> ActivityLog {
        let path = std::env::temp_dir().join(format!("activity-{}.json", uuid::Uuid::new_v4()));
        ActivityLog::new(path)
    }

    fn entry(signal: &str) -> Event {
        Event::Entry(TradeEvent::new(&Alert::new(signal).with_pair("ETHUSDT"), 1))
    }

    #[tokio::test]
    async fn test_records_trades_newest_first() {
        let log = temp_log();

        log.emit(&entry("Buy")).await.unwrap();
        log.emit(&Event::Tp(TradeEvent::new(&Alert::new("Buy TP"), 2))).await.unwrap();

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0]["phase"], "outcome");
        assert_eq!(entries[0]["outcome"], "tp");
        assert_eq!(entries[0]["signal"], "Buy TP");
        assert_eq!(entries[0]["sizeMultiplier"], 2);

        assert_eq!(entries[1]["phase"], "entry");
        assert_eq!(entries[1]["pair"], "ETHUSDT");
        assert!(entries[1]["loggedAt"].is_string());
        assert!(entries[1].get("outcome").is_none());

        tokio::fs::remove_file(log.path()).await.ok();
    }

    #[tokio::test]
    async fn test_state_events_not_logged() {
        let log = temp_log();
        log.emit(&Event::state(Mode::ArmedWaitEntry)).await.unwrap();

        assert!(log.entries().await.unwrap().is_empty());
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn test_log_is_capped() {
        let log = temp_log().with_limit(3);
        for i in 0..5 {
            log.emit(&entry(&format!("buy {i}"))).await.unwrap();
        }

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["signal"], "buy 4");
        assert_eq!(entries[2]["signal"], "buy 2");

        tokio::fs::remove_file(log.path()).await.ok();
    }

    #[tokio::test]
    async fn test_malformed_file_is_reset() {
        let log = temp_log();
        tokio::fs::write(log.path(), "{not json").await.unwrap();

        log.emit(&entry("Sell")).await.unwrap();

        let entries = log.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["signal"], "Sell");

        tokio::fs::remove_file(log.path()).await.ok();
    }
}
