//! Trade alerts and the typed signals derived from them.
//!
//! Alert text is canonicalized (trimmed, lower-cased, whitespace collapsed)
//! and then classified into an entry or an outcome for a side. Anything
//! else is carried through as an unrecognized signal that never triggers
//! an action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while turning an alert into a signal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
}

/// Direction of an entry, or the entry an outcome refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Exchange order side.
    pub fn order_side(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    fn from_word(word: &str) -> Option<Side> {
        match word {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a recognized signal means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Entry,
    TakeProfit,
    StopLoss,
}

impl SignalKind {
    /// Short tag used in events: `entry`, `tp` or `sl`.
    pub fn tag(&self) -> &'static str {
        match self {
            SignalKind::Entry => "entry",
            SignalKind::TakeProfit => "tp",
            SignalKind::StopLoss => "sl",
        }
    }

    pub fn is_outcome(&self) -> bool {
        !matches!(self, SignalKind::Entry)
    }
}

/// Canonicalize raw alert text.
///
/// Lower-cases, trims and collapses internal whitespace runs to a single
/// space. Empty results are rejected.
pub fn normalize(raw: &str) -> Result<String, SignalError> {
    let text = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if text.is_empty() {
        return Err(SignalError::InvalidSignal("empty signal text".to_string()));
    }

    Ok(text)
}

/// A classified alert.
///
/// `kind` is `None` for text that is neither an entry nor an outcome; such
/// signals are passed through but never acted upon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub side: Option<Side>,
    pub kind: Option<SignalKind>,
    /// Normalized text, e.g. `"buy tp"`
    pub text: String,
    /// Trading pair the alert was for
    pub pair: String,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    /// Classify already-normalized text.
    pub fn classify(text: &str, pair: &str, received_at: DateTime<Utc>) -> Self {
        let (side, kind) = match Side::from_word(text) {
            Some(side) => (Some(side), Some(SignalKind::Entry)),
            None => Self::classify_outcome(text)
                .map(|(side, kind)| (side, Some(kind)))
                .unwrap_or((None, None)),
        };

        Self {
            side,
            kind,
            text: text.to_string(),
            pair: pair.to_string(),
            received_at,
        }
    }

    /// Normalize and classify raw text in one step.
    pub fn parse(raw: &str, pair: &str) -> Result<Self, SignalError> {
        let text = normalize(raw)?;
        Ok(Self::classify(&text, pair, Utc::now()))
    }

    /// Any text ending in ` tp` or ` sl` is an outcome. The side is only
    /// known when the rest is exactly `buy` or `sell`.
    fn classify_outcome(text: &str) -> Option<(Option<Side>, SignalKind)> {
        let (prefix, kind) = if let Some(prefix) = text.strip_suffix(" tp") {
            (prefix, SignalKind::TakeProfit)
        } else if let Some(prefix) = text.strip_suffix(" sl") {
            (prefix, SignalKind::StopLoss)
        } else {
            return None;
        };

        Some((Side::from_word(prefix), kind))
    }

    pub fn is_entry(&self) -> bool {
        self.kind == Some(SignalKind::Entry)
    }

    /// Outcome kind, if this signal reports a take-profit or stop-loss.
    pub fn outcome(&self) -> Option<SignalKind> {
        self.kind.filter(SignalKind::is_outcome)
    }

    pub fn is_recognized(&self) -> bool {
        self.kind.is_some()
    }
}

/// Inbound alert as posted by the alert source.
///
/// Only `signal` and `pair` are interpreted; every other field is kept
/// verbatim and handed on to events and the stored raw record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Alert {
    pub fn new(signal: &str) -> Self {
        Self {
            signal: Some(signal.to_string()),
            ..Default::default()
        }
    }

    pub fn with_pair(mut self, pair: &str) -> Self {
        self.pair = Some(pair.to_string());
        self
    }

    /// Trading pair for this alert, falling back to `default_symbol`.
    pub fn symbol(&self, default_symbol: &str) -> String {
        self.pair
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(default_symbol)
            .to_uppercase()
    }

    /// Normalize and classify this alert's signal text.
    pub fn to_signal(&self, default_symbol: &str) -> Result<Signal, SignalError> {
        let raw = self
            .signal
            .as_deref()
            .ok_or_else(|| SignalError::InvalidSignal("missing signal field".to_string()))?;
        Signal::parse(raw, &self.symbol(default_symbol))
    }

    /// The alert as a flat JSON object.
    pub fn to_json(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
