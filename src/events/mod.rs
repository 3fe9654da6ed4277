//! Trading events and the sinks they are delivered to.

mod activity_log;
mod broadcast;

pub use activity_log::ActivityLog;
pub use broadcast::Broadcaster;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::models::{Alert, Mode, SignalKind};
use crate::trading::Decision;

/// A trade accepted by the state machine, carrying the alert as received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeEvent {
    #[serde(flatten)]
    pub alert: Map<String, Value>,

    #[serde(rename = "sizeMultiplier")]
    pub size_multiplier: u32,
}

impl TradeEvent {
    pub fn new(alert: &Alert, size_multiplier: u32) -> Self {
        let mut fields = alert.to_json();
        // The event tag owns this key
        fields.remove("type");
        Self {
            alert: fields,
            size_multiplier,
        }
    }
}

/// Everything observers are told about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Entry(TradeEvent),
    Tp(TradeEvent),
    Sl(TradeEvent),
    State {
        mode: Mode,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Trade event for an accepted decision.
    pub fn trade(decision: &Decision, alert: &Alert) -> Self {
        let trade = TradeEvent::new(alert, decision.size_multiplier());
        match decision {
            Decision::AcceptEntry { .. } => Event::Entry(trade),
            Decision::AcceptOutcome {
                kind: SignalKind::StopLoss,
                ..
            } => Event::Sl(trade),
            Decision::AcceptOutcome { .. } => Event::Tp(trade),
        }
    }

    pub fn state(mode: Mode) -> Self {
        Event::State {
            mode,
            timestamp: Utc::now(),
        }
    }

    /// `entry`, `tp`, `sl` or `state`.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Entry(_) => "entry",
            Event::Tp(_) => "tp",
            Event::Sl(_) => "sl",
            Event::State { .. } => "state",
        }
    }

    pub fn trade_details(&self) -> Option<&TradeEvent> {
        match self {
            Event::Entry(t) | Event::Tp(t) | Event::Sl(t) => Some(t),
            Event::State { .. } => None,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Destination for events.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn emit(&self, event: &Event) -> anyhow::Result<()>;
}

/// Delivers each event to every registered sink.
///
/// A failing sink is logged and skipped; it never stops delivery to the
/// others or reaches the caller.
#[derive(Clone, Default)]
pub struct EventFanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn emit(&self, event: &Event) {
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                warn!(sink = sink.name(), event = event.kind(), error = %e, "Event sink failed");
            }
        }
    }
}
