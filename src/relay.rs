//! Alert pipeline: from an inbound alert to state, events and orders.
//!
//! Alerts for the same pair are processed strictly one after another. The
//! per-pair lock is held from loading the state until execution finishes,
//! so a second alert always sees the committed result of the first.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::db::{Database, StateStore};
use crate::events::{Event, EventFanout};
use crate::models::{Alert, CycleState, Mode, Signal, SignalError};
use crate::trading::{transition, Decision, ExecutionEngine, ExecutionReport, TradingConfig};

/// Errors that reject an alert.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    InvalidSignal(#[from] SignalError),

    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

/// Result of handling one alert.
#[derive(Debug, Clone, Serialize)]
pub struct HandleOutcome {
    pub pair: String,
    /// What the state machine did and why
    pub info: String,
    /// Mode after the alert
    pub mode: Mode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip)]
    pub execution: Option<ExecutionReport>,
}

/// Routes alerts through the state machine.
pub struct SignalRelay {
    config: TradingConfig,
    store: Arc<dyn StateStore>,
    events: EventFanout,

    /// Raw alert archive
    archive: Option<Arc<Database>>,

    /// None runs in dry-run mode
    engine: Option<Arc<ExecutionEngine>>,

    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SignalRelay {
    pub fn new(config: TradingConfig, store: Arc<dyn StateStore>, events: EventFanout) -> Self {
        Self {
            config,
            store,
            events,
            archive: None,
            engine: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_archive(mut self, archive: Arc<Database>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_engine(mut self, engine: Arc<ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.engine.is_none()
    }

    pub fn default_symbol(&self) -> &str {
        &self.config.default_symbol
    }

    /// Persisted state of `pair`.
    pub async fn current_state(&self, pair: &str) -> Result<CycleState, RelayError> {
        self.store.load(pair).await.map_err(RelayError::Persistence)
    }

    /// Process one inbound alert.
    pub async fn handle(&self, alert: &Alert) -> Result<HandleOutcome, RelayError> {
        let received_at = Utc::now();
        let pair = alert.symbol(&self.config.default_symbol);
        let signal = alert.to_signal(&self.config.default_symbol)?;

        self.archive_alert(alert, &pair, received_at).await;

        let lock = self.pair_lock(&pair).await;
        let guard = lock.lock().await;
        let outcome = self.process(alert, pair.clone(), &signal).await;
        drop(guard);
        self.release_lock(&pair, lock).await;
        outcome
    }

    /// Load, transition, save, emit and execute. Runs under the pair lock.
    async fn process(
        &self,
        alert: &Alert,
        pair: String,
        signal: &Signal,
    ) -> Result<HandleOutcome, RelayError> {
        let before = self.store.load(&pair).await.map_err(RelayError::Persistence)?;
        let step = transition(&before, signal);
        self.store
            .save(&pair, &step.state)
            .await
            .map_err(RelayError::Persistence)?;

        if let Some(decision) = &step.decision {
            self.events.emit(&Event::trade(decision, alert)).await;
        }
        if step.mode_changed(&before) {
            info!(pair = %pair, from = %before.mode, to = %step.state.mode, "Mode changed");
            self.events.emit(&Event::state(step.state.mode)).await;
        }

        let execution = match &step.decision {
            Some(decision) => {
                info!(
                    pair = %pair,
                    signal = %signal.text,
                    action = decision.tag(),
                    size_multiplier = decision.size_multiplier(),
                    "{}",
                    step.narrative
                );
                self.execute(&pair, decision).await
            }
            None => {
                info!(
                    pair = %pair,
                    signal = %signal.text,
                    recognized = signal.is_recognized(),
                    mode = %step.state.mode,
                    "{}",
                    step.narrative
                );
                None
            }
        };

        Ok(HandleOutcome {
            pair,
            info: step.narrative,
            mode: step.state.mode,
            decision: step.decision,
            execution,
        })
    }

    async fn execute(&self, pair: &str, decision: &Decision) -> Option<ExecutionReport> {
        let Some(engine) = &self.engine else {
            match decision {
                Decision::AcceptEntry { signal, size_multiplier } => info!(
                    pair = %pair,
                    side = ?signal.side,
                    size_multiplier = size_multiplier,
                    "[DRY RUN] Would open position"
                ),
                Decision::AcceptOutcome { kind, entry_side, .. } => info!(
                    pair = %pair,
                    outcome = kind.tag(),
                    entry_side = %entry_side,
                    "[DRY RUN] Would close position"
                ),
            }
            return None;
        };

        match engine.execute(pair, decision).await {
            Ok(report) => {
                if let ExecutionReport::NothingToClose { position, .. } = &report {
                    warn!(pair = %pair, position = %position, "Outcome accepted but no position was closed");
                }
                Some(report)
            }
            Err(e) => {
                error!(pair = %pair, action = decision.tag(), error = %e, "Execution failed");
                None
            }
        }
    }

    async fn archive_alert(&self, alert: &Alert, pair: &str, received_at: DateTime<Utc>) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.save_alert(alert, pair, received_at).await {
                warn!(pair = %pair, error = %e, "Failed to store raw alert");
            }
        }
    }

    async fn pair_lock(&self, pair: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(pair.to_string())
            .or_default()
            .clone()
    }

    /// Drop the pair's lock entry once nobody else holds or waits on it.
    async fn release_lock(&self, pair: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(pair);
        }
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Exchange, OrderResponse};
    use crate::db::MemoryStore;
    use crate::events::Broadcaster;
    use crate::models::Side;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    /// Exchange fake holding a single position.
    struct PaperExchange {
        position: StdMutex<Decimal>,
        orders: StdMutex<Vec<(Side, Decimal, bool)>>,
    }

    impl PaperExchange {
        fn new() -> Self {
            Self {
                position: StdMutex::new(Decimal::ZERO),
                orders: StdMutex::new(Vec::new()),
            }
        }

        fn orders(&self) -> Vec<(Side, Decimal, bool)> {
            self.orders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Exchange for PaperExchange {
        async fn price(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            Ok(dec!(2000))
        }

        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> anyhow::Result<()> {
            Ok(())
        }

        async fn market_order(
            &self,
            _symbol: &str,
            side: Side,
            quantity: Decimal,
            reduce_only: bool,
        ) -> anyhow::Result<OrderResponse> {
            let signed = match side {
                Side::Buy => quantity,
                Side::Sell => -quantity,
            };
            *self.position.lock().unwrap() += signed;
            self.orders.lock().unwrap().push((side, quantity, reduce_only));

            Ok(OrderResponse {
                order_id: 1,
                status: "FILLED".to_string(),
                avg_price: Some(dec!(2000)),
            })
        }

        async fn position_amount(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            Ok(*self.position.lock().unwrap())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl StateStore for BrokenStore {
        async fn load(&self, _pair: &str) -> anyhow::Result<CycleState> {
            Err(anyhow!("database is locked"))
        }

        async fn save(&self, _pair: &str, _state: &CycleState) -> anyhow::Result<()> {
            Err(anyhow!("database is locked"))
        }
    }

    fn relay_with(exchange: Option<Arc<PaperExchange>>) -> (SignalRelay, Broadcaster) {
        let broadcaster = Broadcaster::new();
        let events = EventFanout::new().with_sink(Arc::new(broadcaster.clone()));
        let config = TradingConfig::default();

        let mut relay = SignalRelay::new(config.clone(), Arc::new(MemoryStore::new()), events);
        if let Some(exchange) = exchange {
            relay = relay.with_engine(Arc::new(ExecutionEngine::new(config, exchange)));
        }
        (relay, broadcaster)
    }

    async fn feed(relay: &SignalRelay, signals: &[&str]) -> Vec<HandleOutcome> {
        let mut outcomes = Vec::new();
        for signal in signals {
            outcomes.push(relay.handle(&Alert::new(signal)).await.unwrap());
        }
        outcomes
    }

    #[tokio::test]
    async fn test_cycle_places_and_closes_trade() {
        let exchange = Arc::new(PaperExchange::new());
        let (relay, _) = relay_with(Some(exchange.clone()));

        let outcomes = feed(&relay, &["Buy SL", "Sell TP", "Sell", "Sell TP"]).await;

        assert_eq!(outcomes[2].mode, Mode::InTradeWaitOutcome);
        assert!(matches!(outcomes[2].execution, Some(ExecutionReport::Opened { .. })));
        assert!(matches!(outcomes[3].execution, Some(ExecutionReport::Closed { .. })));
        assert_eq!(outcomes[3].mode, Mode::AsideWaitLoss);

        assert_eq!(
            exchange.orders(),
            vec![(Side::Sell, dec!(0.01), false), (Side::Buy, dec!(0.01), true)]
        );
    }

    #[tokio::test]
    async fn test_events_follow_trade_then_state_order() {
        let (relay, broadcaster) = relay_with(None);
        let mut rx = broadcaster.subscribe();

        feed(&relay, &["buy sl", "buy tp", "buy"]).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["state", "state", "entry", "state"]);
    }

    #[tokio::test]
    async fn test_ignored_signal_emits_nothing() {
        let (relay, broadcaster) = relay_with(None);
        let mut rx = broadcaster.subscribe();

        let outcome = relay.handle(&Alert::new("buy")).await.unwrap();

        assert_eq!(outcome.mode, Mode::AsideWaitLoss);
        assert!(outcome.decision.is_none());
        assert_eq!(outcome.info, "Aside: waiting for a loss (SL) before arming.");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dry_run_still_advances_state() {
        let (relay, _) = relay_with(None);
        assert!(relay.is_dry_run());

        let outcomes = feed(&relay, &["sell sl", "sell tp", "buy"]).await;

        assert!(outcomes[2].decision.is_some());
        assert!(outcomes[2].execution.is_none());
        let state = relay.current_state("ETHUSDT").await.unwrap();
        assert_eq!(state.mode, Mode::InTradeWaitOutcome);
    }

    #[tokio::test]
    async fn test_invalid_signal_is_rejected_without_state_change() {
        let (relay, _) = relay_with(None);

        let mut blank = Alert::new("   ");
        assert!(matches!(
            relay.handle(&blank).await,
            Err(RelayError::InvalidSignal(_))
        ));
        blank.signal = None;
        assert!(matches!(
            relay.handle(&blank).await,
            Err(RelayError::InvalidSignal(_))
        ));

        assert_eq!(relay.current_state("ETHUSDT").await.unwrap(), CycleState::default());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        let events = EventFanout::new().with_sink(Arc::new(broadcaster.clone()));
        let relay = SignalRelay::new(TradingConfig::default(), Arc::new(BrokenStore), events);

        let result = relay.handle(&Alert::new("buy sl")).await;

        assert!(matches!(result, Err(RelayError::Persistence(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pairs_are_independent() {
        let (relay, _) = relay_with(None);

        relay.handle(&Alert::new("buy sl").with_pair("btcusdt")).await.unwrap();

        let btc = relay.current_state("BTCUSDT").await.unwrap();
        let eth = relay.current_state("ETHUSDT").await.unwrap();
        assert_eq!(btc.mode, Mode::WaitProfitAfterLoss);
        assert_eq!(eth.mode, Mode::AsideWaitLoss);
    }

    #[tokio::test]
    async fn test_concurrent_entries_accept_exactly_one() {
        let (relay, _) = relay_with(None);
        let relay = Arc::new(relay);
        feed(&relay, &["sell sl", "sell tp"]).await;

        let handles: Vec<_> = ["buy", "sell", "buy", "sell"]
            .into_iter()
            .map(|s| {
                let relay = relay.clone();
                tokio::spawn(async move { relay.handle(&Alert::new(s)).await.unwrap() })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().decision.is_some() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(relay.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_idle_pair_locks_are_released() {
        let (relay, _) = relay_with(None);
        let relay = Arc::new(relay);

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let relay = relay.clone();
                tokio::spawn(async move {
                    let alert = Alert::new("buy sl").with_pair(&format!("PAIR{}USDT", i % 10));
                    relay.handle(&alert).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(relay.lock_count().await, 0);

        let failing = SignalRelay::new(
            TradingConfig::default(),
            Arc::new(BrokenStore),
            EventFanout::new(),
        );
        assert!(failing.handle(&Alert::new("buy")).await.is_err());
        assert_eq!(failing.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_third_loss_halts_and_reports_trade_multiplier() {
        let seeded = CycleState {
            mode: Mode::InTradeWaitOutcome,
            pending_entry: Some(Signal::parse("sell", "ETHUSDT").unwrap()),
            consecutive_losses: 2,
            size_multiplier: 2,
            halt_profit_count: 0,
        };
        let store = MemoryStore::new().with_state("ETHUSDT", seeded).await;
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        let events = EventFanout::new().with_sink(Arc::new(broadcaster.clone()));
        let relay = SignalRelay::new(TradingConfig::default(), Arc::new(store), events);

        let outcome = relay.handle(&Alert::new("Sell SL")).await.unwrap();

        assert_eq!(outcome.mode, Mode::HaltUntilTwoProfits);
        let sl = rx.try_recv().unwrap();
        assert_eq!(sl.kind(), "sl");
        assert_eq!(sl.to_json()["sizeMultiplier"], 2);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::State { mode: Mode::HaltUntilTwoProfits, .. }
        ));
    }

    #[tokio::test]
    async fn test_raw_alerts_archived() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (relay, _) = relay_with(None);
        let relay = relay.with_archive(db.clone());

        feed(&relay, &["Buy", "hello"]).await;

        assert_eq!(db.alert_count().await.unwrap(), 2);
    }
}
