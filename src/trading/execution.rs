//! Execution engine: turns accepted decisions into exchange orders.
//!
//! Entries are sized from the fixed margin and the cycle's multiplier,
//! then the leverage tier is set on a best-effort basis. Outcomes close whatever position is
//! live in the expected direction. Every remote call is bounded by a
//! timeout; read-only calls are retried with backoff, order and leverage
//! calls never are.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::{Exchange, OrderResponse};
use crate::models::Side;

use super::state_machine::Decision;
use super::{PositionSizer, TradingConfig};

/// Failures while executing a decision. None of them undo the state
/// transition that produced the decision.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("notional {notional} below exchange minimum {min}")]
    BelowMinNotional { notional: Decimal, min: Decimal },

    #[error("invalid quantity {0}")]
    InvalidQuantity(Decimal),

    #[error("failed to set leverage: {0}")]
    LeverageSetFailed(String),

    #[error("order failed: {0}")]
    OrderFailed(String),

    #[error("position query failed: {0}")]
    PositionQueryFailed(String),
}

/// What the engine did for a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionReport {
    Opened {
        symbol: String,
        side: Side,
        quantity: Decimal,
        leverage: u32,
        order_id: i64,
    },
    Closed {
        symbol: String,
        side: Side,
        quantity: Decimal,
        order_id: i64,
    },
    /// Live position did not point the expected way
    NothingToClose {
        symbol: String,
        position: Decimal,
    },
}

/// Executes decisions against an exchange.
pub struct ExecutionEngine {
    config: TradingConfig,
    exchange: Arc<dyn Exchange>,
    sizer: PositionSizer,

    /// Last leverage set per symbol
    leverage_cache: RwLock<HashMap<String, u32>>,
}

impl ExecutionEngine {
    pub fn new(config: TradingConfig, exchange: Arc<dyn Exchange>) -> Self {
        let sizer = PositionSizer::new(config.clone());
        Self {
            config,
            exchange,
            sizer,
            leverage_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Execute a decision for `symbol`.
    pub async fn execute(
        &self,
        symbol: &str,
        decision: &Decision,
    ) -> Result<ExecutionReport, ExecutionError> {
        match decision {
            Decision::AcceptEntry { signal, size_multiplier } => {
                let side = signal.side.ok_or_else(|| {
                    ExecutionError::OrderFailed(format!("entry {:?} has no side", signal.text))
                })?;
                self.open_entry(symbol, side, *size_multiplier).await
            }
            Decision::AcceptOutcome { entry_side, .. } => {
                self.close_position(symbol, *entry_side).await
            }
        }
    }

    /// Price, size, leverage, order.
    ///
    /// A failed leverage change is logged and the order still goes out at
    /// whatever leverage the account already has.
    pub async fn open_entry(
        &self,
        symbol: &str,
        side: Side,
        size_multiplier: u32,
    ) -> Result<ExecutionReport, ExecutionError> {
        let price = self.quote(symbol).await?;
        let quantity = self.sizer.size_order(size_multiplier, price)?;
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::InvalidQuantity(quantity));
        }

        let leverage = self.config.leverage_for(size_multiplier);
        if let Err(e) = self.ensure_leverage(symbol, leverage).await {
            warn!(symbol = %symbol, leverage = leverage, error = %e, "Placing order without leverage change");
        }

        let order = self.open_position(symbol, side, quantity).await?;

        Ok(ExecutionReport::Opened {
            symbol: symbol.to_string(),
            side,
            quantity,
            leverage,
            order_id: order.order_id,
        })
    }

    /// Current price of `symbol`.
    pub async fn quote(&self, symbol: &str) -> Result<Decimal, ExecutionError> {
        let price = self
            .read_with_retry(|| self.exchange.price(symbol))
            .await
            .map_err(ExecutionError::PriceUnavailable)?;

        if price <= Decimal::ZERO {
            return Err(ExecutionError::PriceUnavailable(format!(
                "non-positive price {} for {}",
                price, symbol
            )));
        }

        debug!(symbol = %symbol, price = %price, "Quoted price");
        Ok(price)
    }

    /// Set leverage unless the cache says it is already in place.
    pub async fn ensure_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExecutionError> {
        if self.leverage_cache.read().await.get(symbol) == Some(&leverage) {
            return Ok(());
        }

        self.bounded(self.exchange.set_leverage(symbol, leverage))
            .await
            .map_err(ExecutionError::LeverageSetFailed)?;

        self.leverage_cache
            .write()
            .await
            .insert(symbol.to_string(), leverage);

        info!(symbol = %symbol, leverage = leverage, "Leverage set");
        Ok(())
    }

    /// Place a market order opening a position.
    pub async fn open_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<OrderResponse, ExecutionError> {
        self.place(symbol, side, quantity, false).await
    }

    /// Close the position opened by an entry on `entry_side`.
    ///
    /// Only acts when the live position points the way the entry did; the
    /// closing order covers the whole live position.
    pub async fn close_position(
        &self,
        symbol: &str,
        entry_side: Side,
    ) -> Result<ExecutionReport, ExecutionError> {
        let position = self
            .read_with_retry(|| self.exchange.position_amount(symbol))
            .await
            .map_err(ExecutionError::PositionQueryFailed)?;

        let epsilon = self.config.position_epsilon;
        let matches = match entry_side {
            Side::Buy => position > epsilon,
            Side::Sell => position < -epsilon,
        };

        if !matches {
            warn!(
                symbol = %symbol,
                entry_side = %entry_side,
                position = %position,
                "No matching position to close"
            );
            return Ok(ExecutionReport::NothingToClose {
                symbol: symbol.to_string(),
                position,
            });
        }

        let side = entry_side.opposite();
        let quantity = self.sizer.round_lot(position.abs());
        let order = self.place(symbol, side, quantity, true).await?;

        Ok(ExecutionReport::Closed {
            symbol: symbol.to_string(),
            side,
            quantity,
            order_id: order.order_id,
        })
    }

    async fn place(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderResponse, ExecutionError> {
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::InvalidQuantity(quantity));
        }

        let order = self
            .bounded(self.exchange.market_order(symbol, side, quantity, reduce_only))
            .await
            .map_err(ExecutionError::OrderFailed)?;

        info!(
            symbol = %symbol,
            side = %side.order_side(),
            quantity = %quantity,
            reduce_only = reduce_only,
            order_id = order.order_id,
            status = %order.status,
            avg_price = ?order.avg_price,
            "Market order placed"
        );
        Ok(order)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// Run one remote call under the request timeout.
    async fn bounded<T, F>(&self, call: F) -> Result<T, String>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout(), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("timed out after {:?}", self.timeout())),
        }
    }

    /// Run a read-only call, retrying transient failures with backoff.
    async fn read_with_retry<T, F, Fut>(&self, call: F) -> Result<T, String>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_elapsed_time(Some(Duration::from_millis(
                self.config.read_retry_max_elapsed_ms,
            )))
            .build();

        backoff::future::retry(policy, || {
            let attempt = call();
            async move {
                self.bounded(attempt).await.map_err(|e| {
                    debug!(error = %e, "Read failed, retrying");
                    backoff::Error::transient(e)
                })
            }
        })
        .await
    }
}
