//! Trading configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for order sizing and exchange calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Symbol used when an alert carries no pair
    pub default_symbol: String,

    /// Margin per trade in USDT, before leverage and multiplier
    pub base_margin: Decimal,

    /// Smallest notional the exchange accepts
    pub min_notional: Decimal,

    /// Decimal places of the order quantity
    pub lot_precision: u32,

    /// Leverage for normal trades
    pub low_leverage: u32,

    /// Leverage for doubled trades
    pub high_leverage: u32,

    /// Positions smaller than this are treated as flat
    pub position_epsilon: Decimal,

    /// Upper bound for a single exchange call
    pub request_timeout_secs: u64,

    /// Retry budget for read-only exchange calls
    pub read_retry_max_elapsed_ms: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_symbol: "ETHUSDT".to_string(),
            base_margin: dec!(20),    // Binance min notional is 20 USDT
            min_notional: dec!(20),
            lot_precision: 3,
            low_leverage: 10,
            high_leverage: 20,
            position_epsilon: dec!(0.0001),
            request_timeout_secs: 10,
            read_retry_max_elapsed_ms: 3_000,
        }
    }
}

impl TradingConfig {
    /// Leverage tier for a size multiplier.
    pub fn leverage_for(&self, size_multiplier: u32) -> u32 {
        if size_multiplier == 2 {
            self.high_leverage
        } else {
            self.low_leverage
        }
    }
}
