//! Order sizing: fixed margin scaled by the cycle's size multiplier.

use rust_decimal::{Decimal, RoundingStrategy};

use super::execution::ExecutionError;
use super::TradingConfig;

/// Calculator for order quantities.
pub struct PositionSizer {
    config: TradingConfig,
}

impl PositionSizer {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    /// Notional committed for a multiplier: `base_margin * multiplier`.
    pub fn notional(&self, size_multiplier: u32) -> Decimal {
        self.config.base_margin * Decimal::from(size_multiplier)
    }

    /// Calculate the order quantity for `size_multiplier` at `price`.
    ///
    /// Fails with `BelowMinNotional` when the notional is under the exchange
    /// minimum. The quantity is rounded to the lot precision.
    pub fn size_order(&self, size_multiplier: u32, price: Decimal) -> Result<Decimal, ExecutionError> {
        let notional = self.notional(size_multiplier);
        if notional < self.config.min_notional {
            return Err(ExecutionError::BelowMinNotional {
                notional,
                min: self.config.min_notional,
            });
        }

        if price <= Decimal::ZERO {
            return Err(ExecutionError::PriceUnavailable(format!("non-positive price {price}")));
        }

        Ok(self.round_lot(notional / price))
    }

    /// Round a quantity to the lot precision.
    pub fn round_lot(&self, quantity: Decimal) -> Decimal {
        quantity
            .round_dp_with_strategy(self.config.lot_precision, RoundingStrategy::MidpointAwayFromZero)
            .normalize()
    }
}
