//! The exchange operations the execution engine relies on.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::Side;

use super::OrderResponse;

/// A futures exchange account.
///
/// Implemented by [`super::FuturesClient`] for the live exchange and by
/// recording fakes in tests.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Last traded price for `symbol`.
    async fn price(&self, symbol: &str) -> Result<Decimal>;

    /// Set the leverage used for new positions on `symbol`.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Place a market order. `reduce_only` orders can only shrink a position.
    async fn market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Result<OrderResponse>;

    /// Signed position amount: positive long, negative short, zero flat.
    async fn position_amount(&self, symbol: &str) -> Result<Decimal>;
}
