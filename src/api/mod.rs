//! Futures exchange access: the `Exchange` seam and its signed REST client.

mod exchange;
mod futures_client;
mod types;

pub use exchange::Exchange;
pub use futures_client::FuturesClient;
pub use types::*;
