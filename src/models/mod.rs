//! Data models for alerts, signals and the trading-cycle state.

mod cycle_state;
mod signal;

pub use cycle_state::{CycleState, Mode};
pub use signal::{Alert, Side, Signal, SignalError, SignalKind};
