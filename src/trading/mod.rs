//! Trading logic: signal state machine, position sizing, order execution.

mod config;
mod execution;
mod position_sizer;
pub mod state_machine;

pub use config::TradingConfig;
pub use execution::{ExecutionEngine, ExecutionReport};
pub use position_sizer::PositionSizer;
pub use state_machine::{transition, Decision};
