//! Persistent trading-cycle state.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::Signal;

/// Phase of the loss/profit trading cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Idle; waiting for any stop-loss in the stream
    AsideWaitLoss,
    /// Saw a loss; waiting for any take-profit to arm
    WaitProfitAfterLoss,
    /// Take the very next entry
    ArmedWaitEntry,
    /// In a trade; waiting for its matching outcome
    InTradeWaitOutcome,
    /// Cooling off after a losing streak
    HaltUntilTwoProfits,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::AsideWaitLoss,
        Mode::WaitProfitAfterLoss,
        Mode::ArmedWaitEntry,
        Mode::InTradeWaitOutcome,
        Mode::HaltUntilTwoProfits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::AsideWaitLoss => "aside_wait_loss",
            Mode::WaitProfitAfterLoss => "wait_profit_after_loss",
            Mode::ArmedWaitEntry => "armed_wait_entry",
            Mode::InTradeWaitOutcome => "in_trade_wait_outcome",
            Mode::HaltUntilTwoProfits => "halt_until_two_profits",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown mode: {s}"))
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single live state record for a trading pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleState {
    pub mode: Mode,

    /// The accepted entry; present only while in a trade
    pub pending_entry: Option<Signal>,

    pub consecutive_losses: u32,

    /// 1, or 2 when armed after a losing streak
    pub size_multiplier: u32,

    /// Profits seen while halted, in [0, 2)
    pub halt_profit_count: u32,
}

impl Default for CycleState {
    fn default() -> Self {
        Self {
            mode: Mode::AsideWaitLoss,
            pending_entry: None,
            consecutive_losses: 0,
            size_multiplier: 1,
            halt_profit_count: 0,
        }
    }
}

impl CycleState {
    /// Whether every field holds a value the state machine can produce.
    pub fn is_consistent(&self) -> bool {
        let in_trade = self.mode == Mode::InTradeWaitOutcome;
        let entry_ok = match &self.pending_entry {
            Some(entry) => in_trade && entry.is_entry() && entry.side.is_some(),
            None => !in_trade,
        };

        entry_ok
            && (self.consecutive_losses >= 3) == (self.mode == Mode::HaltUntilTwoProfits)
            && matches!(self.size_multiplier, 1 | 2)
            && self.halt_profit_count < 2
            && (self.halt_profit_count == 0 || self.mode == Mode::HaltUntilTwoProfits)
    }

    /// Returns this state, or the initial state if it is inconsistent.
    pub fn repaired(self) -> Self {
        if self.is_consistent() {
            self
        } else {
            Self::default()
        }
    }
}
