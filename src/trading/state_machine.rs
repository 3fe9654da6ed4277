//! Signal state machine: decides which alerts become trades.
//!
//! The policy takes one trade at a time. After a loss is seen in the
//! alert stream it waits for a profit, then takes the very next entry and
//! follows that trade to its matching outcome. Two consecutive losing
//! trades double the next position; three halt trading until two profits
//! have been observed.
//!
//! [`transition`] is a pure function of the current state and a signal.
//! Persistence, serialization per pair and side effects live in the relay.

use serde::Serialize;

use crate::models::{CycleState, Mode, Side, Signal, SignalKind};

/// Consecutive losing trades that trigger the halt.
pub const HALT_AFTER_LOSSES: u32 = 3;

/// Profits required to leave the halt.
pub const PROFITS_TO_RESUME: u32 = 2;

/// Losing trades after which the next position is doubled.
pub const DOUBLE_AFTER_LOSSES: u32 = 2;

/// Action requested by an accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    /// Open a position for this entry
    AcceptEntry {
        signal: Signal,
        size_multiplier: u32,
    },
    /// Close the position opened for `entry_side`
    AcceptOutcome {
        kind: SignalKind,
        entry_side: Side,
        size_multiplier: u32,
    },
}

impl Decision {
    /// Event tag: `entry`, `tp` or `sl`.
    pub fn tag(&self) -> &'static str {
        match self {
            Decision::AcceptEntry { .. } => SignalKind::Entry.tag(),
            Decision::AcceptOutcome { kind, .. } => kind.tag(),
        }
    }

    pub fn size_multiplier(&self) -> u32 {
        match self {
            Decision::AcceptEntry { size_multiplier, .. }
            | Decision::AcceptOutcome { size_multiplier, .. } => *size_multiplier,
        }
    }
}

/// Result of applying one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: CycleState,
    pub decision: Option<Decision>,
    /// Human-readable account of what happened and why
    pub narrative: String,
}

impl Transition {
    fn stay(state: &CycleState, narrative: &str) -> Self {
        Self {
            state: state.clone(),
            decision: None,
            narrative: narrative.to_string(),
        }
    }

    fn to(state: CycleState, decision: Option<Decision>, narrative: &str) -> Self {
        Self {
            state,
            decision,
            narrative: narrative.to_string(),
        }
    }

    /// Whether the mode differs from `before`.
    pub fn mode_changed(&self, before: &CycleState) -> bool {
        self.state.mode != before.mode
    }
}

fn multiplier_for(consecutive_losses: u32) -> u32 {
    if consecutive_losses >= DOUBLE_AFTER_LOSSES {
        2
    } else {
        1
    }
}

/// Apply `signal` to `state`.
///
/// Total and deterministic: every mode handles every signal, and an
/// inconsistent `state` is first repaired to the initial state.
pub fn transition(state: &CycleState, signal: &Signal) -> Transition {
    let state = state.clone().repaired();

    match state.mode {
        Mode::AsideWaitLoss => match signal.outcome() {
            Some(SignalKind::StopLoss) => Transition::to(
                CycleState {
                    mode: Mode::WaitProfitAfterLoss,
                    ..state
                },
                None,
                "Loss observed; waiting for profit close to arm.",
            ),
            _ => Transition::stay(&state, "Aside: waiting for a loss (SL) before arming."),
        },

        Mode::WaitProfitAfterLoss => match signal.outcome() {
            Some(SignalKind::TakeProfit) => {
                let size_multiplier = multiplier_for(state.consecutive_losses);
                Transition::to(
                    CycleState {
                        mode: Mode::ArmedWaitEntry,
                        size_multiplier,
                        ..state
                    },
                    None,
                    "Armed: waiting for the very next entry (buy/sell).",
                )
            }
            _ => Transition::stay(&state, "Waiting for profit close (TP) to arm."),
        },

        Mode::ArmedWaitEntry => {
            if !signal.is_entry() {
                return Transition::stay(&state, "Armed: waiting for next entry.");
            }

            let decision = Decision::AcceptEntry {
                signal: signal.clone(),
                size_multiplier: state.size_multiplier,
            };
            Transition::to(
                CycleState {
                    mode: Mode::InTradeWaitOutcome,
                    pending_entry: Some(signal.clone()),
                    ..state
                },
                Some(decision),
                "Entry accepted; waiting for this trade outcome.",
            )
        }

        Mode::InTradeWaitOutcome => in_trade(state, signal),

        Mode::HaltUntilTwoProfits => match signal.outcome() {
            Some(SignalKind::TakeProfit) => {
                let halt_profit_count = state.halt_profit_count + 1;
                if halt_profit_count >= PROFITS_TO_RESUME {
                    Transition::to(
                        CycleState::default(),
                        None,
                        "Halt cleared after two profits; waiting for next loss (SL).",
                    )
                } else {
                    Transition::to(
                        CycleState {
                            halt_profit_count,
                            ..state
                        },
                        None,
                        "Halted: profit observed; one more needed to resume.",
                    )
                }
            }
            _ => Transition::stay(&state, "Halted: waiting for two profit closes (TP)."),
        },
    }
}

fn in_trade(state: CycleState, signal: &Signal) -> Transition {
    let entry_side = state.pending_entry.as_ref().and_then(|entry| entry.side);

    let (kind, entry_side) = match (signal.outcome(), entry_side) {
        (Some(kind), Some(side)) if signal.side == Some(side) => (kind, side),
        _ if signal.is_entry() => {
            return Transition::stay(
                &state,
                "Still in a trade; ignoring new entry until the current trade closes.",
            );
        }
        _ => {
            return Transition::stay(&state, "In-trade: signal not related to current trade outcome.");
        }
    };

    let decision = Some(Decision::AcceptOutcome {
        kind,
        entry_side,
        size_multiplier: state.size_multiplier,
    });

    match kind {
        SignalKind::TakeProfit => Transition::to(
            CycleState::default(),
            decision,
            "Trade closed in profit; reset and waiting for next loss (SL).",
        ),
        _ => {
            let consecutive_losses = state.consecutive_losses + 1;
            if consecutive_losses >= HALT_AFTER_LOSSES {
                Transition::to(
                    CycleState {
                        mode: Mode::HaltUntilTwoProfits,
                        pending_entry: None,
                        consecutive_losses,
                        size_multiplier: 1,
                        halt_profit_count: 0,
                    },
                    decision,
                    "Trade closed in loss; losing streak reached, halting until two profits.",
                )
            } else {
                Transition::to(
                    CycleState {
                        mode: Mode::WaitProfitAfterLoss,
                        pending_entry: None,
                        consecutive_losses,
                        size_multiplier: multiplier_for(consecutive_losses),
                        halt_profit_count: 0,
                    },
                    decision,
                    "Trade closed in loss; waiting for next profit close (TP) to arm.",
                )
            }
        }
    }
}
