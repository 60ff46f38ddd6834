//! Structural trailing-stop engine.
//!
//! `structure` holds the pure swing analysis over daily bars; `engine` wires
//! it to the ledger and broker, including the durable catch-up queue for stop
//! raises the broker refused.

pub mod engine;
pub mod structure;

pub use engine::{ReassessOutcome, TrailingStopEngine};
pub use structure::{analyze_structure, StructureDecision};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Tuning for the structural analysis and catch-up queue.
#[derive(Debug, Clone)]
pub struct TrailingConfig {
    /// Close must exceed the pullback low by this fraction to confirm a bounce
    pub bounce_confirm_pct: Decimal,
    /// Stop sits this fraction below the confirmed higher low
    pub stop_buffer_pct: Decimal,
    /// Extra days of bars fetched before the position's open date
    pub open_date_buffer_days: i64,
    /// Catch-up attempts before a queued stop update is abandoned
    pub max_catchup_retries: i64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            bounce_confirm_pct: dec!(0.02),  // 2% above the pullback low
            stop_buffer_pct: dec!(0.007),    // 0.7% below the higher low
            open_date_buffer_days: 5,
            max_catchup_retries: 10,
        }
    }
}

impl TrailingConfig {
    /// Buffer clamped to a sane band so a bad config cannot park the stop
    /// on top of the low or miles beneath it.
    pub fn stop_buffer(&self) -> Decimal {
        self.stop_buffer_pct.clamp(dec!(0.005), dec!(0.01))
    }
}
