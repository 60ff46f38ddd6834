//! Domain models shared across the core subsystems.

mod bar;
mod position;

pub use bar::DailyBar;
pub use position::{Position, PositionStatus, TradingMode};
