//! Daily price bar as returned by the market data service.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One daily OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

impl DailyBar {
    /// Convenience constructor, mostly for tests and replay fixtures.
    pub fn new(date: NaiveDate, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume: 0,
        }
    }
}
