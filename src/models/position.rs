//! Position model for a held equity lot and its protective stop state.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a position.
///
/// `Pending` exists only between order placement and broker fill
/// confirmation; everything downstream operates on `Open` positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "pending",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PositionStatus::Pending),
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// Account trading mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paper" => Some(TradingMode::Paper),
            "live" => Some(TradingMode::Live),
            _ => None,
        }
    }
}

/// An equity position with its trailing-stop metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Ledger row id
    pub id: i64,

    pub symbol: String,

    /// Share count; authoritative from the broker while open
    pub shares: i64,

    /// Average cost per share; authoritative from the broker while open
    pub entry_price: Decimal,

    /// Current protective stop. Monotonically non-decreasing while open.
    pub stop_price: Decimal,

    /// Stop at entry time, kept for R-multiple reporting
    pub initial_stop_price: Decimal,

    /// Most recent significant swing high (close basis)
    pub structural_high: Option<Decimal>,

    /// Lowest low of the pullback following the structural high
    pub structural_low: Option<Decimal>,

    pub structural_high_date: Option<NaiveDate>,

    pub current_price: Decimal,

    /// Highest price observed since entry
    pub highest_price: Decimal,

    pub status: PositionStatus,

    /// Broker order id of the entry order
    pub broker_order_id: Option<i64>,

    /// Broker order id of the live protective stop order, if one exists
    pub stop_order_id: Option<i64>,

    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,

    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Current market value of the lot.
    pub fn market_value(&self) -> Decimal {
        Decimal::from(self.shares) * self.current_price
    }

    /// Unrealized P&L at the current price.
    pub fn unrealized_pnl(&self) -> Decimal {
        Decimal::from(self.shares) * (self.current_price - self.entry_price)
    }

    /// Dollar amount risked at entry (entry to initial stop).
    pub fn initial_risk(&self) -> Decimal {
        Decimal::from(self.shares) * (self.entry_price - self.initial_stop_price)
    }

    /// Realized profit expressed as a multiple of the initial risk.
    pub fn r_multiple(&self) -> Option<Decimal> {
        let risk = self.initial_risk();
        match (self.realized_pnl, risk > Decimal::ZERO) {
            (Some(pnl), true) => Some((pnl / risk).round_dp(2)),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position() -> Position {
        Position {
            id: 1,
            symbol: "XYZ".to_string(),
            shares: 100,
            entry_price: dec!(50),
            stop_price: dec!(47.50),
            initial_stop_price: dec!(47.50),
            structural_high: None,
            structural_low: None,
            structural_high_date: None,
            current_price: dec!(55),
            highest_price: dec!(56),
            status: PositionStatus::Open,
            broker_order_id: Some(101),
            stop_order_id: Some(102),
            exit_price: None,
            realized_pnl: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn test_unrealized_pnl() {
        let pos = make_position();
        assert_eq!(pos.market_value(), dec!(5500));
        assert_eq!(pos.unrealized_pnl(), dec!(500));
    }

    #[test]
    fn test_r_multiple() {
        let mut pos = make_position();
        // Risked $2.50/share on 100 shares = $250
        assert_eq!(pos.initial_risk(), dec!(250));

        pos.realized_pnl = Some(dec!(500));
        assert_eq!(pos.r_multiple(), Some(dec!(2)));

        pos.realized_pnl = Some(dec!(-250));
        assert_eq!(pos.r_multiple(), Some(dec!(-1)));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            PositionStatus::Pending,
            PositionStatus::Open,
            PositionStatus::Closed,
        ] {
            assert_eq!(PositionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PositionStatus::parse("bogus"), None);
    }
}
