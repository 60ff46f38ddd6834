//! External collaborator interfaces: broker gateway, price feed, notifier.
//!
//! The core never talks HTTP directly; it goes through these traits so the
//! trading logic can be exercised against in-process fakes. The production
//! implementations live in `ib_client` (IB proxy) and `data_client`.

mod data_client;
mod ib_client;
pub mod types;

pub use data_client::MarketDataClient;
pub use ib_client::IbClient;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::DailyBar;

/// A position as the broker reports it. Authoritative for existence,
/// share count, and cost basis.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: i64,
    pub avg_cost: Decimal,
}

/// Account-level figures from the broker.
#[derive(Debug, Clone)]
pub struct AccountSummary {
    pub net_liquidation: Decimal,
    pub total_cash: Decimal,
    pub buying_power: Decimal,
}

/// Result of placing an order with the broker.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: i64,
    pub status: String,
    pub avg_fill_price: Option<Decimal>,
}

/// Outcome of a stop modification attempt.
#[derive(Debug, Clone)]
pub struct StopModifyOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

/// Order execution and account state, backed by the IB proxy in production.
///
/// Implementations must tolerate repeated modify/cancel calls; the retry
/// layers above assume a re-sent request cannot corrupt broker state.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn place_buy_order(&self, symbol: &str, qty: i64) -> Result<OrderResult>;

    async fn place_sell_order(&self, symbol: &str, qty: i64) -> Result<OrderResult>;

    /// Place a new GTC protective stop (sell) order.
    async fn place_stop_order(&self, symbol: &str, qty: i64, stop_price: Decimal)
        -> Result<OrderResult>;

    /// Modify an existing stop order to a new stop price.
    async fn modify_stop_price(
        &self,
        order_id: i64,
        symbol: &str,
        qty: i64,
        old_stop: Decimal,
        new_stop: Decimal,
    ) -> Result<StopModifyOutcome>;

    async fn cancel_order(&self, order_id: i64) -> Result<()>;

    /// All non-zero holdings currently reported by the broker.
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    async fn get_account_summary(&self) -> Result<AccountSummary>;

    /// Fast liveness probe; must return quickly even when the gateway is sick.
    async fn check_health(&self) -> Result<bool>;
}

/// Quotes and historical daily bars.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<Decimal>;

    async fn get_daily_bars(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBar>>;
}

/// Fire-and-forget operational notifications. Failures are logged by the
/// notifier task, never propagated into core logic.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}
