//! Wire DTOs for the IB proxy and market data service.
//!
//! Field names follow the proxy's JSON (camelCase), mapped here once so the
//! rest of the crate only sees the `api` domain types.

use serde::Deserialize;

/// One entry from `GET /positions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    pub symbol: String,
    pub position: f64,
    pub avg_cost: f64,
    #[serde(default)]
    pub account: Option<String>,
}

/// Response from order placement / modification endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    #[serde(default)]
    pub success: bool,
    pub order_id: Option<i64>,
    pub status: Option<String>,
    pub filled: Option<f64>,
    pub avg_fill_price: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `GET /account` summary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    #[serde(default)]
    pub account_id: Option<String>,
    pub net_liquidation: Option<f64>,
    pub available_funds: Option<f64>,
    pub buying_power: Option<f64>,
    pub total_cash_value: Option<f64>,
}

/// `GET /status` connection state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub trading_mode: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `GET /health` liveness probe.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub ib_connected: bool,
}

/// Quote from the market data service.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteResponse {
    pub symbol: String,
    pub price: f64,
}

/// Daily bar from the market data service.
#[derive(Debug, Clone, Deserialize)]
pub struct BarResponse {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: i64,
}
