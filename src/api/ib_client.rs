//! HTTP client for the IB proxy (broker gateway).
//!
//! The proxy wraps IB Gateway behind a small REST surface; every call here
//! carries a bounded timeout so a hung gateway turns into an error instead
//! of a stalled job.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::types::{
    AccountResponse, HealthResponse, OrderResponse, PositionResponse, StatusResponse,
};
use super::{AccountSummary, BrokerGateway, BrokerPosition, OrderResult, StopModifyOutcome};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker gateway backed by the IB proxy REST API.
pub struct IbClient {
    client: Client,
    base_url: String,
}

impl IbClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Connection status as reported by the proxy, for operator display.
    pub async fn get_status(&self) -> Result<StatusResponse> {
        let response = self
            .client
            .get(self.url("/status"))
            .send()
            .await
            .context("Failed to fetch gateway status")?;

        response
            .json()
            .await
            .context("Failed to parse status response")
    }

    async fn post_order(&self, path: &str, body: serde_json::Value) -> Result<OrderResponse> {
        debug!(path = %path, "Submitting order request");

        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Order request to {} failed", path))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Order request failed: {} - {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse order response")
    }

    fn to_order_result(response: OrderResponse) -> Result<OrderResult> {
        if !response.success {
            anyhow::bail!(
                "Broker rejected order: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        let order_id = response
            .order_id
            .context("Broker response missing order id")?;

        Ok(OrderResult {
            order_id,
            status: response.status.unwrap_or_default(),
            avg_fill_price: response
                .avg_fill_price
                .and_then(|p| Decimal::try_from(p).ok()),
        })
    }
}

#[async_trait]
impl BrokerGateway for IbClient {
    async fn place_buy_order(&self, symbol: &str, qty: i64) -> Result<OrderResult> {
        let response = self
            .post_order("/order/buy", json!({ "symbol": symbol, "quantity": qty }))
            .await?;
        Self::to_order_result(response)
    }

    async fn place_sell_order(&self, symbol: &str, qty: i64) -> Result<OrderResult> {
        let response = self
            .post_order("/order/sell", json!({ "symbol": symbol, "quantity": qty }))
            .await?;
        Self::to_order_result(response)
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        qty: i64,
        stop_price: Decimal,
    ) -> Result<OrderResult> {
        let response = self
            .post_order(
                "/order/stop",
                json!({
                    "symbol": symbol,
                    "quantity": qty,
                    "stopPrice": stop_price,
                }),
            )
            .await?;
        Self::to_order_result(response)
    }

    async fn modify_stop_price(
        &self,
        order_id: i64,
        symbol: &str,
        qty: i64,
        old_stop: Decimal,
        new_stop: Decimal,
    ) -> Result<StopModifyOutcome> {
        debug!(
            order_id = order_id,
            symbol = %symbol,
            old_stop = %old_stop,
            new_stop = %new_stop,
            "Modifying stop order"
        );

        let response = self
            .client
            .put(self.url(&format!("/order/stop/{}", order_id)))
            .json(&json!({
                "symbol": symbol,
                "quantity": qty,
                "stopPrice": new_stop,
            }))
            .send()
            .await
            .context("Stop modify request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Ok(StopModifyOutcome {
                success: false,
                reason: Some(format!("{} - {}", status, body)),
            });
        }

        let parsed: OrderResponse = response
            .json()
            .await
            .context("Failed to parse stop modify response")?;

        Ok(StopModifyOutcome {
            success: parsed.success,
            reason: parsed.error,
        })
    }

    async fn cancel_order(&self, order_id: i64) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/order/cancel/{}", order_id)))
            .send()
            .await
            .context("Cancel request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Cancel failed: {} - {}", status, body);
        }

        Ok(())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let response = self
            .client
            .get(self.url("/positions"))
            .send()
            .await
            .context("Failed to fetch broker positions")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Positions request failed: {} - {}", status, body);
        }

        let items: Vec<PositionResponse> = response
            .json()
            .await
            .context("Failed to parse positions response")?;

        Ok(items
            .into_iter()
            .filter(|p| p.position != 0.0)
            .map(|p| BrokerPosition {
                symbol: p.symbol,
                qty: p.position as i64,
                avg_cost: Decimal::try_from(p.avg_cost).unwrap_or(Decimal::ZERO),
            })
            .collect())
    }

    async fn get_account_summary(&self) -> Result<AccountSummary> {
        let response = self
            .client
            .get(self.url("/account"))
            .send()
            .await
            .context("Failed to fetch account summary")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Account request failed: {} - {}", status, body);
        }

        let account: AccountResponse = response
            .json()
            .await
            .context("Failed to parse account response")?;

        let to_dec = |v: Option<f64>| {
            v.and_then(|f| Decimal::try_from(f).ok())
                .unwrap_or(Decimal::ZERO)
        };

        Ok(AccountSummary {
            net_liquidation: to_dec(account.net_liquidation),
            total_cash: to_dec(account.total_cash_value),
            buying_power: to_dec(account.buying_power),
        })
    }

    async fn check_health(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .context("Gateway health check failed")?;

        let health: HealthResponse = response
            .json()
            .await
            .context("Failed to parse health response")?;

        Ok(health.ib_connected)
    }
}
