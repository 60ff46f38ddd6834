//! Market data client: current quotes and historical daily bars.
//!
//! Quote and bar fetches retry transparently on transient failures with a
//! short exponential backoff; callers see a single success or failure.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{BarResponse, QuoteResponse};
use super::PriceFeed;
use crate::models::DailyBar;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP price feed backed by the market data service.
pub struct MarketDataClient {
    client: Client,
    base_url: String,
}

impl MarketDataClient {
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

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..ExponentialBackoff::default()
        }
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let result = backoff::future::retry(Self::retry_policy(), || async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(anyhow::Error::from(e)))?;

            if response.status().is_server_error() {
                let status = response.status();
                warn!(url = %url, status = %status, "Transient data service error, retrying");
                return Err(backoff::Error::transient(anyhow::anyhow!(
                    "data service returned {}",
                    status
                )));
            }

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(anyhow::anyhow!(
                    "data request failed: {} - {}",
                    status,
                    body
                )));
            }

            response
                .json::<T>()
                .await
                .map_err(|e| backoff::Error::permanent(anyhow::Error::from(e)))
        })
        .await?;

        Ok(result)
    }
}

#[async_trait]
impl PriceFeed for MarketDataClient {
    async fn get_quote(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/quote/{}", self.base_url, symbol);
        debug!(url = %url, "Fetching quote");

        let quote: QuoteResponse = self.fetch_json(&url).await?;

        Decimal::try_from(quote.price)
            .with_context(|| format!("Invalid quote price for {}: {}", symbol, quote.price))
    }

    async fn get_daily_bars(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyBar>> {
        let url = format!(
            "{}/bars/{}/daily?from={}&to={}",
            self.base_url, symbol, from, to
        );
        debug!(url = %url, "Fetching daily bars");

        let items: Vec<BarResponse> = self.fetch_json(&url).await?;

        let mut bars = Vec::with_capacity(items.len());
        for item in items {
            let date = NaiveDate::parse_from_str(&item.date, "%Y-%m-%d")
                .with_context(|| format!("Invalid bar date: {}", item.date))?;

            let to_dec = |v: f64, field: &str| {
                Decimal::try_from(v)
                    .with_context(|| format!("Invalid {} for {} on {}: {}", field, symbol, date, v))
            };

            bars.push(DailyBar {
                date,
                open: to_dec(item.open, "open")?,
                high: to_dec(item.high, "high")?,
                low: to_dec(item.low, "low")?,
                close: to_dec(item.close, "close")?,
                volume: item.volume,
            });
        }

        // Structural analysis assumes chronological order
        bars.sort_by_key(|b| b.date);

        Ok(bars)
    }
}
