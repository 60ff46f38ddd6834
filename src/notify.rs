//! Operator notifications for trading events.
//!
//! Events are formatted here and pushed through an unbounded channel to a
//! background task, so a slow or dead webhook can never block a trading path.
//! With no webhook configured the handle is disabled and sends are no-ops.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::Notifier;

/// Domain events worth telling the operator about.
#[derive(Debug, Clone)]
pub enum NotifyEvent {
    PositionOpened {
        symbol: String,
        shares: i64,
        fill_price: Decimal,
        stop_price: Decimal,
    },
    PositionClosed {
        symbol: String,
        shares: i64,
        exit_price: Decimal,
        pnl: Decimal,
        r_multiple: Option<Decimal>,
    },
    StopRaised {
        symbol: String,
        old_stop: Decimal,
        new_stop: Decimal,
    },
    StopUpdateQueued {
        symbol: String,
        new_stop: Decimal,
        error: String,
    },
    StopUpdateFailed {
        symbol: String,
        new_stop: Decimal,
        retries: i64,
    },
    ReconcileReport {
        synced: usize,
        closed: usize,
        updated: usize,
        errors: usize,
    },
    TradingPaused {
        reason: String,
    },
}

impl NotifyEvent {
    /// Render the operator-facing message.
    pub fn message(&self) -> String {
        match self {
            Self::PositionOpened {
                symbol,
                shares,
                fill_price,
                stop_price,
            } => format!(
                "Opened {} x{} @ {} (stop {})",
                symbol, shares, fill_price, stop_price
            ),
            Self::PositionClosed {
                symbol,
                shares,
                exit_price,
                pnl,
                r_multiple,
            } => {
                let r = r_multiple
                    .map(|r| format!(", {}R", r))
                    .unwrap_or_default();
                format!(
                    "Closed {} x{} @ {} (P&L {}{})",
                    symbol, shares, exit_price, pnl, r
                )
            }
            Self::StopRaised {
                symbol,
                old_stop,
                new_stop,
            } => format!("Stop raised {} {} -> {}", symbol, old_stop, new_stop),
            Self::StopUpdateQueued {
                symbol,
                new_stop,
                error,
            } => format!(
                "Stop update for {} to {} queued for catch-up: {}",
                symbol, new_stop, error
            ),
            Self::StopUpdateFailed {
                symbol,
                new_stop,
                retries,
            } => format!(
                "MANUAL ACTION NEEDED: stop update for {} to {} abandoned after {} retries",
                symbol, new_stop, retries
            ),
            Self::ReconcileReport {
                synced,
                closed,
                updated,
                errors,
            } => format!(
                "Reconciliation: {} synced, {} closed, {} updated, {} errors",
                synced, closed, updated, errors
            ),
            Self::TradingPaused { reason } => format!("Trading paused: {}", reason),
        }
    }
}

/// Cheap clonable handle for emitting events from anywhere in the bot.
#[derive(Clone)]
pub struct NotifyHandle {
    tx: Option<mpsc::UnboundedSender<NotifyEvent>>,
}

impl NotifyHandle {
    /// Handle that drops every event (no webhook configured, and tests).
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: NotifyEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                warn!("Notifier task is gone, dropping event");
            }
        }
    }
}

/// Spawn the background delivery task and return its handle.
pub fn spawn_notifier(notifier: Arc<dyn Notifier>) -> NotifyHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<NotifyEvent>();

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = event.message();
            debug!(text = %text, "Delivering notification");
            if let Err(e) = notifier.send(&text).await {
                warn!(error = %e, "Failed to deliver notification");
            }
        }
    });

    NotifyHandle { tx: Some(tx) }
}

/// Webhook notifier posting `{"text": "..."}` to a configured URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .context("Webhook request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Webhook returned {}", response.status());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_closed_message_includes_r_multiple() {
        let event = NotifyEvent::PositionClosed {
            symbol: "XYZ".to_string(),
            shares: 100,
            exit_price: dec!(55.00),
            pnl: dec!(475.00),
            r_multiple: Some(dec!(1.89)),
        };
        let msg = event.message();
        assert!(msg.contains("XYZ"));
        assert!(msg.contains("1.89R"));
    }

    #[test]
    fn test_disabled_handle_is_noop() {
        let handle = NotifyHandle::disabled();
        handle.send(NotifyEvent::TradingPaused {
            reason: "test".to_string(),
        });
    }
}
