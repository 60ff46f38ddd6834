//! Order execution with broker verification.
//!
//! Entries and exits are never taken on faith: after an order is placed the
//! executor polls the broker's position list until the holding actually
//! appears (or disappears) and only then commits the ledger. The safety gate
//! is consulted before any entry.

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{BrokerGateway, PriceFeed};
use crate::db::Database;
use crate::notify::{NotifyEvent, NotifyHandle};
use crate::safety::SafetyGate;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Fill verification polls before giving up
    pub verify_attempts: usize,
    /// Spacing between verification polls
    pub verify_interval: Duration,
    /// Wait after a sell before checking the position is gone
    pub settle_delay: Duration,
    /// Initial stop distance when the caller does not provide one
    pub default_stop_pct: Decimal,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            verify_attempts: 6,
            verify_interval: Duration::from_secs(2),
            settle_delay: Duration::from_secs(2),
            default_stop_pct: dec!(0.05),  // 5% below fill
        }
    }
}

impl ExecutorConfig {
    /// Zero-wait variant for tests.
    pub fn fast() -> Self {
        Self {
            verify_interval: Duration::ZERO,
            settle_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

pub struct TradeExecutor {
    db: Database,
    broker: Arc<dyn BrokerGateway>,
    prices: Arc<dyn PriceFeed>,
    gate: Arc<SafetyGate>,
    notify: NotifyHandle,
    cfg: ExecutorConfig,
}

impl TradeExecutor {
    pub fn new(
        db: Database,
        broker: Arc<dyn BrokerGateway>,
        prices: Arc<dyn PriceFeed>,
        gate: Arc<SafetyGate>,
        notify: NotifyHandle,
        cfg: ExecutorConfig,
    ) -> Self {
        Self {
            db,
            broker,
            prices,
            gate,
            notify,
            cfg,
        }
    }

    /// Open a position: gate check, buy, verify the fill at the broker, then
    /// commit the ledger and place the protective stop.
    pub async fn open_position(
        &self,
        symbol: &str,
        shares: i64,
        stop: Option<Decimal>,
    ) -> Result<i64> {
        anyhow::ensure!(shares > 0, "Share count must be positive");

        if self.db.get_open_position_by_symbol(symbol).await?.is_some() {
            anyhow::bail!("Already holding an open position in {}", symbol);
        }

        let account = self
            .broker
            .get_account_summary()
            .await
            .context("Cannot read account before entry")?;

        let decision = self.gate.can_trade(account.net_liquidation).await;
        if let crate::safety::TradeDecision::Denied { reason } = decision {
            anyhow::bail!("Trade denied: {}", reason);
        }

        let quote = self
            .prices
            .get_quote(symbol)
            .await
            .with_context(|| format!("Cannot quote {} before entry", symbol))?;

        let size_check = self
            .gate
            .validate_position_size(shares, quote, account.net_liquidation)
            .await;
        if let crate::safety::TradeDecision::Denied { reason } = size_check {
            anyhow::bail!("Trade denied: {}", reason);
        }

        info!(symbol = %symbol, shares = shares, quote = %quote, "Placing entry order");

        let order = self
            .broker
            .place_buy_order(symbol, shares)
            .await
            .with_context(|| format!("Entry order for {} failed", symbol))?;

        let position_id = self
            .db
            .create_pending_position(
                symbol,
                shares,
                quote.to_f64().unwrap_or(0.0),
                order.order_id,
            )
            .await?;

        let filled = match self.verify_holding(symbol).await {
            Some(bp) => bp,
            None => {
                // No confirmed fill: drop the pending row so the ledger does
                // not claim shares the broker may never deliver
                self.db.delete_position(position_id).await?;
                anyhow::bail!(
                    "Entry order {} for {} was not confirmed filled; check the broker manually",
                    order.order_id,
                    symbol
                );
            }
        };

        let fill_price = if filled.avg_cost > Decimal::ZERO {
            filled.avg_cost
        } else {
            order.avg_fill_price.unwrap_or(quote)
        };
        let stop_price = stop
            .unwrap_or_else(|| (fill_price * (Decimal::ONE - self.cfg.default_stop_pct)).round_dp(2));

        self.db
            .confirm_position_open(
                position_id,
                filled.qty,
                fill_price.to_f64().unwrap_or(0.0),
                stop_price.to_f64().unwrap_or(0.0),
            )
            .await?;

        info!(
            symbol = %symbol,
            id = position_id,
            shares = filled.qty,
            fill = %fill_price,
            stop = %stop_price,
            "Position opened"
        );

        // Protective stop is best effort here; the reassessment job will
        // place one through the catch-up path if this fails
        match self
            .broker
            .place_stop_order(symbol, filled.qty, stop_price)
            .await
        {
            Ok(stop_order) => {
                self.db
                    .set_stop_order_id(position_id, Some(stop_order.order_id))
                    .await?;
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Initial stop placement failed, queueing");
                self.db
                    .upsert_pending_update(
                        position_id,
                        symbol,
                        0.0,
                        stop_price.to_f64().unwrap_or(0.0),
                        &e.to_string(),
                    )
                    .await?;
            }
        }

        self.notify.send(NotifyEvent::PositionOpened {
            symbol: symbol.to_string(),
            shares: filled.qty,
            fill_price,
            stop_price,
        });

        Ok(position_id)
    }

    /// Close a position: cancel the stop, sell, verify the holding is gone
    /// at the broker, then commit the exit to the ledger.
    pub async fn close_position(&self, symbol: &str) -> Result<Decimal> {
        let position = self
            .db
            .get_open_position_by_symbol(symbol)
            .await?
            .with_context(|| format!("No open position in {}", symbol))?;

        // A live stop would race the sell
        if let Some(stop_order_id) = position.stop_order_id {
            if let Err(e) = self.broker.cancel_order(stop_order_id).await {
                warn!(symbol = %symbol, error = %e, "Stop cancel failed, proceeding with sell");
            }
        }

        info!(symbol = %symbol, shares = position.shares, "Placing exit order");

        let order = self
            .broker
            .place_sell_order(symbol, position.shares)
            .await
            .with_context(|| format!("Exit order for {} failed", symbol))?;

        tokio::time::sleep(self.cfg.settle_delay).await;

        if let Some(residual) = self.verify_flat(symbol).await {
            let qty = if residual < 0 {
                "an unconfirmed number of".to_string()
            } else {
                residual.to_string()
            };
            anyhow::bail!(
                "Exit order {} for {} left {} shares at the broker; manual intervention required",
                order.order_id,
                symbol,
                qty
            );
        }

        let exit_price = match order.avg_fill_price {
            Some(p) if p > Decimal::ZERO => p,
            _ => match self.prices.get_quote(symbol).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "No exit quote, using last known price");
                    Decimal::try_from(position.current_price).unwrap_or(Decimal::ZERO)
                }
            },
        };

        let entry = Decimal::try_from(position.entry_price).unwrap_or(Decimal::ZERO);
        let pnl = ((exit_price - entry) * Decimal::from(position.shares)).round_dp(2);

        self.db
            .close_position(
                position.id,
                exit_price.to_f64().unwrap_or(0.0),
                pnl.to_f64().unwrap_or(0.0),
            )
            .await?;

        let mut domain = position.to_domain();
        domain.realized_pnl = Some(pnl);
        let r_multiple = domain.r_multiple();

        info!(
            symbol = %symbol,
            exit = %exit_price,
            pnl = %pnl,
            r_multiple = ?r_multiple,
            "Position closed"
        );

        self.notify.send(NotifyEvent::PositionClosed {
            symbol: symbol.to_string(),
            shares: position.shares,
            exit_price,
            pnl,
            r_multiple,
        });

        Ok(pnl)
    }

    /// Poll until the broker reports a non-zero holding for the symbol.
    async fn verify_holding(&self, symbol: &str) -> Option<crate::api::BrokerPosition> {
        for attempt in 0..self.cfg.verify_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.cfg.verify_interval).await;
            }

            match self.broker.get_positions().await {
                Ok(positions) => {
                    if let Some(bp) = positions.into_iter().find(|p| p.symbol == symbol && p.qty > 0)
                    {
                        return Some(bp);
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Fill verification poll failed");
                }
            }
        }

        None
    }

    /// Poll until the broker no longer reports the symbol. Returns the
    /// residual share count if it never clears.
    async fn verify_flat(&self, symbol: &str) -> Option<i64> {
        let mut residual = None;

        for attempt in 0..self.cfg.verify_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.cfg.verify_interval).await;
            }

            match self.broker.get_positions().await {
                Ok(positions) => {
                    match positions.iter().find(|p| p.symbol == symbol) {
                        None => return None,
                        Some(p) => residual = Some(p.qty),
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Flat verification poll failed");
                }
            }
        }

        residual.or(Some(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    use crate::api::{AccountSummary, BrokerPosition, OrderResult, StopModifyOutcome};
    use crate::models::DailyBar;
    use crate::safety::SafetyLimits;

    /// Broker whose position list is scripted by the test.
    struct ScriptedBroker {
        holdings: Mutex<Vec<BrokerPosition>>,
        fill_on_buy: bool,
        clear_on_sell: bool,
        fail_stop_orders: bool,
    }

    impl ScriptedBroker {
        fn new() -> Self {
            Self {
                holdings: Mutex::new(Vec::new()),
                fill_on_buy: true,
                clear_on_sell: true,
                fail_stop_orders: false,
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for ScriptedBroker {
        async fn place_buy_order(&self, symbol: &str, qty: i64) -> Result<OrderResult> {
            if self.fill_on_buy {
                self.holdings.lock().unwrap().push(BrokerPosition {
                    symbol: symbol.to_string(),
                    qty,
                    avg_cost: dec!(50.25),
                });
            }
            Ok(OrderResult {
                order_id: 9001,
                status: "Filled".to_string(),
                avg_fill_price: Some(dec!(50.25)),
            })
        }
        async fn place_sell_order(&self, symbol: &str, _: i64) -> Result<OrderResult> {
            if self.clear_on_sell {
                self.holdings.lock().unwrap().retain(|p| p.symbol != symbol);
            }
            Ok(OrderResult {
                order_id: 9002,
                status: "Filled".to_string(),
                avg_fill_price: Some(dec!(55.00)),
            })
        }
        async fn place_stop_order(&self, _: &str, _: i64, _: Decimal) -> Result<OrderResult> {
            if self.fail_stop_orders {
                anyhow::bail!("gateway timeout");
            }
            Ok(OrderResult {
                order_id: 9003,
                status: "Submitted".to_string(),
                avg_fill_price: None,
            })
        }
        async fn modify_stop_price(
            &self,
            _: i64,
            _: &str,
            _: i64,
            _: Decimal,
            _: Decimal,
        ) -> Result<StopModifyOutcome> {
            Ok(StopModifyOutcome {
                success: true,
                reason: None,
            })
        }
        async fn cancel_order(&self, _: i64) -> Result<()> {
            Ok(())
        }
        async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(self.holdings.lock().unwrap().clone())
        }
        async fn get_account_summary(&self) -> Result<AccountSummary> {
            Ok(AccountSummary {
                net_liquidation: dec!(100000),
                total_cash: dec!(50000),
                buying_power: dec!(50000),
            })
        }
        async fn check_health(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct FixedPrices;

    #[async_trait]
    impl PriceFeed for FixedPrices {
        async fn get_quote(&self, _: &str) -> Result<Decimal> {
            Ok(dec!(50.00))
        }
        async fn get_daily_bars(
            &self,
            _: &str,
            _: NaiveDate,
            _: NaiveDate,
        ) -> Result<Vec<DailyBar>> {
            Ok(Vec::new())
        }
    }

    fn make_executor(db: Database, broker: Arc<ScriptedBroker>) -> TradeExecutor {
        let gate = Arc::new(SafetyGate::new(
            db.clone(),
            SafetyLimits::default(),
            NotifyHandle::disabled(),
        ));
        TradeExecutor::new(
            db,
            broker,
            Arc::new(FixedPrices),
            gate,
            NotifyHandle::disabled(),
            ExecutorConfig::fast(),
        )
    }

    #[tokio::test]
    async fn test_open_commits_broker_fill() {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(ScriptedBroker::new());
        let executor = make_executor(db.clone(), broker);

        let id = executor.open_position("XYZ", 100, None).await.unwrap();

        let pos = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, "open");
        // Broker fill, not the quote estimate
        assert_eq!(pos.entry_price, 50.25);
        // Default stop 5% under fill: 50.25 * 0.95 = 47.7375 -> 47.74
        assert_eq!(pos.stop_price, 47.74);
        assert_eq!(pos.stop_order_id, Some(9003));
    }

    #[tokio::test]
    async fn test_open_with_explicit_stop() {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(ScriptedBroker::new());
        let executor = make_executor(db.clone(), broker);

        let id = executor
            .open_position("XYZ", 100, Some(dec!(48.00)))
            .await
            .unwrap();

        let pos = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.stop_price, 48.0);
    }

    #[tokio::test]
    async fn test_unverified_fill_leaves_no_ledger_row() {
        let db = Database::in_memory().await.unwrap();
        let mut broker = ScriptedBroker::new();
        broker.fill_on_buy = false;
        let executor = make_executor(db.clone(), Arc::new(broker));

        let err = executor.open_position("XYZ", 100, None).await.unwrap_err();
        assert!(err.to_string().contains("9001"));
        assert!(db.get_open_positions().await.unwrap().is_empty());
        assert!(db
            .get_open_position_by_symbol("XYZ")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_stop_placement_is_queued() {
        let db = Database::in_memory().await.unwrap();
        let mut broker = ScriptedBroker::new();
        broker.fail_stop_orders = true;
        let executor = make_executor(db.clone(), Arc::new(broker));

        let id = executor.open_position("XYZ", 100, None).await.unwrap();

        // Position opened despite the stop failure; the stop is queued
        let pos = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, "open");
        assert_eq!(pos.stop_order_id, None);
        assert_eq!(db.count_pending_updates().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_entry_refused() {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(ScriptedBroker::new());
        let executor = make_executor(db.clone(), broker);

        executor.open_position("XYZ", 100, None).await.unwrap();
        let err = executor.open_position("XYZ", 50, None).await.unwrap_err();
        assert!(err.to_string().contains("Already holding"));
    }

    #[tokio::test]
    async fn test_oversized_entry_denied() {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(ScriptedBroker::new());
        let executor = make_executor(db.clone(), broker);

        // 500 * 50 = 25k > 20% of 100k
        let err = executor.open_position("XYZ", 500, None).await.unwrap_err();
        assert!(err.to_string().contains("Trade denied"));
        assert!(db.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_records_pnl_and_r() {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(ScriptedBroker::new());
        let executor = make_executor(db.clone(), broker);

        executor.open_position("XYZ", 100, None).await.unwrap();
        let pnl = executor.close_position("XYZ").await.unwrap();

        // (55.00 - 50.25) * 100
        assert_eq!(pnl, dec!(475.00));

        let pos = db.get_open_position_by_symbol("XYZ").await.unwrap();
        assert!(pos.is_none());
    }

    #[tokio::test]
    async fn test_residual_shares_fail_the_close() {
        let db = Database::in_memory().await.unwrap();
        let mut broker = ScriptedBroker::new();
        broker.clear_on_sell = false;
        let executor = make_executor(db.clone(), Arc::new(broker));

        executor.open_position("XYZ", 100, None).await.unwrap();
        let err = executor.close_position("XYZ").await.unwrap_err();
        assert!(err.to_string().contains("manual intervention"));

        // Ledger still shows the position open
        let pos = db.get_open_position_by_symbol("XYZ").await.unwrap();
        assert!(pos.is_some());
    }
}
