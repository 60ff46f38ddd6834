//! Ledger/broker position reconciliation.
//!
//! The broker is authoritative for which positions exist, their share counts,
//! and cost basis. The ledger is authoritative for stop prices and structural
//! trailing-stop state. Planning is pure (no I/O) so the drift rules are
//! directly testable; applying the plan writes per symbol, best effort, so one
//! bad symbol cannot block repairs for the rest.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::api::{BrokerGateway, BrokerPosition, PriceFeed};
use crate::db::{format_db_time, Database, StoredPosition};
use crate::jobs::InFlightFlag;
use crate::notify::{NotifyEvent, NotifyHandle};

/// Cost-basis differences below this are broker rounding, not drift.
const COST_TOLERANCE: Decimal = dec!(0.01);

/// Minimum spacing between non-dry reconciliation runs.
const MIN_RUN_SPACING: Duration = Duration::from_secs(60);

/// Stop distance applied to positions the ledger has never seen.
const SYNC_STOP_PCT: Decimal = dec!(0.95);

/// Planned repair actions, computed without touching broker or ledger.
#[derive(Debug, Default, PartialEq)]
pub struct MergePlan {
    /// Broker positions with no open ledger row
    pub create: Vec<BrokerPosition>,
    /// Ledger position ids open locally but gone at the broker
    pub close: Vec<i64>,
    /// (position id, broker qty, broker cost) where the ledger has drifted
    pub update: Vec<(i64, i64, Decimal)>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.close.is_empty() && self.update.is_empty()
    }
}

/// Compare broker holdings against open ledger rows and plan the repairs.
pub fn merge(broker: &[BrokerPosition], ledger: &[StoredPosition]) -> MergePlan {
    let mut plan = MergePlan::default();

    for bp in broker {
        match ledger.iter().find(|lp| lp.symbol == bp.symbol) {
            // Only long holdings are adopted; a broker-side short has no
            // place in this book and must not grow a stop order
            None if bp.qty > 0 => plan.create.push(bp.clone()),
            None => {}
            Some(lp) => {
                let ledger_cost =
                    Decimal::try_from(lp.entry_price).unwrap_or(Decimal::ZERO);
                let cost_drift = (bp.avg_cost - ledger_cost).abs() > COST_TOLERANCE;
                if lp.shares != bp.qty || cost_drift {
                    plan.update.push((lp.id, bp.qty, bp.avg_cost));
                }
            }
        }
    }

    for lp in ledger {
        if !broker.iter().any(|bp| bp.symbol == lp.symbol) {
            plan.close.push(lp.id);
        }
    }

    plan
}

/// What a reconciliation run did (or would do, in dry-run mode).
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub synced: Vec<String>,
    pub closed: Vec<String>,
    pub updated: Vec<String>,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.synced.is_empty()
            && self.closed.is_empty()
            && self.updated.is_empty()
            && self.errors.is_empty()
    }
}

pub struct PositionReconciler {
    db: Database,
    broker: Arc<dyn BrokerGateway>,
    prices: Arc<dyn PriceFeed>,
    notify: NotifyHandle,
    in_flight: InFlightFlag,
    last_run: Mutex<Option<Instant>>,
}

impl PositionReconciler {
    pub fn new(
        db: Database,
        broker: Arc<dyn BrokerGateway>,
        prices: Arc<dyn PriceFeed>,
        notify: NotifyHandle,
    ) -> Self {
        Self {
            db,
            broker,
            prices,
            notify,
            in_flight: InFlightFlag::new("reconcile"),
            last_run: Mutex::new(None),
        }
    }

    /// Run a reconciliation pass. Dry runs report the plan without writing
    /// and are exempt from the run-spacing limit.
    pub async fn reconcile(&self, dry_run: bool) -> Result<ReconcileReport> {
        let _guard = self
            .in_flight
            .try_acquire()
            .context("Reconciliation already in progress")?;

        if !dry_run {
            let last = self.last_run.lock().ok().and_then(|l| *l);
            if let Some(last) = last {
                if last.elapsed() < MIN_RUN_SPACING {
                    anyhow::bail!(
                        "Reconciliation ran {}s ago, minimum spacing is {}s",
                        last.elapsed().as_secs(),
                        MIN_RUN_SPACING.as_secs()
                    );
                }
            }
        }

        let broker_positions = self
            .broker
            .get_positions()
            .await
            .context("Failed to fetch broker positions")?;
        let ledger_positions = self.db.get_open_positions().await?;

        let plan = merge(&broker_positions, &ledger_positions);

        info!(
            broker = broker_positions.len(),
            ledger = ledger_positions.len(),
            create = plan.create.len(),
            close = plan.close.len(),
            update = plan.update.len(),
            dry_run = dry_run,
            "Reconciliation plan"
        );

        let mut report = ReconcileReport {
            dry_run,
            ..Default::default()
        };

        if dry_run {
            report.synced = plan.create.iter().map(|p| p.symbol.clone()).collect();
            for id in &plan.close {
                if let Some(p) = ledger_positions.iter().find(|lp| lp.id == *id) {
                    report.closed.push(p.symbol.clone());
                }
            }
            for (id, _, _) in &plan.update {
                if let Some(p) = ledger_positions.iter().find(|lp| lp.id == *id) {
                    report.updated.push(p.symbol.clone());
                }
            }
            return Ok(report);
        }

        for bp in &plan.create {
            match self.sync_position(bp).await {
                Ok(()) => report.synced.push(bp.symbol.clone()),
                Err(e) => {
                    warn!(symbol = %bp.symbol, error = %e, "Failed to sync broker position");
                    report.errors.push(format!("{}: {}", bp.symbol, e));
                }
            }
        }

        for id in &plan.close {
            let Some(lp) = ledger_positions.iter().find(|p| p.id == *id) else {
                continue;
            };
            match self.close_stale(lp).await {
                Ok(()) => report.closed.push(lp.symbol.clone()),
                Err(e) => {
                    warn!(symbol = %lp.symbol, error = %e, "Failed to close stale position");
                    report.errors.push(format!("{}: {}", lp.symbol, e));
                }
            }
        }

        for (id, qty, cost) in &plan.update {
            let Some(lp) = ledger_positions.iter().find(|p| p.id == *id) else {
                continue;
            };
            let cost_f = cost.to_f64().unwrap_or(lp.entry_price);
            match self.db.update_position_fill(*id, *qty, cost_f).await {
                Ok(()) => {
                    info!(
                        symbol = %lp.symbol,
                        shares = qty,
                        cost = %cost,
                        "Repaired ledger drift from broker data"
                    );
                    report.updated.push(lp.symbol.clone());
                }
                Err(e) => report.errors.push(format!("{}: {}", lp.symbol, e)),
            }
        }

        // Refresh marks for positions that are in agreement; stale prices
        // only hurt reporting, so failures here are not errors
        for lp in &ledger_positions {
            let in_both = broker_positions.iter().any(|bp| bp.symbol == lp.symbol);
            if !in_both || plan.close.contains(&lp.id) {
                continue;
            }
            if let Ok(quote) = self.prices.get_quote(&lp.symbol).await {
                let _ = self
                    .db
                    .update_position_price(lp.id, quote.to_f64().unwrap_or(lp.current_price))
                    .await;
            }
        }

        if let Ok(mut last) = self.last_run.lock() {
            *last = Some(Instant::now());
        }
        self.db
            .set_meta("last_reconciliation", &format_db_time(Utc::now()))
            .await?;

        if !report.is_clean() {
            self.notify.send(NotifyEvent::ReconcileReport {
                synced: report.synced.len(),
                closed: report.closed.len(),
                updated: report.updated.len(),
                errors: report.errors.len(),
            });
        }

        Ok(report)
    }

    /// Adopt a broker position the ledger has never seen. The stop starts at
    /// a flat percentage below cost until the next reassessment tightens it.
    async fn sync_position(&self, bp: &BrokerPosition) -> Result<()> {
        let current = match self.prices.get_quote(&bp.symbol).await {
            Ok(q) => q,
            Err(e) => {
                warn!(symbol = %bp.symbol, error = %e, "Quote unavailable, using cost basis");
                bp.avg_cost
            }
        };

        let stop = (bp.avg_cost * SYNC_STOP_PCT).round_dp(2);
        let id = self
            .db
            .create_open_position(
                &bp.symbol,
                bp.qty,
                bp.avg_cost.to_f64().unwrap_or(0.0),
                stop.to_f64().unwrap_or(0.0),
                current.to_f64().unwrap_or(0.0),
            )
            .await?;

        info!(
            symbol = %bp.symbol,
            id = id,
            shares = bp.qty,
            cost = %bp.avg_cost,
            stop = %stop,
            "Synced broker position into ledger"
        );

        Ok(())
    }

    /// Close a ledger position the broker no longer holds (stop filled or
    /// manually sold outside the bot).
    async fn close_stale(&self, lp: &StoredPosition) -> Result<()> {
        let exit = match self.prices.get_quote(&lp.symbol).await {
            Ok(q) => q,
            Err(e) => {
                warn!(symbol = %lp.symbol, error = %e, "Quote unavailable, using last stop");
                Decimal::try_from(lp.stop_price).unwrap_or(Decimal::ZERO)
            }
        };

        let entry = Decimal::try_from(lp.entry_price).unwrap_or(Decimal::ZERO);
        let pnl = (exit - entry) * Decimal::from(lp.shares);

        self.db
            .close_position(
                lp.id,
                exit.to_f64().unwrap_or(0.0),
                pnl.to_f64().unwrap_or(0.0),
            )
            .await?;

        // The position left the broker without us, so any pending stop work
        // for it is moot
        if let Some(pending) = self.db.get_pending_update_for_position(lp.id).await? {
            self.db
                .mark_pending_failed(pending.id, "position closed during reconciliation")
                .await?;
        }

        info!(
            symbol = %lp.symbol,
            exit = %exit,
            pnl = %pnl.round_dp(2),
            "Closed position no longer held at broker"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use tokio::sync::Mutex as AsyncMutex;

    use crate::api::{AccountSummary, OrderResult, StopModifyOutcome};
    use crate::models::DailyBar;

    struct FakeBroker {
        positions: AsyncMutex<Vec<BrokerPosition>>,
        delay: Duration,
    }

    impl FakeBroker {
        fn new(positions: Vec<BrokerPosition>) -> Self {
            Self {
                positions: AsyncMutex::new(positions),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for FakeBroker {
        async fn place_buy_order(&self, _: &str, _: i64) -> Result<OrderResult> {
            anyhow::bail!("not used")
        }
        async fn place_sell_order(&self, _: &str, _: i64) -> Result<OrderResult> {
            anyhow::bail!("not used")
        }
        async fn place_stop_order(&self, _: &str, _: i64, _: Decimal) -> Result<OrderResult> {
            anyhow::bail!("not used")
        }
        async fn modify_stop_price(
            &self,
            _: i64,
            _: &str,
            _: i64,
            _: Decimal,
            _: Decimal,
        ) -> Result<StopModifyOutcome> {
            anyhow::bail!("not used")
        }
        async fn cancel_order(&self, _: i64) -> Result<()> {
            anyhow::bail!("not used")
        }
        async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.positions.lock().await.clone())
        }
        async fn get_account_summary(&self) -> Result<AccountSummary> {
            anyhow::bail!("not used")
        }
        async fn check_health(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct FakePrices;

    #[async_trait]
    impl PriceFeed for FakePrices {
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

    fn bp(symbol: &str, qty: i64, cost: Decimal) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            qty,
            avg_cost: cost,
        }
    }

    #[test]
    fn test_merge_is_pure_and_complete() {
        let broker = vec![bp("NEW", 100, dec!(47.50)), bp("DRIFT", 60, dec!(20.00))];
        let ledger_drift = StoredPosition {
            id: 7,
            symbol: "DRIFT".to_string(),
            shares: 50,
            entry_price: 20.0,
            stop_price: 19.0,
            initial_stop_price: 19.0,
            structural_high: None,
            structural_low: None,
            structural_high_date: None,
            current_price: 20.0,
            highest_price: 20.0,
            status: "open".to_string(),
            broker_order_id: None,
            stop_order_id: None,
            exit_price: None,
            realized_pnl: None,
            opened_at: "2026-08-01 10:00:00".to_string(),
            closed_at: None,
            updated_at: "2026-08-01 10:00:00".to_string(),
        };
        let ledger_stale = StoredPosition {
            id: 8,
            symbol: "GONE".to_string(),
            ..ledger_drift.clone()
        };

        let plan = merge(&broker, &[ledger_drift, ledger_stale]);

        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].symbol, "NEW");
        assert_eq!(plan.update, vec![(7, 60, dec!(20.00))]);
        assert_eq!(plan.close, vec![8]);
    }

    #[test]
    fn test_merge_ignores_broker_shorts() {
        let broker = vec![bp("SHRT", -100, dec!(30.00)), bp("LONG", 50, dec!(10.00))];

        let plan = merge(&broker, &[]);

        // The short must not be planned for adoption
        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.create[0].symbol, "LONG");
        assert!(plan.close.is_empty());
        assert!(plan.update.is_empty());
    }

    #[test]
    fn test_merge_tolerates_cost_rounding() {
        let broker = vec![bp("ABC", 100, dec!(20.005))];
        let ledger = StoredPosition {
            id: 1,
            symbol: "ABC".to_string(),
            shares: 100,
            entry_price: 20.0,
            stop_price: 19.0,
            initial_stop_price: 19.0,
            structural_high: None,
            structural_low: None,
            structural_high_date: None,
            current_price: 20.0,
            highest_price: 20.0,
            status: "open".to_string(),
            broker_order_id: None,
            stop_order_id: None,
            exit_price: None,
            realized_pnl: None,
            opened_at: "2026-08-01 10:00:00".to_string(),
            closed_at: None,
            updated_at: "2026-08-01 10:00:00".to_string(),
        };

        let plan = merge(&broker, &[ledger]);
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_sync_unknown_broker_position() {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(FakeBroker::new(vec![bp("XYZ", 100, dec!(47.50))]));
        let reconciler = PositionReconciler::new(
            db.clone(),
            broker,
            Arc::new(FakePrices),
            NotifyHandle::disabled(),
        );

        let report = reconciler.reconcile(false).await.unwrap();
        assert_eq!(report.synced, vec!["XYZ"]);

        let pos = db.get_open_position_by_symbol("XYZ").await.unwrap().unwrap();
        assert_eq!(pos.shares, 100);
        assert_eq!(pos.entry_price, 47.5);
        // Flat 5% below cost until reassessment runs (45.125 rounds to even)
        assert_eq!(pos.stop_price, 45.12);
    }

    #[tokio::test]
    async fn test_close_stale_ledger_position() {
        let db = Database::in_memory().await.unwrap();
        let id = db
            .create_open_position("ABC", 50, 40.0, 38.0, 40.0)
            .await
            .unwrap();
        db.upsert_pending_update(id, "ABC", 38.0, 39.0, "timeout")
            .await
            .unwrap();

        let broker = Arc::new(FakeBroker::new(Vec::new()));
        let reconciler = PositionReconciler::new(
            db.clone(),
            broker,
            Arc::new(FakePrices),
            NotifyHandle::disabled(),
        );

        let report = reconciler.reconcile(false).await.unwrap();
        assert_eq!(report.closed, vec!["ABC"]);

        let pos = db.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, "closed");
        assert_eq!(pos.exit_price, Some(50.0));
        assert_eq!(pos.realized_pnl, Some(500.0));

        // The queued stop update died with the position
        assert_eq!(db.count_pending_updates().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_is_idempotent_and_unlimited() {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(FakeBroker::new(vec![bp("XYZ", 100, dec!(47.50))]));
        let reconciler = PositionReconciler::new(
            db.clone(),
            broker,
            Arc::new(FakePrices),
            NotifyHandle::disabled(),
        );

        // Dry runs skip the spacing limit and never write
        for _ in 0..3 {
            let report = reconciler.reconcile(true).await.unwrap();
            assert!(report.dry_run);
            assert_eq!(report.synced, vec!["XYZ"]);
        }
        assert!(db.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_spacing_enforced() {
        let db = Database::in_memory().await.unwrap();
        let broker = Arc::new(FakeBroker::new(Vec::new()));
        let reconciler = PositionReconciler::new(
            db,
            broker,
            Arc::new(FakePrices),
            NotifyHandle::disabled(),
        );

        reconciler.reconcile(false).await.unwrap();
        let err = reconciler.reconcile(false).await.unwrap_err();
        assert!(err.to_string().contains("minimum spacing"));
    }

    #[tokio::test]
    async fn test_concurrent_run_refused() {
        let db = Database::in_memory().await.unwrap();
        let mut slow = FakeBroker::new(Vec::new());
        slow.delay = Duration::from_millis(200);
        let reconciler = Arc::new(PositionReconciler::new(
            db,
            Arc::new(slow),
            Arc::new(FakePrices),
            NotifyHandle::disabled(),
        ));

        let first = {
            let r = reconciler.clone();
            tokio::spawn(async move { r.reconcile(false).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = reconciler.reconcile(false).await;
        assert!(second.unwrap_err().to_string().contains("in progress"));

        assert!(first.await.unwrap().is_ok());
    }
}
