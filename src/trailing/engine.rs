//! Trailing-stop reassessment and catch-up.
//!
//! Write-ahead rule: the broker's stop order is modified FIRST, and only a
//! broker acknowledgment updates the ledger. A failed broker write lands in
//! the durable catch-up queue instead, so the ledger can never claim a stop
//! the broker does not hold.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use super::structure::analyze_structure;
use super::TrailingConfig;
use crate::api::{BrokerGateway, PriceFeed};
use crate::db::{parse_db_time, Database, StoredPendingUpdate, StoredPosition};
use crate::jobs::InFlightFlag;
use crate::notify::{NotifyEvent, NotifyHandle};
use crate::retry::RetrySchedule;

pub const REASSESS_JOB: &str = "trailing_stop_reassessment";

/// Outcome of reassessing one position.
#[derive(Debug, Clone, PartialEq)]
pub enum ReassessOutcome {
    Raised { old_stop: Decimal, new_stop: Decimal },
    Unchanged { reason: String },
    Failed { reason: String },
}

impl ReassessOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Raised { .. } => "raised",
            Self::Unchanged { .. } => "unchanged",
            Self::Failed { .. } => "failed",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Self::Raised { old_stop, new_stop } => {
                Some(format!("{} -> {}", old_stop, new_stop))
            }
            Self::Unchanged { reason } | Self::Failed { reason } => Some(reason.clone()),
        }
    }
}

/// Totals for one reassessment run.
#[derive(Debug, Clone, Default)]
pub struct ReassessReport {
    pub checked: usize,
    pub raised: usize,
    pub unchanged: usize,
    pub failures: usize,
}

pub struct TrailingStopEngine {
    db: Database,
    broker: Arc<dyn BrokerGateway>,
    prices: Arc<dyn PriceFeed>,
    notify: NotifyHandle,
    cfg: TrailingConfig,
    retry: RetrySchedule,
    in_flight: InFlightFlag,
}

impl TrailingStopEngine {
    pub fn new(
        db: Database,
        broker: Arc<dyn BrokerGateway>,
        prices: Arc<dyn PriceFeed>,
        notify: NotifyHandle,
        cfg: TrailingConfig,
    ) -> Self {
        Self::with_retry(db, broker, prices, notify, cfg, RetrySchedule::default())
    }

    pub fn with_retry(
        db: Database,
        broker: Arc<dyn BrokerGateway>,
        prices: Arc<dyn PriceFeed>,
        notify: NotifyHandle,
        cfg: TrailingConfig,
        retry: RetrySchedule,
    ) -> Self {
        Self {
            db,
            broker,
            prices,
            notify,
            cfg,
            retry,
            in_flight: InFlightFlag::new(REASSESS_JOB),
        }
    }

    /// Reassess every open position sequentially, recording the run and each
    /// per-symbol outcome in the job audit tables.
    pub async fn reassess_all_positions(&self) -> Result<ReassessReport> {
        let _guard = self
            .in_flight
            .try_acquire()
            .context("Reassessment already in progress")?;

        let positions = self.db.get_open_positions().await?;
        let run_id = self.db.create_job_run(REASSESS_JOB).await?;

        info!(count = positions.len(), run_id = %run_id, "Starting trailing stop reassessment");

        let mut report = ReassessReport::default();
        for position in &positions {
            report.checked += 1;
            let outcome = match self.reassess_position(position).await {
                Ok(outcome) => outcome,
                Err(e) => ReassessOutcome::Failed {
                    reason: e.to_string(),
                },
            };

            match &outcome {
                ReassessOutcome::Raised { .. } => report.raised += 1,
                ReassessOutcome::Unchanged { .. } => report.unchanged += 1,
                ReassessOutcome::Failed { .. } => report.failures += 1,
            }

            if let Err(e) = self
                .db
                .append_job_item(
                    &run_id,
                    &position.symbol,
                    outcome.label(),
                    outcome.detail().as_deref(),
                )
                .await
            {
                warn!(symbol = %position.symbol, error = %e, "Failed to record job item");
            }
        }

        let status = if report.failures == 0 {
            "success"
        } else {
            "partial"
        };
        self.db
            .finalize_job_run(
                &run_id,
                status,
                report.checked as i64,
                report.raised as i64,
                report.failures as i64,
            )
            .await?;

        info!(
            checked = report.checked,
            raised = report.raised,
            failures = report.failures,
            status = status,
            "Reassessment complete"
        );

        Ok(report)
    }

    /// Run the structural analysis for one position and push any raise to the
    /// broker before the ledger.
    pub async fn reassess_position(&self, position: &StoredPosition) -> Result<ReassessOutcome> {
        let opened = parse_db_time(&position.opened_at).date_naive();
        let from = opened - Duration::days(self.cfg.open_date_buffer_days);
        let to = Utc::now().date_naive();

        let bars = self
            .prices
            .get_daily_bars(&position.symbol, from, to)
            .await
            .with_context(|| format!("Failed to fetch bars for {}", position.symbol))?;

        let current_stop = Decimal::try_from(position.stop_price).unwrap_or(Decimal::ZERO);

        // First pass for a position has no stored structure: seed the high
        // from the best price seen and back the low out of the current stop
        let structural_high = position
            .structural_high
            .and_then(|v| Decimal::try_from(v).ok())
            .unwrap_or_else(|| {
                Decimal::try_from(position.highest_price).unwrap_or(Decimal::ZERO)
            });
        let structural_low = position
            .structural_low
            .and_then(|v| Decimal::try_from(v).ok())
            .unwrap_or_else(|| {
                let buffer = Decimal::ONE - self.cfg.stop_buffer();
                if buffer > Decimal::ZERO {
                    (current_stop / buffer).round_dp(2)
                } else {
                    current_stop
                }
            });

        let decision = analyze_structure(&bars, structural_high, structural_low, current_stop, &self.cfg);

        let Some(new_stop) = decision.new_stop.filter(|_| decision.should_update) else {
            return Ok(ReassessOutcome::Unchanged {
                reason: decision.reason,
            });
        };

        info!(
            symbol = %position.symbol,
            old_stop = %current_stop,
            new_stop = %new_stop,
            pullback_low = ?decision.pullback_low,
            "Structural raise identified"
        );

        match self.push_stop_to_broker(position, current_stop, new_stop).await {
            Ok(()) => {
                let pullback = decision
                    .pullback_low
                    .unwrap_or(structural_low)
                    .to_f64()
                    .unwrap_or(position.stop_price);
                self.db
                    .apply_stop_raise(
                        position.id,
                        new_stop.to_f64().unwrap_or(position.stop_price),
                        decision.structural_high.to_f64().unwrap_or(0.0),
                        pullback,
                        decision.structural_high_date,
                        position.highest_price,
                    )
                    .await?;

                self.notify.send(NotifyEvent::StopRaised {
                    symbol: position.symbol.clone(),
                    old_stop: current_stop,
                    new_stop,
                });

                Ok(ReassessOutcome::Raised {
                    old_stop: current_stop,
                    new_stop,
                })
            }
            Err(e) => {
                warn!(
                    symbol = %position.symbol,
                    new_stop = %new_stop,
                    error = %e,
                    "Broker rejected stop raise, queueing for catch-up"
                );

                self.db
                    .upsert_pending_update(
                        position.id,
                        &position.symbol,
                        position.stop_price,
                        new_stop.to_f64().unwrap_or(position.stop_price),
                        &e.to_string(),
                    )
                    .await?;

                self.notify.send(NotifyEvent::StopUpdateQueued {
                    symbol: position.symbol.clone(),
                    new_stop,
                    error: e.to_string(),
                });

                Ok(ReassessOutcome::Failed {
                    reason: "queued for catch-up".to_string(),
                })
            }
        }
    }

    /// Modify (or place) the broker stop order, walking the retry ladder.
    async fn push_stop_to_broker(
        &self,
        position: &StoredPosition,
        old_stop: Decimal,
        new_stop: Decimal,
    ) -> Result<()> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..self.retry.attempts() {
            if attempt > 0 {
                // delay_before_retry is Some for every retry the schedule allows
                if let Some(delay) = self.retry.delay_before_retry(attempt - 1) {
                    tokio::time::sleep(delay).await;
                }
            }

            let result = match position.stop_order_id {
                Some(order_id) => self
                    .broker
                    .modify_stop_price(order_id, &position.symbol, position.shares, old_stop, new_stop)
                    .await
                    .and_then(|outcome| {
                        if outcome.success {
                            Ok(None)
                        } else {
                            anyhow::bail!(
                                "broker refused stop modify: {}",
                                outcome.reason.unwrap_or_else(|| "no reason given".to_string())
                            )
                        }
                    }),
                None => self
                    .broker
                    .place_stop_order(&position.symbol, position.shares, new_stop)
                    .await
                    .map(|r| Some(r.order_id)),
            };

            match result {
                Ok(new_order_id) => {
                    if let Some(order_id) = new_order_id {
                        self.db.set_stop_order_id(position.id, Some(order_id)).await?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        symbol = %position.symbol,
                        attempt = attempt + 1,
                        error = %e,
                        "Stop write attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("stop write failed")))
    }

    /// Drain the catch-up queue: one broker attempt per pending record.
    /// Records for closed positions fail immediately; records that exhaust
    /// the retry ceiling are abandoned with an operator alert.
    pub async fn process_pending_updates(&self) -> Result<usize> {
        let pending = self.db.get_pending_updates().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        info!(count = pending.len(), "Processing pending stop updates");

        let mut succeeded = 0usize;
        for item in pending {
            match self.catch_up_one(&item).await {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => warn!(symbol = %item.symbol, error = %e, "Catch-up pass error"),
            }
        }

        Ok(succeeded)
    }

    async fn catch_up_one(&self, item: &StoredPendingUpdate) -> Result<bool> {
        let position = self.db.get_position(item.position_id).await?;
        let Some(position) = position.filter(|p| p.status == "open") else {
            self.db
                .mark_pending_failed(item.id, "position no longer open")
                .await?;
            return Ok(false);
        };

        let old_stop = Decimal::try_from(item.old_stop).unwrap_or(Decimal::ZERO);
        let new_stop = Decimal::try_from(item.new_stop).unwrap_or(Decimal::ZERO);

        let result = match position.stop_order_id {
            Some(order_id) => self
                .broker
                .modify_stop_price(order_id, &position.symbol, position.shares, old_stop, new_stop)
                .await
                .and_then(|outcome| {
                    if outcome.success {
                        Ok(None)
                    } else {
                        anyhow::bail!(
                            "broker refused stop modify: {}",
                            outcome.reason.unwrap_or_else(|| "no reason given".to_string())
                        )
                    }
                }),
            None => self
                .broker
                .place_stop_order(&position.symbol, position.shares, new_stop)
                .await
                .map(|r| Some(r.order_id)),
        };

        match result {
            Ok(new_order_id) => {
                if let Some(order_id) = new_order_id {
                    self.db.set_stop_order_id(position.id, Some(order_id)).await?;
                }
                self.db.update_stop_price(position.id, item.new_stop).await?;
                self.db.mark_pending_success(item.id).await?;

                info!(
                    symbol = %position.symbol,
                    new_stop = %new_stop,
                    retries = item.retry_count,
                    "Caught up queued stop update"
                );

                self.notify.send(NotifyEvent::StopRaised {
                    symbol: position.symbol.clone(),
                    old_stop,
                    new_stop,
                });

                Ok(true)
            }
            Err(e) => {
                let retries = self.db.record_pending_failure(item.id, &e.to_string()).await?;

                if retries >= self.cfg.max_catchup_retries {
                    warn!(
                        symbol = %position.symbol,
                        retries = retries,
                        "Abandoning stop update after retry ceiling"
                    );
                    self.db
                        .mark_pending_failed(
                            item.id,
                            &format!("abandoned after {} retries: {}", retries, e),
                        )
                        .await?;
                    self.notify.send(NotifyEvent::StopUpdateFailed {
                        symbol: position.symbol.clone(),
                        new_stop,
                        retries,
                    });
                }

                Ok(false)
            }
        }
    }

    pub async fn pending_updates_count(&self) -> Result<i64> {
        self.db.count_pending_updates().await
    }
}
