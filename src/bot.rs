//! Long-running scheduler wiring the jobs together.
//!
//! One task, one select loop. Reconciliation runs on a short interval during
//! market hours, reassessment fires once per day after the close, the
//! catch-up queue drains on its own cadence, and a health tick probes the
//! gateway and clears expired pauses. Ctrl-C shuts the loop down cleanly.

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::api::BrokerGateway;
use crate::db::Database;
use crate::reconcile::PositionReconciler;
use crate::safety::SafetyGate;
use crate::trailing::TrailingStopEngine;

const LAST_REASSESS_KEY: &str = "last_reassess_date";

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Reconciliation cadence during market hours
    pub reconcile_interval: Duration,
    /// Hour (exchange wall clock) for the daily reassessment
    pub reassess_hour: u32,
    /// Catch-up queue drain cadence
    pub catchup_interval: Duration,
    /// Gateway health probe cadence
    pub health_interval: Duration,
    /// Grace period before the first scheduled work
    pub startup_delay: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(300),  // 5 min
            reassess_hour: 16,                             // after the close
            catchup_interval: Duration::from_secs(1800),   // 30 min
            health_interval: Duration::from_secs(60),
            startup_delay: Duration::from_secs(10),
        }
    }
}

/// Regular session: weekdays 09:30 to 16:00.
pub fn market_hours(now: DateTime<Utc>) -> bool {
    if matches!(now.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
        return false;
    }
    let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default();
    let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default();
    let t = now.time();
    t >= open && t < close
}

pub struct Bot {
    db: Database,
    broker: Arc<dyn BrokerGateway>,
    gate: Arc<SafetyGate>,
    reconciler: Arc<PositionReconciler>,
    engine: Arc<TrailingStopEngine>,
    schedule: ScheduleConfig,
}

impl Bot {
    pub fn new(
        db: Database,
        broker: Arc<dyn BrokerGateway>,
        gate: Arc<SafetyGate>,
        reconciler: Arc<PositionReconciler>,
        engine: Arc<TrailingStopEngine>,
        schedule: ScheduleConfig,
    ) -> Self {
        Self {
            db,
            broker,
            gate,
            reconciler,
            engine,
            schedule,
        }
    }

    pub async fn run(self) -> Result<()> {
        info!(
            reconcile_secs = self.schedule.reconcile_interval.as_secs(),
            reassess_hour = self.schedule.reassess_hour,
            catchup_secs = self.schedule.catchup_interval.as_secs(),
            "Scheduler starting"
        );

        tokio::time::sleep(self.schedule.startup_delay).await;

        // Repair whatever drift accumulated while the process was down
        self.run_reconcile().await;

        // First interval reconcile waits a full period; the warm-up run above
        // just covered the startup case
        let mut reconcile_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.schedule.reconcile_interval,
            self.schedule.reconcile_interval,
        );
        let mut catchup_tick = tokio::time::interval(self.schedule.catchup_interval);
        let mut health_tick = tokio::time::interval(self.schedule.health_interval);
        // Minute granularity is enough to hit the daily reassessment hour
        let mut reassess_tick = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = reconcile_tick.tick() => {
                    if market_hours(Utc::now()) {
                        self.run_reconcile().await;
                    }
                }
                _ = reassess_tick.tick() => {
                    if let Err(e) = self.maybe_reassess().await {
                        error!(error = %e, "Reassessment scheduling failed");
                    }
                }
                _ = catchup_tick.tick() => {
                    match self.engine.process_pending_updates().await {
                        Ok(n) if n > 0 => info!(caught_up = n, "Catch-up pass complete"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Catch-up pass failed"),
                    }
                }
                _ = health_tick.tick() => {
                    self.run_health_check().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    async fn run_reconcile(&self) {
        match self.reconciler.reconcile(false).await {
            Ok(report) if report.is_clean() => {}
            Ok(report) => info!(
                synced = report.synced.len(),
                closed = report.closed.len(),
                updated = report.updated.len(),
                errors = report.errors.len(),
                "Reconciliation repaired drift"
            ),
            Err(e) => warn!(error = %e, "Reconciliation skipped"),
        }
    }

    /// Fire the daily reassessment once we pass the configured hour, at most
    /// once per calendar day (tracked in meta so restarts do not repeat it).
    async fn maybe_reassess(&self) -> Result<()> {
        let now = Utc::now();
        if now.hour() < self.schedule.reassess_hour {
            return Ok(());
        }
        if matches!(now.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
            return Ok(());
        }

        let today = now.date_naive().to_string();
        if self.db.get_meta(LAST_REASSESS_KEY).await?.as_deref() == Some(today.as_str()) {
            return Ok(());
        }

        info!(date = %today, "Running daily trailing stop reassessment");
        let report = self.engine.reassess_all_positions().await?;
        self.db.set_meta(LAST_REASSESS_KEY, &today).await?;

        info!(
            checked = report.checked,
            raised = report.raised,
            failures = report.failures,
            "Daily reassessment finished"
        );

        Ok(())
    }

    async fn run_health_check(&self) {
        // A probe should never outlive its interval
        let probe = tokio::time::timeout(Duration::from_secs(10), self.broker.check_health());
        match probe.await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => warn!("Gateway reachable but not connected to the broker"),
            Ok(Err(e)) => warn!(error = %e, "Gateway health check failed"),
            Err(_) => warn!("Gateway health check timed out"),
        }

        match self.gate.clear_expired_pause().await {
            Ok(true) => info!("Expired trading pause cleared"),
            Ok(false) => {}
            Err(e) => error!(error = %e, "Failed to check pause expiry"),
        }
    }
}
