//! Trading circuit breaker.
//!
//! Every order placement asks the gate first. The gate rebuilds its view of
//! risk (daily and weekly P&L, losing streak, exposure) from the ledger on
//! each check, so a restart cannot wipe out an active pause or reset a loss
//! streak.
//!
//! Fail-closed: if the ledger cannot be read, trading is denied.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::{format_db_time, parse_db_time, Database, StoredSafetyState};
use crate::models::TradingMode;
use crate::notify::{NotifyEvent, NotifyHandle};

/// Risk limits. All percentage limits are fractions of account value.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    /// Max daily realized loss before trading pauses (fraction of account)
    pub max_daily_loss_pct: f64,
    /// Max weekly realized loss before trading pauses for the week
    pub max_weekly_loss_pct: f64,
    /// Losing streak length that pauses trading until manual resume
    pub max_consecutive_losses: i64,
    /// Max simultaneously open positions
    pub max_open_positions: i64,
    /// Max single position size (fraction of account)
    pub max_position_size_pct: f64,
    /// Minimum days of paper trading before live mode is allowed
    pub min_paper_days: i64,
    /// Minimum closed paper trades before live mode is allowed
    pub min_paper_trades: i64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 0.03,     // 3% of account per day
            max_weekly_loss_pct: 0.05,    // 5% of account per week
            max_consecutive_losses: 3,
            max_open_positions: 5,
            max_position_size_pct: 0.20,  // 20% of account per position
            min_paper_days: 30,
            min_paper_trades: 20,
        }
    }
}

/// Outcome of a pre-trade check.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeDecision {
    Allowed,
    Denied { reason: String },
}

impl TradeDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }
}

/// Safety state snapshot for operator display.
#[derive(Debug, Clone)]
pub struct SafetySnapshot {
    pub mode: TradingMode,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub pause_until: Option<DateTime<Utc>>,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub consecutive_losses: i64,
    pub open_positions_count: i64,
    pub capital_deployed: f64,
    pub paper_trade_count: i64,
    pub paper_trading_start: Option<DateTime<Utc>>,
}

/// 09:30 on the next day (weekends skipped): when a daily-limit pause lifts.
pub fn next_market_open(now: DateTime<Utc>) -> DateTime<Utc> {
    let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default();
    let mut date = now.date_naive() + Duration::days(1);
    while matches!(date.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
        date += Duration::days(1);
    }
    DateTime::from_naive_utc_and_offset(date.and_time(open), Utc)
}

/// 09:30 on the next Monday: when a weekly-limit pause lifts.
pub fn next_monday_open(now: DateTime<Utc>) -> DateTime<Utc> {
    let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default();
    let days_ahead = 7 - now.weekday().num_days_from_monday() as i64;
    let date = now.date_naive() + Duration::days(days_ahead);
    DateTime::from_naive_utc_and_offset(date.and_time(open), Utc)
}

/// Monday of the week containing `now`.
fn week_start(now: DateTime<Utc>) -> chrono::NaiveDate {
    now.date_naive() - Duration::days(now.weekday().num_days_from_monday() as i64)
}

pub struct SafetyGate {
    db: Database,
    limits: RwLock<SafetyLimits>,
    notify: NotifyHandle,
}

impl SafetyGate {
    pub fn new(db: Database, limits: SafetyLimits, notify: NotifyHandle) -> Self {
        Self {
            db,
            limits: RwLock::new(limits),
            notify,
        }
    }

    pub async fn limits(&self) -> SafetyLimits {
        self.limits.read().await.clone()
    }

    pub async fn update_limits(&self, limits: SafetyLimits) {
        *self.limits.write().await = limits;
    }

    /// Pre-trade check. Any ledger error denies the trade.
    pub async fn can_trade(&self, account_value: Decimal) -> TradeDecision {
        match self.evaluate(account_value, Utc::now()).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Safety check failed, denying trade");
                TradeDecision::denied(format!("safety check unavailable: {}", e))
            }
        }
    }

    async fn evaluate(&self, account_value: Decimal, now: DateTime<Utc>) -> Result<TradeDecision> {
        let limits = self.limits.read().await.clone();
        let mut state = self.db.get_safety_state().await?;
        let account = account_value.to_f64().unwrap_or(0.0);

        // An active pause with a lapsed deadline clears itself
        if state.is_paused {
            let expired = state
                .pause_until
                .as_deref()
                .map(|u| parse_db_time(u) <= now)
                .unwrap_or(false);

            if expired {
                info!(reason = ?state.pause_reason, "Pause window elapsed, resuming trading");
                state.is_paused = false;
                state.pause_reason = None;
                state.pause_until = None;
            } else {
                let reason = state
                    .pause_reason
                    .clone()
                    .unwrap_or_else(|| "paused".to_string());
                self.db.save_safety_state(&state).await?;
                return Ok(TradeDecision::denied(format!("trading paused: {}", reason)));
            }
        }

        let daily_pnl = self.db.realized_pnl_since(now.date_naive()).await?;
        let weekly_pnl = self.db.realized_pnl_since(week_start(now)).await?;
        let streak = self
            .db
            .consecutive_losses(state.streak_reset_at.as_deref())
            .await?;
        let open_count = self.db.open_positions_count().await?;

        state.daily_pnl = daily_pnl;
        state.weekly_pnl = weekly_pnl;
        state.consecutive_losses = streak;
        state.open_positions_count = open_count;
        state.capital_deployed = self.db.capital_deployed().await?;
        state.paper_trade_count = self.paper_trade_count(&state).await?;

        if account > 0.0 && daily_pnl <= -(limits.max_daily_loss_pct * account) {
            let reason = format!(
                "daily loss limit hit ({:.2} <= -{:.0}% of account)",
                daily_pnl,
                limits.max_daily_loss_pct * 100.0
            );
            return self
                .pause_and_deny(state, reason, Some(next_market_open(now)))
                .await;
        }

        if account > 0.0 && weekly_pnl <= -(limits.max_weekly_loss_pct * account) {
            let reason = format!(
                "weekly loss limit hit ({:.2} <= -{:.0}% of account)",
                weekly_pnl,
                limits.max_weekly_loss_pct * 100.0
            );
            return self
                .pause_and_deny(state, reason, Some(next_monday_open(now)))
                .await;
        }

        if streak >= limits.max_consecutive_losses {
            let reason = format!(
                "{} consecutive losses, manual resume required",
                streak
            );
            return self.pause_and_deny(state, reason, None).await;
        }

        if open_count >= limits.max_open_positions {
            self.db.save_safety_state(&state).await?;
            return Ok(TradeDecision::denied(format!(
                "max open positions reached ({}/{})",
                open_count, limits.max_open_positions
            )));
        }

        self.db.save_safety_state(&state).await?;
        Ok(TradeDecision::Allowed)
    }

    async fn pause_and_deny(
        &self,
        mut state: StoredSafetyState,
        reason: String,
        until: Option<DateTime<Utc>>,
    ) -> Result<TradeDecision> {
        warn!(reason = %reason, until = ?until, "Pausing trading");

        state.is_paused = true;
        state.pause_reason = Some(reason.clone());
        state.pause_until = until.map(format_db_time);
        self.db.save_safety_state(&state).await?;

        self.notify.send(NotifyEvent::TradingPaused {
            reason: reason.clone(),
        });

        Ok(TradeDecision::denied(format!("trading paused: {}", reason)))
    }

    /// Check a proposed position against the single-position size cap.
    pub async fn validate_position_size(
        &self,
        shares: i64,
        price: Decimal,
        account_value: Decimal,
    ) -> TradeDecision {
        let limits = self.limits.read().await;
        let cost = price * Decimal::from(shares);
        let cap = account_value
            * Decimal::try_from(limits.max_position_size_pct).unwrap_or(Decimal::ZERO);

        if account_value > Decimal::ZERO && cost > cap {
            return TradeDecision::denied(format!(
                "position cost {} exceeds {:.0}% of account ({})",
                cost.round_dp(2),
                limits.max_position_size_pct * 100.0,
                cap.round_dp(2)
            ));
        }

        TradeDecision::Allowed
    }

    /// Whether the paper record qualifies for switching to live trading.
    pub async fn can_switch_to_live(&self) -> Result<TradeDecision> {
        let limits = self.limits.read().await.clone();
        let state = self.db.get_safety_state().await?;

        if state.is_paused {
            return Ok(TradeDecision::denied(
                "cannot go live while trading is paused",
            ));
        }

        let start = match state.paper_trading_start_date.as_deref() {
            Some(s) => parse_db_time(s),
            None => {
                return Ok(TradeDecision::denied(
                    "no paper trading history recorded",
                ))
            }
        };

        let paper_days = (Utc::now() - start).num_days();
        if paper_days < limits.min_paper_days {
            return Ok(TradeDecision::denied(format!(
                "only {} of {} required paper trading days",
                paper_days, limits.min_paper_days
            )));
        }

        let trades = self
            .db
            .closed_count_since(&format_db_time(start))
            .await?;
        if trades < limits.min_paper_trades {
            return Ok(TradeDecision::denied(format!(
                "only {} of {} required paper trades",
                trades, limits.min_paper_trades
            )));
        }

        let paper_pnl = self.db.realized_pnl_since(start.date_naive()).await?;
        if paper_pnl <= 0.0 {
            return Ok(TradeDecision::denied(format!(
                "paper record is not profitable ({:.2})",
                paper_pnl
            )));
        }

        Ok(TradeDecision::Allowed)
    }

    pub async fn switch_to_live(&self) -> Result<TradeDecision> {
        let decision = self.can_switch_to_live().await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }

        let mut state = self.db.get_safety_state().await?;
        state.mode = TradingMode::Live.as_str().to_string();
        self.db.save_safety_state(&state).await?;

        info!("Switched to LIVE trading mode");
        Ok(TradeDecision::Allowed)
    }

    pub async fn switch_to_paper(&self) -> Result<()> {
        let mut state = self.db.get_safety_state().await?;
        state.mode = TradingMode::Paper.as_str().to_string();
        state.paper_trading_start_date = Some(format_db_time(Utc::now()));
        self.db.save_safety_state(&state).await?;

        info!("Switched to paper trading mode");
        Ok(())
    }

    pub async fn manual_pause(&self, reason: &str) -> Result<()> {
        let mut state = self.db.get_safety_state().await?;
        state.is_paused = true;
        state.pause_reason = Some(format!("manual: {}", reason));
        state.pause_until = None;
        self.db.save_safety_state(&state).await?;

        warn!(reason = %reason, "Trading manually paused");
        self.notify.send(NotifyEvent::TradingPaused {
            reason: format!("manual: {}", reason),
        });

        Ok(())
    }

    /// Clear any pause and reset the losing-streak counter. Losses closed
    /// before this moment no longer count toward the streak.
    pub async fn resume_trading(&self, reason: &str) -> Result<()> {
        let mut state = self.db.get_safety_state().await?;
        state.is_paused = false;
        state.pause_reason = None;
        state.pause_until = None;
        state.streak_reset_at = Some(format_db_time(Utc::now()));
        state.consecutive_losses = 0;
        self.db.save_safety_state(&state).await?;

        info!(reason = %reason, "Trading resumed, losing streak reset");
        Ok(())
    }

    /// Clear a pause whose deadline has lapsed (scheduler housekeeping).
    pub async fn clear_expired_pause(&self) -> Result<bool> {
        let mut state = self.db.get_safety_state().await?;
        if !state.is_paused {
            return Ok(false);
        }

        let expired = state
            .pause_until
            .as_deref()
            .map(|u| parse_db_time(u) <= Utc::now())
            .unwrap_or(false);

        if expired {
            info!(reason = ?state.pause_reason, "Clearing expired pause");
            state.is_paused = false;
            state.pause_reason = None;
            state.pause_until = None;
            self.db.save_safety_state(&state).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Closed trades since the paper period began. Derived, like the other
    /// safety aggregates, so it cannot drift from the trade history.
    async fn paper_trade_count(&self, state: &StoredSafetyState) -> Result<i64> {
        match state.paper_trading_start_date.as_deref() {
            Some(start) => self.db.closed_count_since(start).await,
            None => Ok(0),
        }
    }

    pub async fn snapshot(&self) -> Result<SafetySnapshot> {
        let state = self.db.get_safety_state().await?;
        let paper_trade_count = self.paper_trade_count(&state).await?;

        Ok(SafetySnapshot {
            mode: TradingMode::parse(&state.mode).unwrap_or(TradingMode::Paper),
            is_paused: state.is_paused,
            pause_reason: state.pause_reason.clone(),
            pause_until: state.pause_until.as_deref().map(parse_db_time),
            daily_pnl: state.daily_pnl,
            weekly_pnl: state.weekly_pnl,
            consecutive_losses: state.consecutive_losses,
            open_positions_count: state.open_positions_count,
            capital_deployed: state.capital_deployed,
            paper_trade_count,
            paper_trading_start: state.paper_trading_start_date.as_deref().map(parse_db_time),
        })
    }

    pub async fn mode(&self) -> Result<TradingMode> {
        let state = self.db.get_safety_state().await?;
        Ok(TradingMode::parse(&state.mode).unwrap_or(TradingMode::Paper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn make_gate() -> (Database, SafetyGate) {
        let db = Database::in_memory().await.unwrap();
        let gate = SafetyGate::new(db.clone(), SafetyLimits::default(), NotifyHandle::disabled());
        (db, gate)
    }

    async fn close_with_pnl(db: &Database, symbol: &str, pnl: f64) {
        let id = db
            .create_open_position(symbol, 10, 10.0, 9.0, 10.0)
            .await
            .unwrap();
        db.close_position(id, 10.0, pnl).await.unwrap();
    }

    #[tokio::test]
    async fn test_allows_clean_slate() {
        let (_db, gate) = make_gate().await;
        assert!(gate.can_trade(dec!(100000)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_daily_loss_pauses_until_next_open() {
        let (db, gate) = make_gate().await;
        // 3% of 100k = 3000
        close_with_pnl(&db, "AAA", -3500.0).await;

        let decision = gate.can_trade(dec!(100000)).await;
        assert!(!decision.is_allowed());

        let state = db.get_safety_state().await.unwrap();
        assert!(state.is_paused);
        assert!(state.pause_until.is_some());
        assert!(state
            .pause_reason
            .unwrap()
            .contains("daily loss limit"));
    }

    #[tokio::test]
    async fn test_consecutive_losses_pause_has_no_deadline() {
        let (db, gate) = make_gate().await;
        // Three small losses, under the P&L limits
        for s in ["AAA", "BBB", "CCC"] {
            close_with_pnl(&db, s, -100.0).await;
        }

        let decision = gate.can_trade(dec!(100000)).await;
        assert!(!decision.is_allowed());

        let state = db.get_safety_state().await.unwrap();
        assert!(state.is_paused);
        assert!(state.pause_until.is_none());
    }

    #[tokio::test]
    async fn test_resume_resets_streak() {
        let (db, gate) = make_gate().await;
        for s in ["AAA", "BBB", "CCC"] {
            close_with_pnl(&db, s, -100.0).await;
        }
        assert!(!gate.can_trade(dec!(100000)).await.is_allowed());

        gate.resume_trading("losses reviewed").await.unwrap();

        // Old losses are behind the reset marker; new checks pass
        let state = db.get_safety_state().await.unwrap();
        assert!(!state.is_paused);
        assert!(state.streak_reset_at.is_some());
        assert!(gate.can_trade(dec!(100000)).await.is_allowed());
    }

    #[tokio::test]
    async fn test_max_open_positions_denies_without_pause() {
        let (db, gate) = make_gate().await;
        for i in 0..5 {
            db.create_open_position(&format!("S{}", i), 10, 10.0, 9.0, 10.0)
                .await
                .unwrap();
        }

        let decision = gate.can_trade(dec!(100000)).await;
        assert!(!decision.is_allowed());

        // Capacity denial is not a pause
        let state = db.get_safety_state().await.unwrap();
        assert!(!state.is_paused);
    }

    #[tokio::test]
    async fn test_position_size_cap() {
        let (_db, gate) = make_gate().await;

        // 20% of 100k = 20k cap
        let ok = gate
            .validate_position_size(100, dec!(150), dec!(100000))
            .await;
        assert!(ok.is_allowed());

        let too_big = gate
            .validate_position_size(300, dec!(100), dec!(100000))
            .await;
        assert!(!too_big.is_allowed());
    }

    #[tokio::test]
    async fn test_weekly_loss_pauses_until_monday() {
        let (db, gate) = make_gate().await;
        // Daily limit lifted out of the way so only the weekly rule can trip
        gate.update_limits(SafetyLimits {
            max_daily_loss_pct: 1.0,
            ..SafetyLimits::default()
        })
        .await;

        // 5% of 100k = 5000
        close_with_pnl(&db, "AAA", -5500.0).await;

        let decision = gate.can_trade(dec!(100000)).await;
        assert!(!decision.is_allowed());

        let state = db.get_safety_state().await.unwrap();
        assert!(state.is_paused);
        assert!(state.pause_reason.unwrap().contains("weekly loss limit"));

        // Deadline is the coming Monday at the open
        let until = parse_db_time(state.pause_until.as_deref().unwrap());
        assert_eq!(until.weekday(), chrono::Weekday::Mon);
        assert_eq!(until.time().to_string(), "09:30:00");
    }

    #[tokio::test]
    async fn test_fail_closed_on_db_error() {
        let (db, gate) = make_gate().await;
        db.pool().close().await;

        let decision = gate.can_trade(dec!(100000)).await;
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_snapshot_counts_paper_trades() {
        let (db, gate) = make_gate().await;
        // Materialize the singleton, then push its start date behind the closes
        db.get_safety_state().await.unwrap();
        sqlx::query(
            "UPDATE safety_state SET paper_trading_start_date = datetime('now', '-1 day') WHERE id = 1",
        )
        .execute(db.pool())
        .await
        .unwrap();

        for s in ["AAA", "BBB", "CCC"] {
            close_with_pnl(&db, s, 50.0).await;
        }

        let snapshot = gate.snapshot().await.unwrap();
        assert_eq!(snapshot.paper_trade_count, 3);

        // A policy check persists the same derived count
        assert!(gate.can_trade(dec!(100000)).await.is_allowed());
        let state = db.get_safety_state().await.unwrap();
        assert_eq!(state.paper_trade_count, 3);
    }

    #[tokio::test]
    async fn test_live_switch_requires_paper_record() {
        let (_db, gate) = make_gate().await;

        // Fresh ledger: paper period just started, zero trades
        let decision = gate.can_switch_to_live().await.unwrap();
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_live_switch_after_qualifying_record() {
        let (db, gate) = make_gate().await;

        for i in 0..20 {
            close_with_pnl(&db, &format!("S{}", i), 50.0).await;
        }
        // Materialize the singleton, then backdate the paper start past the
        // minimum window
        db.get_safety_state().await.unwrap();
        sqlx::query(
            "UPDATE safety_state SET paper_trading_start_date = datetime('now', '-45 days') WHERE id = 1",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let decision = gate.switch_to_live().await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(gate.mode().await.unwrap(), TradingMode::Live);
    }

    #[tokio::test]
    async fn test_expired_pause_auto_clears() {
        let (db, gate) = make_gate().await;
        gate.manual_pause("maintenance").await.unwrap();

        // Manual pauses have no deadline and never auto-clear
        assert!(!gate.clear_expired_pause().await.unwrap());

        sqlx::query(
            "UPDATE safety_state SET pause_until = datetime('now', '-1 hour') WHERE id = 1",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert!(gate.clear_expired_pause().await.unwrap());
        assert!(gate.can_trade(dec!(100000)).await.is_allowed());
    }

    #[test]
    fn test_next_monday_open_from_midweek() {
        // Wednesday 2026-01-07
        let now = DateTime::parse_from_rfc3339("2026-01-07T15:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let open = next_monday_open(now);
        assert_eq!(open.date_naive().to_string(), "2026-01-12");
        assert_eq!(open.time().to_string(), "09:30:00");
    }

    #[test]
    fn test_next_market_open_skips_weekend() {
        // Friday 2026-01-09
        let now = DateTime::parse_from_rfc3339("2026-01-09T15:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let open = next_market_open(now);
        assert_eq!(open.date_naive().to_string(), "2026-01-12");
    }
}
