//! Historical replay of the trailing-stop rules.
//!
//! Runs the same structural analysis the live engine uses over a window of
//! daily bars, so a rule change can be sanity-checked against history before
//! it touches a live stop. Entry is assumed at the first bar's close.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::fmt;

use crate::api::PriceFeed;
use crate::models::DailyBar;
use crate::trailing::structure::analyze_structure;
use crate::trailing::TrailingConfig;

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Stop distance below the entry close
    pub initial_stop_pct: Decimal,
    /// Cut the replay after this many held days (0 = run to data end)
    pub max_days: usize,
    pub trailing: TrailingConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            initial_stop_pct: rust_decimal_macros::dec!(0.05),
            max_days: 0,
            trailing: TrailingConfig::default(),
        }
    }
}

/// Why the replay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayExit {
    /// A bar traded through the stop (gap-downs exit at the open)
    StoppedOut,
    /// The configured holding limit was reached
    MaxDays,
    /// Bars ran out with the position still alive
    DataEnded,
}

/// One stop raise during the replay.
#[derive(Debug, Clone)]
pub struct StopPoint {
    pub date: NaiveDate,
    pub stop: Decimal,
}

#[derive(Debug, Clone)]
pub struct ReplayResult {
    pub symbol: String,
    pub entry_date: NaiveDate,
    pub entry_price: Decimal,
    pub exit: ReplayExit,
    pub exit_date: NaiveDate,
    pub exit_price: Decimal,
    pub final_stop: Decimal,
    pub days_held: usize,
    /// Every stop level held during the trade, starting with the initial stop
    pub trajectory: Vec<StopPoint>,
}

impl ReplayResult {
    pub fn pnl_per_share(&self) -> Decimal {
        (self.exit_price - self.entry_price).round_dp(2)
    }

    pub fn raises(&self) -> usize {
        self.trajectory.len().saturating_sub(1)
    }
}

impl fmt::Display for ReplayResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: entered {} @ {}, exited {} @ {} ({:?})",
            self.symbol, self.entry_date, self.entry_price, self.exit_date, self.exit_price,
            self.exit
        )?;
        writeln!(
            f,
            "  {} days held, {} stop raises, P&L {}/share",
            self.days_held,
            self.raises(),
            self.pnl_per_share()
        )?;
        for point in &self.trajectory {
            writeln!(f, "  {}  stop {}", point.date, point.stop)?;
        }
        Ok(())
    }
}

/// Replay the trailing-stop rules over chronological bars. Needs at least
/// one bar; entry is the first bar's close.
pub fn replay(symbol: &str, bars: &[DailyBar], cfg: &ReplayConfig) -> Result<ReplayResult> {
    let entry_bar = bars.first().context("Replay needs at least one bar")?;
    let entry_price = entry_bar.close;

    let mut stop = (entry_price * (Decimal::ONE - cfg.initial_stop_pct)).round_dp(2);
    let mut structural_high = entry_price;
    let buffer = Decimal::ONE - cfg.trailing.stop_buffer();
    let mut structural_low = if buffer > Decimal::ZERO {
        (stop / buffer).round_dp(2)
    } else {
        stop
    };

    let mut trajectory = vec![StopPoint {
        date: entry_bar.date,
        stop,
    }];

    for (i, bar) in bars.iter().enumerate().skip(1) {
        // Stop check runs on the day's range before any raise from that
        // day's close can apply
        if bar.open <= stop {
            return Ok(ReplayResult {
                symbol: symbol.to_string(),
                entry_date: entry_bar.date,
                entry_price,
                exit: ReplayExit::StoppedOut,
                exit_date: bar.date,
                exit_price: bar.open,
                final_stop: stop,
                days_held: i,
                trajectory,
            });
        }
        if bar.low <= stop {
            return Ok(ReplayResult {
                symbol: symbol.to_string(),
                entry_date: entry_bar.date,
                entry_price,
                exit: ReplayExit::StoppedOut,
                exit_date: bar.date,
                exit_price: stop,
                final_stop: stop,
                days_held: i,
                trajectory,
            });
        }

        let decision = analyze_structure(
            &bars[..=i],
            structural_high,
            structural_low,
            stop,
            &cfg.trailing,
        );
        structural_high = decision.structural_high;
        if decision.should_update {
            if let (Some(new_stop), Some(pullback)) = (decision.new_stop, decision.pullback_low) {
                stop = new_stop;
                structural_low = pullback;
                trajectory.push(StopPoint {
                    date: bar.date,
                    stop,
                });
            }
        }

        if cfg.max_days > 0 && i >= cfg.max_days {
            return Ok(ReplayResult {
                symbol: symbol.to_string(),
                entry_date: entry_bar.date,
                entry_price,
                exit: ReplayExit::MaxDays,
                exit_date: bar.date,
                exit_price: bar.close,
                final_stop: stop,
                days_held: i,
                trajectory,
            });
        }
    }

    let last = &bars[bars.len() - 1];
    Ok(ReplayResult {
        symbol: symbol.to_string(),
        entry_date: entry_bar.date,
        entry_price,
        exit: ReplayExit::DataEnded,
        exit_date: last.date,
        exit_price: last.close,
        final_stop: stop,
        days_held: bars.len() - 1,
        trajectory,
    })
}

/// Fetch bars for a window and replay them.
pub async fn replay_symbol(
    prices: &dyn PriceFeed,
    symbol: &str,
    from: NaiveDate,
    to: NaiveDate,
    cfg: &ReplayConfig,
) -> Result<ReplayResult> {
    let bars = prices
        .get_daily_bars(symbol, from, to)
        .await
        .with_context(|| format!("Failed to fetch bars for {}", symbol))?;

    replay(symbol, &bars, cfg)
}
