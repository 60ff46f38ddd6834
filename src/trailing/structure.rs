//! Pure swing-structure analysis over daily bars.
//!
//! The stop trails confirmed higher lows instead of a fixed percentage:
//! find the highest close (the structural high), take the lowest low of the
//! pullback after it, and only once price has bounced off that low does the
//! stop move up underneath it. The stop never moves down.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::TrailingConfig;
use crate::models::DailyBar;

/// Result of one structural pass. `should_update` is the only field the
/// engine acts on; the rest exist for persistence and the audit trail.
#[derive(Debug, Clone)]
pub struct StructureDecision {
    pub should_update: bool,
    pub new_stop: Option<Decimal>,
    pub structural_high: Decimal,
    pub structural_high_date: Option<NaiveDate>,
    pub pullback_low: Option<Decimal>,
    pub is_new_higher_low: bool,
    pub bounce_confirmed: bool,
    pub reason: String,
}

impl StructureDecision {
    fn hold(structural_high: Decimal, reason: impl Into<String>) -> Self {
        Self {
            should_update: false,
            new_stop: None,
            structural_high,
            structural_high_date: None,
            pullback_low: None,
            is_new_higher_low: false,
            bounce_confirmed: false,
            reason: reason.into(),
        }
    }
}

/// Analyze bars (chronological) against the stored structural state.
///
/// `structural_high` carries the highest close seen in earlier passes so a
/// short bar window cannot forget the real swing high. `structural_low` is
/// the low of the previous confirmed swing; a pullback must bottom above it
/// to count as a higher low.
pub fn analyze_structure(
    bars: &[DailyBar],
    structural_high: Decimal,
    structural_low: Decimal,
    current_stop: Decimal,
    cfg: &TrailingConfig,
) -> StructureDecision {
    if bars.is_empty() {
        return StructureDecision::hold(structural_high, "no bars available");
    }

    // Highest close, seeded with the remembered structural high. When no bar
    // closes above the seed, the whole window counts as pullback.
    let mut high = structural_high;
    let mut high_idx = 0usize;
    let mut high_date = None;
    for (i, bar) in bars.iter().enumerate() {
        if bar.close > high {
            high = bar.close;
            high_idx = i;
            high_date = Some(bar.date);
        }
    }

    // Lowest low of the pullback after the structural high
    let pullback_low = bars[high_idx..]
        .iter()
        .map(|b| b.low)
        .min()
        .unwrap_or(high);

    let is_new_higher_low = pullback_low > structural_low;

    let last_close = bars[bars.len() - 1].close;
    let bounce_confirmed =
        last_close >= pullback_low * (Decimal::ONE + cfg.bounce_confirm_pct);

    let candidate = (pullback_low * (Decimal::ONE - cfg.stop_buffer())).round_dp(2);

    let mut decision = StructureDecision {
        should_update: false,
        new_stop: None,
        structural_high: high,
        structural_high_date: high_date,
        pullback_low: Some(pullback_low),
        is_new_higher_low,
        bounce_confirmed,
        reason: String::new(),
    };

    if !is_new_higher_low {
        decision.reason = format!(
            "pullback low {} is not above structural low {}",
            pullback_low, structural_low
        );
        return decision;
    }

    if !bounce_confirmed {
        decision.reason = format!(
            "bounce not confirmed: close {} below {} threshold",
            last_close,
            (pullback_low * (Decimal::ONE + cfg.bounce_confirm_pct)).round_dp(2)
        );
        return decision;
    }

    if candidate <= current_stop {
        decision.reason = format!(
            "candidate stop {} does not improve on current {}",
            candidate, current_stop
        );
        return decision;
    }

    decision.should_update = true;
    decision.new_stop = Some(candidate);
    decision.reason = format!(
        "higher low {} confirmed, stop {} -> {}",
        pullback_low, current_stop, candidate
    );
    decision
}
