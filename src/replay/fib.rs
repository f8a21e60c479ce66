//! Fibonacci levels rebuilt from bars
//!
//! Intraday levels come from the swing range of the bars seen so far,
//! excluding the most recent confirmation bars. SPX levels are
//! cross-validated against the same ratio on SPY mapped into SPX terms.

use crate::setup_core::types::{round2, FibDirection, FibLevel, FibTimeframe, MinuteBar};

use super::gex::SPY_TO_SPX_STRIKE;

/// Trailing bars left out of swing detection
pub const FIB_CONFIRMATION_BARS: usize = 5;
pub const FIB_RATIOS: [f64; 7] = [0.236, 0.382, 0.5, 0.618, 0.786, 1.272, 1.618];
/// Max SPX-point gap between an SPX level and its SPY counterpart
pub const CROSS_VALIDATION_TOLERANCE: f64 = 3.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwingRange {
    pub high: f64,
    pub low: f64,
    pub trend_up: bool,
}

/// Swing high/low over all but the last `confirmation_bars` bars. Needs
/// at least `max(6, confirmation_bars + 2)` bars and a non-empty range.
pub fn detect_swing_range(bars: &[MinuteBar], confirmation_bars: usize) -> Option<SwingRange> {
    if bars.len() < 6.max(confirmation_bars + 2) {
        return None;
    }
    let usable = &bars[..(bars.len() - confirmation_bars).max(1)];
    if usable.len() < 4 {
        return None;
    }

    let high = usable.iter().map(|bar| bar.high_or_close()).fold(f64::NEG_INFINITY, f64::max);
    let low = usable.iter().map(|bar| bar.low_or_close()).fold(f64::INFINITY, f64::min);
    if !high.is_finite() || !low.is_finite() || high <= low {
        return None;
    }

    let first = usable[0].close;
    let last = usable[usable.len() - 1].close;
    Some(SwingRange { high, low, trend_up: last >= first })
}

/// Retracements measured back from the swing extreme in the trend
/// direction; extensions project beyond it.
pub fn fib_levels_for_swing(swing: &SwingRange, timeframe: FibTimeframe) -> Vec<FibLevel> {
    let range = swing.high - swing.low;
    if !range.is_finite() || range <= 0.0 {
        return Vec::new();
    }

    FIB_RATIOS
        .iter()
        .map(|&ratio| {
            let extension = ratio > 1.0;
            let price = match (swing.trend_up, extension) {
                (true, true) => swing.high + range * (ratio - 1.0),
                (true, false) => swing.high - range * ratio,
                (false, true) => swing.low - range * (ratio - 1.0),
                (false, false) => swing.low + range * ratio,
            };
            FibLevel {
                ratio,
                price: round2(price),
                timeframe,
                direction: if extension {
                    FibDirection::Extension
                } else {
                    FibDirection::Retracement
                },
                swing_high: round2(swing.high),
                swing_low: round2(swing.low),
                cross_validated: false,
            }
        })
        .collect()
}

pub fn cross_validate(spx: Vec<FibLevel>, spy: &[FibLevel], basis: f64) -> Vec<FibLevel> {
    spx.into_iter()
        .map(|mut level| {
            level.cross_validated = spy.iter().any(|spy_level| {
                spy_level.ratio == level.ratio
                    && (spy_level.price * SPY_TO_SPX_STRIKE + basis - level.price).abs()
                        <= CROSS_VALIDATION_TOLERANCE
            });
            level
        })
        .collect()
}

/// Non-intraday reference levels plus cross-validated intraday levels from
/// the bars seen so far, sorted by price. Falls back to the reference set
/// until both instruments have a swing.
pub fn time_sliced_fib_levels(
    spx_bars: &[MinuteBar],
    spy_bars: &[MinuteBar],
    basis: f64,
    reference: &[FibLevel],
) -> Vec<FibLevel> {
    let mut levels: Vec<FibLevel> = reference
        .iter()
        .filter(|level| level.timeframe != FibTimeframe::Intraday)
        .cloned()
        .collect();

    let (Some(spx_swing), Some(spy_swing)) = (
        detect_swing_range(spx_bars, FIB_CONFIRMATION_BARS),
        detect_swing_range(spy_bars, FIB_CONFIRMATION_BARS),
    ) else {
        return levels;
    };

    let spy_levels = fib_levels_for_swing(&spy_swing, FibTimeframe::Intraday);
    levels.extend(cross_validate(
        fib_levels_for_swing(&spx_swing, FibTimeframe::Intraday),
        &spy_levels,
        basis,
    ));
    levels.sort_by(|a, b| a.price.total_cmp(&b.price));
    levels
}

/// Daily levels from a complete session, used as the next day's reference.
pub fn session_fib_levels(spx_bars: &[MinuteBar], spy_bars: &[MinuteBar], basis: f64) -> Vec<FibLevel> {
    let Some(spx_swing) = detect_swing_range(spx_bars, 0) else {
        return Vec::new();
    };
    let spx_levels = fib_levels_for_swing(&spx_swing, FibTimeframe::Daily);
    match detect_swing_range(spy_bars, 0) {
        Some(spy_swing) => cross_validate(
            spx_levels,
            &fib_levels_for_swing(&spy_swing, FibTimeframe::Daily),
            basis,
        ),
        None => spx_levels,
    }
}
