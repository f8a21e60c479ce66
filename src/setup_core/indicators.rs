//! Bar-derived indicators: EMAs, volume trend, trend strength, opening
//! range and VWAP bands as of an evaluation instant.

use chrono::{DateTime, Utc};

use super::types::{round2, round_to, IndicatorContext, MinuteBar, VolumeTrend};
use super::vwap::compute_vwap_bands;

pub const EMA_FAST_PERIOD: usize = 21;
pub const EMA_SLOW_PERIOD: usize = 55;
/// Bars needed before an indicator context is produced
pub const EMA_MIN_BARS: usize = 8;
pub const ORB_WINDOW_MINUTES: i64 = 30;

/// Exponential moving average of the full series, seeded with the simple
/// average of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> f64 {
    if values.is_empty() || period == 0 {
        return 0.0;
    }
    let period = period.min(values.len());
    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    values[period..]
        .iter()
        .fold(seed, |prev, value| value * k + prev * (1.0 - k))
}

/// Last-5 average volume against the 5 before it. Needs 15 bars.
pub fn volume_trend(bars: &[MinuteBar]) -> VolumeTrend {
    if bars.len() < 15 {
        return VolumeTrend::Flat;
    }
    let avg = |slice: &[MinuteBar]| slice.iter().map(|bar| bar.volume_or_zero()).sum::<f64>() / 5.0;
    let n = bars.len();
    let last = avg(&bars[n - 5..]);
    let prior = avg(&bars[n - 10..n - 5]);
    if !last.is_finite() || !prior.is_finite() || prior <= 0.0 {
        return VolumeTrend::Flat;
    }
    let ratio = last / prior;
    if ratio > 1.2 {
        VolumeTrend::Rising
    } else if ratio < 0.85 {
        VolumeTrend::Falling
    } else {
        VolumeTrend::Flat
    }
}

/// 0..1 blend of fast/slow EMA spread and the fast EMA's 3-bar slope.
pub fn trend_strength(bars: &[MinuteBar]) -> f64 {
    let closes: Vec<f64> = bars
        .iter()
        .filter(|bar| bar.has_valid_close())
        .map(|bar| bar.close)
        .collect();
    if closes.len() < 8 {
        return 0.0;
    }

    let fast = ema(&closes, EMA_FAST_PERIOD);
    let slow = ema(&closes, EMA_SLOW_PERIOD);
    let prior = &closes[..closes.len() - 3];
    let fast_prior = if prior.is_empty() { fast } else { ema(prior, EMA_FAST_PERIOD) };

    let spread_score = ((fast - slow).abs() / 8.0).clamp(0.0, 1.0);
    let slope_score = ((fast - fast_prior).abs() / 2.4).clamp(0.0, 1.0);
    round_to(spread_score * 0.55 + slope_score * 0.45, 4)
}

/// Indicator context from the session's bars up to and including `as_of`.
/// Returns `None` with fewer than [`EMA_MIN_BARS`] usable bars.
pub fn build_indicator_context(bars: &[MinuteBar], as_of: DateTime<Utc>) -> Option<IndicatorContext> {
    let as_of_ms = as_of.timestamp_millis();
    let mut usable: Vec<MinuteBar> = bars
        .iter()
        .filter(|bar| bar.has_valid_close() && bar.timestamp_ms <= as_of_ms)
        .copied()
        .collect();
    usable.sort_by_key(|bar| bar.timestamp_ms);
    if usable.len() < EMA_MIN_BARS {
        return None;
    }

    let closes: Vec<f64> = usable.iter().map(|bar| bar.close).collect();
    let fast = ema(&closes, EMA_FAST_PERIOD);
    let slow = ema(&closes, EMA_SLOW_PERIOD);
    let prior = &closes[..closes.len() - 1];
    let (fast_prior, slow_prior) = if prior.is_empty() {
        (fast, slow)
    } else {
        (ema(prior, EMA_FAST_PERIOD), ema(prior, EMA_SLOW_PERIOD))
    };

    let first = usable[0];
    let minutes_since_open = ((as_of_ms - first.timestamp_ms) / 60_000).max(0);
    let orb_end = first.timestamp_ms + ORB_WINDOW_MINUTES * 60_000;
    let (orb_high, orb_low) = usable
        .iter()
        .filter(|bar| bar.timestamp_ms <= orb_end)
        .fold((f64::NEG_INFINITY, f64::INFINITY), |(hi, lo), bar| {
            (hi.max(bar.high_or_close()), lo.min(bar.low_or_close()))
        });
    let session_open = first.open_or_close();

    let n = usable.len();
    Some(IndicatorContext {
        ema_fast: round2(fast),
        ema_slow: round2(slow),
        ema_fast_slope: round_to(fast - fast_prior, 4),
        ema_slow_slope: round_to(slow - slow_prior, 4),
        volume_trend: volume_trend(&usable),
        session_open_price: round2(session_open),
        orb_high: round2(if orb_high.is_finite() { orb_high } else { session_open }),
        orb_low: round2(if orb_low.is_finite() { orb_low } else { session_open }),
        minutes_since_open,
        as_of,
        vwap: compute_vwap_bands(&usable),
        latest_bar: usable.last().copied(),
        prior_bar: if n > 1 { Some(usable[n - 2]) } else { None },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bars(closes: &[f64], volumes: &[f64]) -> Vec<MinuteBar> {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap().timestamp_millis();
        closes
            .iter()
            .zip(volumes.iter().chain(std::iter::repeat(&100.0)))
            .enumerate()
            .map(|(i, (close, volume))| MinuteBar {
                timestamp_ms: start + i as i64 * 60_000,
                open: Some(*close),
                high: Some(close + 1.0),
                low: Some(close - 1.0),
                close: *close,
                volume: *volume,
            })
            .collect()
    }

    #[test]
    fn test_ema_seeds_with_sma() {
        assert_eq!(ema(&[1.0, 2.0, 3.0], 3), 2.0);
        // k = 0.5: seed 2.0 then 0.5 * 6 + 0.5 * 2
        assert_eq!(ema(&[1.0, 2.0, 3.0, 6.0], 3), 4.0);
        assert_eq!(ema(&[], 5), 0.0);
    }

    #[test]
    fn test_volume_trend_ratios() {
        let closes = vec![100.0; 15];
        let mut volumes = vec![100.0; 10];
        volumes.extend([200.0; 5]);
        assert_eq!(volume_trend(&bars(&closes, &volumes)), VolumeTrend::Rising);

        let mut volumes = vec![100.0; 10];
        volumes.extend([50.0; 5]);
        assert_eq!(volume_trend(&bars(&closes, &volumes)), VolumeTrend::Falling);

        assert_eq!(volume_trend(&bars(&closes[..14], &[])), VolumeTrend::Flat);
    }

    #[test]
    fn test_trend_strength_flat_and_rising() {
        assert_eq!(trend_strength(&bars(&[100.0; 20], &[])), 0.0);
        let rising: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 2.0).collect();
        assert!(trend_strength(&bars(&rising, &[])) > 0.6);
        assert_eq!(trend_strength(&bars(&[100.0; 7], &[])), 0.0);
    }

    #[test]
    fn test_context_respects_as_of_and_orb_window() {
        let closes: Vec<f64> = (0..45).map(|i| 5000.0 + i as f64).collect();
        let series = bars(&closes, &[]);
        let as_of = Utc.timestamp_millis_opt(series[39].timestamp_ms).unwrap();
        let context = build_indicator_context(&series, as_of).unwrap();

        assert_eq!(context.minutes_since_open, 39);
        assert_eq!(context.orb_high, 5031.0);
        assert_eq!(context.orb_low, 4999.0);
        assert_eq!(context.session_open_price, 5000.0);
        assert_eq!(context.latest_bar.map(|b| b.close), Some(5039.0));
        assert!(context.ema_fast > context.ema_slow);
        assert!(context.vwap.is_some());

        assert!(build_indicator_context(&series[..7], as_of).is_none());
    }
}
