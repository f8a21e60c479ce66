//! Market Regime Detection
//!
//! Bar-driven regime classification used when no upstream classifier is
//! available (historical replay). Rotations through VWAP and a contained
//! range read as ranging/compression; EMA trend strength with expanding
//! volume reads as trending/breakout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{
    round2, GexLandscape, MinuteBar, Regime, RegimeDirection, RegimeState, VolumeTrend,
};
use crate::sources::{RegimeClassifier, RegimeInput};

/// Configuration for regime detection
#[derive(Debug, Clone)]
pub struct MarketStateConfig {
    /// Number of minute bars to look back (default: 60)
    pub lookback_bars: usize,
    /// Rotations through fair value that mark a two-sided market (default: 3)
    pub rotation_threshold: u32,
    /// Trend strength at which a rising-volume move is a breakout (default: 0.6)
    pub breakout_strength: f64,
    /// Trend strength at which the market is trending (default: 0.45)
    pub trending_strength: f64,
    /// Range / ATR below which a positive-gamma market is compressed (default: 4.0)
    pub compression_range_ratio: f64,
    /// ATR fraction beyond fair value that sets direction (default: 0.25)
    pub direction_atr_fraction: f64,
}

impl Default for MarketStateConfig {
    fn default() -> Self {
        Self {
            lookback_bars: 60, // one hour of minute bars
            rotation_threshold: 3,
            breakout_strength: 0.6,
            trending_strength: 0.45,
            compression_range_ratio: 4.0,
            direction_atr_fraction: 0.25,
        }
    }
}

/// Intermediate measurements, kept for logging
#[derive(Debug, Clone)]
pub struct MarketStateResult {
    pub fair_value: f64,
    pub atr: f64,
    pub rotation_count: u32,
    pub range_ratio: f64,
}

/// Volume-weighted typical price of a window
fn calculate_vwap(bars: &[MinuteBar]) -> f64 {
    let mut sum_pv = 0.0;
    let mut sum_v = 0.0;

    for bar in bars {
        let typical_price = (bar.high_or_close() + bar.low_or_close() + bar.close) / 3.0;
        sum_pv += typical_price * bar.volume_or_zero();
        sum_v += bar.volume_or_zero();
    }

    if sum_v <= 0.0 {
        // Fallback to simple midpoint
        return match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => (first.open_or_close() + last.close) / 2.0,
            _ => 0.0,
        };
    }

    sum_pv / sum_v
}

/// Average True Range
fn calculate_atr(bars: &[MinuteBar]) -> f64 {
    if bars.len() < 2 {
        return bars
            .first()
            .map(|bar| bar.high_or_close() - bar.low_or_close())
            .unwrap_or(0.0);
    }

    let mut sum_tr = 0.0;
    let mut prev_close = bars[0].close;

    for bar in bars.iter().skip(1) {
        let (high, low) = (bar.high_or_close(), bar.low_or_close());
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        sum_tr += tr;
        prev_close = bar.close;
    }

    sum_tr / (bars.len() - 1) as f64
}

/// Count how many times the close crosses a level
fn count_fair_value_crosses(bars: &[MinuteBar], fair_value: f64) -> u32 {
    let mut crosses = 0u32;
    let mut prev_above: Option<bool> = None;

    for bar in bars {
        let curr_above = bar.close > fair_value;
        if prev_above.is_some_and(|prev| prev != curr_above) {
            crosses += 1;
        }
        prev_above = Some(curr_above);
    }

    crosses
}

pub fn measure_market_state(bars: &[MinuteBar], config: &MarketStateConfig) -> MarketStateResult {
    let start = bars.len().saturating_sub(config.lookback_bars);
    let window: Vec<MinuteBar> = bars[start..]
        .iter()
        .filter(|bar| bar.has_valid_close())
        .copied()
        .collect();

    let fair_value = calculate_vwap(&window);
    let atr = calculate_atr(&window);
    let rotation_count = count_fair_value_crosses(&window, fair_value);
    let window_high = window.iter().map(|b| b.high_or_close()).fold(f64::MIN, f64::max);
    let window_low = window.iter().map(|b| b.low_or_close()).fold(f64::MAX, f64::min);
    let range_ratio = if atr > 0.0 && !window.is_empty() {
        (window_high - window_low) / atr
    } else {
        0.0
    };

    MarketStateResult { fair_value, atr, rotation_count, range_ratio }
}

/// Classify the regime from bars-to-now plus the replayed volume trend and
/// trend strength.
pub fn detect_regime(
    bars: &[MinuteBar],
    gex: &GexLandscape,
    volume_trend: VolumeTrend,
    trend_strength: f64,
    as_of: DateTime<Utc>,
    config: &MarketStateConfig,
) -> RegimeState {
    let measured = measure_market_state(bars, config);

    let regime = if trend_strength >= config.breakout_strength && volume_trend == VolumeTrend::Rising {
        Regime::Breakout
    } else if trend_strength >= config.trending_strength {
        Regime::Trending
    } else if measured.rotation_count >= config.rotation_threshold {
        Regime::Ranging
    } else if measured.range_ratio < config.compression_range_ratio && gex.combined.net_gex >= 0.0 {
        Regime::Compression
    } else {
        Regime::Ranging
    };

    let last_close = bars.iter().rev().find(|bar| bar.has_valid_close()).map(|bar| bar.close);
    let band = measured.atr * config.direction_atr_fraction;
    let direction = match last_close {
        Some(close) if close > measured.fair_value + band => RegimeDirection::Bullish,
        Some(close) if close < measured.fair_value - band => RegimeDirection::Bearish,
        _ => RegimeDirection::Neutral,
    };

    let confidence = round2(50.0 + 40.0 * trend_strength.clamp(0.0, 1.0));
    RegimeState {
        regime,
        direction,
        probability: confidence,
        confidence,
        timestamp: as_of,
    }
}

/// [`RegimeClassifier`] backed by [`detect_regime`]
#[derive(Debug, Clone, Default)]
pub struct HeuristicRegimeClassifier {
    pub config: MarketStateConfig,
}

#[async_trait]
impl RegimeClassifier for HeuristicRegimeClassifier {
    async fn classify(&self, input: RegimeInput<'_>) -> anyhow::Result<RegimeState> {
        Ok(detect_regime(
            input.bars,
            input.gex,
            input.volume_trend,
            input.trend_strength,
            input.as_of,
            &self.config,
        ))
    }
}
