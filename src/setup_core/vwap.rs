//! VWAP setup geometry
//!
//! Session VWAP with volume-weighted deviation bands, reclaim/fade detection
//! against those bands, and entry/stop/target construction for the two
//! VWAP archetypes.

use super::types::{round2, Band, Direction, EntryZone, MinuteBar, VwapBands};

/// Points beyond the 2σ edge for a band-fade stop
pub const VWAP_FADE_STOP_OFFSET: f64 = 2.25;

/// Fraction of the vwap-to-1σ distance used for the second fade target
const VWAP_FADE_T2_FRACTION: f64 = 0.25;

/// Session VWAP from typical price, with 1σ/1.5σ/2σ bands from the
/// volume-weighted variance of typical price. Zero-volume sessions fall back
/// to equal weights.
pub fn compute_vwap_bands(bars: &[MinuteBar]) -> Option<VwapBands> {
    let usable: Vec<&MinuteBar> = bars.iter().filter(|bar| bar.has_valid_close()).collect();
    if usable.is_empty() {
        return None;
    }

    let typical = |bar: &MinuteBar| (bar.high_or_close() + bar.low_or_close() + bar.close) / 3.0;
    let total_volume: f64 = usable.iter().map(|bar| bar.volume_or_zero()).sum();
    let weight = |bar: &MinuteBar| {
        if total_volume > 0.0 {
            bar.volume_or_zero()
        } else {
            1.0
        }
    };

    let sum_w: f64 = usable.iter().map(|bar| weight(bar)).sum();
    if sum_w <= 0.0 {
        return None;
    }
    let vwap = usable.iter().map(|bar| typical(bar) * weight(bar)).sum::<f64>() / sum_w;
    let variance = usable
        .iter()
        .map(|bar| weight(bar) * (typical(bar) - vwap).powi(2))
        .sum::<f64>()
        / sum_w;
    let sigma = variance.max(0.0).sqrt();

    let band = |mult: f64| Band {
        upper: round2(vwap + sigma * mult),
        lower: round2(vwap - sigma * mult),
    };

    Some(VwapBands {
        vwap: round2(vwap),
        band_1sd: band(1.0),
        band_15sd: band(1.5),
        band_2sd: band(2.0),
    })
}

/// Price crossing back through VWAP from the previous close and staying
/// inside the 1σ band.
pub fn detect_vwap_reclaim(previous_close: f64, current_price: f64, bands: &VwapBands) -> Option<Direction> {
    let vwap = bands.vwap;
    if previous_close <= vwap && vwap < current_price && current_price <= bands.band_1sd.upper {
        return Some(Direction::Bullish);
    }
    if previous_close >= vwap && vwap > current_price && current_price >= bands.band_1sd.lower {
        return Some(Direction::Bearish);
    }
    None
}

/// Price stretched into the 1.5σ-2σ band, faded back toward VWAP. Beyond
/// the 2σ band is not a fade.
pub fn detect_vwap_fade(current_price: f64, bands: &VwapBands) -> Option<Direction> {
    if current_price >= bands.band_15sd.upper && current_price <= bands.band_2sd.upper {
        return Some(Direction::Bearish);
    }
    if current_price >= bands.band_2sd.lower && current_price <= bands.band_15sd.lower {
        return Some(Direction::Bullish);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VwapGeometry {
    pub entry_zone: EntryZone,
    pub stop: f64,
    pub target1: f64,
    pub target2: f64,
}

pub fn reclaim_geometry(direction: Direction, bands: &VwapBands) -> VwapGeometry {
    let half_width = bands.band_1sd.width() / 4.0;
    let entry_zone = EntryZone {
        low: round2(bands.vwap - half_width),
        high: round2(bands.vwap + half_width),
    };
    match direction {
        Direction::Bullish => VwapGeometry {
            entry_zone,
            stop: round2(bands.band_15sd.lower),
            target1: round2(bands.band_1sd.upper),
            target2: round2(bands.band_15sd.upper),
        },
        Direction::Bearish => VwapGeometry {
            entry_zone,
            stop: round2(bands.band_15sd.upper),
            target1: round2(bands.band_1sd.lower),
            target2: round2(bands.band_15sd.lower),
        },
    }
}

pub fn fade_geometry(direction: Direction, bands: &VwapBands) -> VwapGeometry {
    match direction {
        // Fading a stretch below VWAP
        Direction::Bullish => {
            let edge = bands.band_1sd.lower;
            VwapGeometry {
                entry_zone: EntryZone {
                    low: round2(bands.band_2sd.lower),
                    high: round2(bands.band_15sd.lower),
                },
                stop: round2(bands.band_2sd.lower - VWAP_FADE_STOP_OFFSET),
                target1: round2(edge),
                target2: round2(bands.vwap + VWAP_FADE_T2_FRACTION * (edge - bands.vwap)),
            }
        }
        Direction::Bearish => {
            let edge = bands.band_1sd.upper;
            VwapGeometry {
                entry_zone: EntryZone {
                    low: round2(bands.band_15sd.upper),
                    high: round2(bands.band_2sd.upper),
                },
                stop: round2(bands.band_2sd.upper + VWAP_FADE_STOP_OFFSET),
                target1: round2(edge),
                target2: round2(bands.vwap + VWAP_FADE_T2_FRACTION * (edge - bands.vwap)),
            }
        }
    }
}
