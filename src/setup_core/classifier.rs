//! Setup archetype classification from regime and indicator context.

use super::types::{Regime, SetupType};

/// Max distance between the last settled close and the fast EMA for a pullback
pub const TREND_PULLBACK_EMA_DISTANCE: f64 = 10.0;

/// Zone-to-flip distance that counts as "at the flip"
pub const NEAR_FLIP_DISTANCE: f64 = 10.0;

#[derive(Debug, Clone, Copy)]
pub struct ClassifierInput {
    pub regime: Regime,
    pub ema_aligned: bool,
    pub volume_regime_aligned: bool,
    /// Fast EMA, when indicator context is available
    pub fast_ema: Option<f64>,
    /// Close of the latest completed bar. The live price is deliberately not
    /// an input.
    pub latest_completed_close: Option<f64>,
    pub zone_center: f64,
    pub flip_point: f64,
    pub net_gex: f64,
}

/// Fixed mapping used for every regime except a confirmed trend.
pub fn setup_type_for_regime(regime: Regime) -> SetupType {
    match regime {
        Regime::Ranging => SetupType::FadeAtWall,
        Regime::Breakout => SetupType::BreakoutVacuum,
        Regime::Compression => SetupType::MeanReversion,
        Regime::Trending => SetupType::TrendContinuation,
    }
}

pub fn classify_setup_type(input: &ClassifierInput) -> SetupType {
    if input.regime != Regime::Trending {
        return setup_type_for_regime(input.regime);
    }

    if input.ema_aligned && input.volume_regime_aligned {
        return match (input.latest_completed_close, input.fast_ema) {
            (Some(close), Some(ema)) if (close - ema).abs() <= TREND_PULLBACK_EMA_DISTANCE => {
                SetupType::TrendPullback
            }
            _ => SetupType::TrendContinuation,
        };
    }

    let near_flip = (input.zone_center - input.flip_point).abs() <= NEAR_FLIP_DISTANCE;
    if near_flip || input.net_gex < 0.0 {
        SetupType::BreakoutVacuum
    } else {
        SetupType::TrendContinuation
    }
}

/// Whether an archetype's natural regime matches the current one.
pub fn is_regime_aligned(setup_type: SetupType, regime: Regime) -> bool {
    use SetupType::*;
    match regime {
        Regime::Ranging => matches!(
            setup_type,
            FadeAtWall | MeanReversion | FlipReclaim | VwapFadeAtBand
        ),
        Regime::Compression => matches!(
            setup_type,
            MeanReversion | BreakoutVacuum | OrbBreakout | FlipReclaim | TrendPullback | VwapReclaim
        ),
        Regime::Trending => matches!(
            setup_type,
            TrendContinuation | BreakoutVacuum | TrendPullback | VwapReclaim
        ),
        Regime::Breakout => matches!(
            setup_type,
            BreakoutVacuum | TrendContinuation | OrbBreakout | FlipReclaim | TrendPullback
        ),
    }
}
