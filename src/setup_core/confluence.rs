//! Confluence scoring
//!
//! Two views of the same evidence:
//! - the discrete score counts boolean signals (0-5) and drives forming/ready
//! - the decayed score weights each component by how fresh it is, using an
//!   exponential half-life per component, and is reported alongside

use super::types::{ClusterZone, Direction, ZoneType};

/// Maximum confluence, discrete or decayed
pub const MAX_CONFLUENCE: f64 = 5.0;

/// Distance within which a fib level touches the zone center
pub const FIB_TOUCH_TOLERANCE: f64 = 0.5;

/// Signals evaluated for one zone and direction
#[derive(Debug, Clone)]
pub struct ConfluenceInput<'a> {
    pub zone: &'a ClusterZone,
    pub direction: Direction,
    pub current_price: f64,
    pub flip_point: f64,
    pub net_gex: f64,
    pub fib_touch: bool,
    pub regime_aligned: bool,
    pub flow_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfluenceScore {
    pub score: u8,
    pub sources: Vec<String>,
    pub gex_aligned: bool,
}

/// Price above the flip (or positive gamma) supports longs; mirrored for shorts.
pub fn is_gex_aligned(direction: Direction, current_price: f64, flip_point: f64, net_gex: f64) -> bool {
    match direction {
        Direction::Bullish => current_price >= flip_point || net_gex > 0.0,
        Direction::Bearish => current_price <= flip_point || net_gex < 0.0,
    }
}

pub fn calculate_confluence(input: &ConfluenceInput<'_>) -> ConfluenceScore {
    let mut sources = Vec::with_capacity(5);

    if matches!(input.zone.zone_type, ZoneType::Fortress | ZoneType::Defended) {
        sources.push("level_quality".to_string());
    }

    let gex_aligned = is_gex_aligned(
        input.direction,
        input.current_price,
        input.flip_point,
        input.net_gex,
    );
    if gex_aligned {
        sources.push("gex_alignment".to_string());
    }
    if input.flow_confirmed {
        sources.push("flow_confirmation".to_string());
    }
    if input.fib_touch {
        sources.push("fibonacci_touch".to_string());
    }
    if input.regime_aligned {
        sources.push("regime_alignment".to_string());
    }

    ConfluenceScore {
        score: sources.len().min(MAX_CONFLUENCE as usize) as u8,
        sources,
        gex_aligned,
    }
}

/// Win rate (percent) looked up from the discrete score.
pub fn probability_for_score(score: u8) -> f64 {
    match score {
        1 => 35.0,
        2 => 45.0,
        3 => 58.0,
        4 => 71.0,
        5 => 82.0,
        _ => 32.0,
    }
}

/// Evidence families with their own freshness horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfluenceComponent {
    Flow,
    Gex,
    Regime,
    Ema,
    Zone,
    Memory,
}

impl ConfluenceComponent {
    pub fn half_life_ms(self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            ConfluenceComponent::Flow => 2 * MINUTE,
            ConfluenceComponent::Gex => 15 * MINUTE,
            ConfluenceComponent::Regime => 10 * MINUTE,
            ConfluenceComponent::Ema => 5 * MINUTE,
            ConfluenceComponent::Zone => 30 * MINUTE,
            ConfluenceComponent::Memory => 60 * MINUTE,
        }
    }
}

/// One weighted observation and how long ago it was made
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayInput {
    pub component: ConfluenceComponent,
    pub value: f64,
    pub age_ms: i64,
}

/// 0.5^(age / half_life). Negative ages (clock skew) count as fresh.
pub fn decay_factor(age_ms: i64, half_life_ms: i64) -> f64 {
    if half_life_ms <= 0 {
        return 0.0;
    }
    let age = age_ms.max(0) as f64;
    0.5f64.powf(age / half_life_ms as f64)
}

pub fn decayed_confluence_score(inputs: &[DecayInput]) -> f64 {
    let total: f64 = inputs
        .iter()
        .filter(|input| input.value.is_finite())
        .map(|input| input.value * decay_factor(input.age_ms, input.component.half_life_ms()))
        .sum();
    total.clamp(0.0, MAX_CONFLUENCE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(zone_type: ZoneType) -> ClusterZone {
        ClusterZone {
            id: "z1".to_string(),
            price_low: 5000.0,
            price_high: 5004.0,
            cluster_score: 3.0,
            zone_type,
            test_count: 0,
            last_test_at: None,
            held: None,
            hold_rate: None,
        }
    }

    #[test]
    fn test_flow_decays_to_quarter_after_two_half_lives() {
        let score = decayed_confluence_score(&[DecayInput {
            component: ConfluenceComponent::Flow,
            value: 1.0,
            age_ms: 4 * 60_000,
        }]);
        assert!((score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_zone_decays_to_half_after_one_half_life() {
        let score = decayed_confluence_score(&[DecayInput {
            component: ConfluenceComponent::Zone,
            value: 1.0,
            age_ms: 30 * 60_000,
        }]);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_decayed_score_is_capped() {
        let inputs: Vec<DecayInput> = [
            ConfluenceComponent::Flow,
            ConfluenceComponent::Gex,
            ConfluenceComponent::Regime,
            ConfluenceComponent::Ema,
            ConfluenceComponent::Zone,
            ConfluenceComponent::Memory,
        ]
        .into_iter()
        .map(|component| DecayInput { component, value: 3.0, age_ms: 0 })
        .collect();
        assert_eq!(decayed_confluence_score(&inputs), 5.0);
    }

    #[test]
    fn test_negative_age_counts_as_fresh() {
        assert_eq!(decay_factor(-10_000, 60_000), 1.0);
    }

    #[test]
    fn test_discrete_score_counts_signals() {
        let fortress = zone(ZoneType::Fortress);
        let result = calculate_confluence(&ConfluenceInput {
            zone: &fortress,
            direction: Direction::Bullish,
            current_price: 5010.0,
            flip_point: 5020.0,
            net_gex: 1.0,
            fib_touch: true,
            regime_aligned: false,
            flow_confirmed: true,
        });
        assert_eq!(result.score, 4);
        assert_eq!(
            result.sources,
            vec!["level_quality", "gex_alignment", "flow_confirmation", "fibonacci_touch"]
        );

        let minor = zone(ZoneType::Minor);
        let result = calculate_confluence(&ConfluenceInput {
            zone: &minor,
            direction: Direction::Bearish,
            current_price: 5010.0,
            flip_point: 5000.0,
            net_gex: 2.0,
            fib_touch: false,
            regime_aligned: false,
            flow_confirmed: false,
        });
        assert_eq!(result.score, 0);
        assert!(!result.gex_aligned);
        assert_eq!(probability_for_score(result.score), 32.0);
    }
}
