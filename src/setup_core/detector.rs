//! Setup detection cycle
//!
//! Rebuilds the candidate list from scratch every cycle: picks the zones
//! nearest to price, scores them, classifies the archetype, builds the trade
//! geometry and advances each candidate through the lifecycle using the
//! previous cycle's records (matched by stable id) and the hysteresis
//! counters in the [`ContextTracker`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::classifier::{classify_setup_type, is_regime_aligned, ClassifierInput};
use super::confluence::{
    calculate_confluence, decayed_confluence_score, probability_for_score, ConfluenceComponent,
    ConfluenceInput, DecayInput, FIB_TOUCH_TOLERANCE,
};
use super::config::LifecycleConfig;
use super::context::{ContextSignals, ContextTracker};
use super::entry_zone::orb_entry_zone;
use super::identity::setup_id;
use super::lifecycle::{
    advance, base_status, carry_forward_missing, sort_and_rank, LifecycleInput, SetupGeometry,
};
use super::types::{
    round2, session_date, ClusterZone, Direction, EntryZone, FibLevel, FlowEvent, GexLandscape,
    IndicatorContext, InvalidationReason, LevelData, PriceTarget, Regime, RegimeState, Setup,
    SetupStatus, SetupType, VolumeTrend, ZoneType,
};
use super::vwap::{detect_vwap_fade, detect_vwap_reclaim, fade_geometry, reclaim_geometry};

/// Zones evaluated per cycle
pub const MAX_CANDIDATE_ZONES: usize = 8;

pub const FLOW_CONFIRMATION_WINDOW_MS: i64 = 20 * 60 * 1000;
/// Strike distance from the zone center that counts as local flow
pub const FLOW_ZONE_TOLERANCE: f64 = 12.0;
pub const FLOW_MIN_DIRECTIONAL_PREMIUM: f64 = 75_000.0;
pub const FLOW_MIN_LOCAL_PREMIUM: f64 = 150_000.0;
pub const FLOW_MIN_LOCAL_EVENTS: usize = 2;

pub const EMA_MIN_SLOPE: f64 = 0.05;
pub const EMA_PRICE_TOLERANCE: f64 = 4.0;

pub const ORB_ACTIVE_WINDOW_MINUTES: i64 = 120;
pub const ORB_BREAK_CONFIRM: f64 = 1.5;

const FORTRESS_STOP_BUFFER: f64 = 2.5;
const DEFAULT_STOP_BUFFER: f64 = 1.5;
const FADE_STOP_BUFFER: f64 = 2.25;
const MIN_FALLBACK_DISTANCE: f64 = 6.0;

/// Dependency snapshots for one cycle. The engine treats these as
/// immutable for the duration of the cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleInputs {
    pub levels: LevelData,
    pub gex: GexLandscape,
    pub fib_levels: Vec<FibLevel>,
    pub regime: RegimeState,
    pub flow_events: Vec<FlowEvent>,
    #[serde(default)]
    pub indicator_context: Option<IndicatorContext>,
}

/// The 8 zones closest to price, ties broken by the stronger cluster.
pub fn pick_candidate_zones(zones: &[ClusterZone], current_price: f64) -> Vec<&ClusterZone> {
    let mut ranked: Vec<(&ClusterZone, f64)> = zones
        .iter()
        .map(|zone| (zone, (zone.center() - current_price).abs()))
        .collect();
    ranked.sort_by(|(a, da), (b, db)| {
        da.total_cmp(db)
            .then_with(|| b.cluster_score.total_cmp(&a.cluster_score))
    });
    ranked
        .into_iter()
        .take(MAX_CANDIDATE_ZONES)
        .map(|(zone, _)| zone)
        .collect()
}

/// Support below price is a long, resistance above a short.
pub fn setup_direction(zone: &ClusterZone, current_price: f64) -> Direction {
    if zone.center() <= current_price {
        Direction::Bullish
    } else {
        Direction::Bearish
    }
}

pub fn has_regime_conflict(direction: Direction, regime: &RegimeState, confidence_threshold: u32) -> bool {
    if regime.confidence < confidence_threshold as f64 {
        return false;
    }
    match regime.direction.as_direction() {
        Some(regime_direction) => regime_direction != direction,
        None => false,
    }
}

fn is_recent(event: &FlowEvent, now_ms: i64) -> bool {
    let delta = now_ms - event.timestamp.timestamp_millis();
    (0..=FLOW_CONFIRMATION_WINDOW_MS).contains(&delta)
}

fn premium_of(event: &FlowEvent) -> f64 {
    if event.premium.is_finite() {
        event.premium
    } else {
        0.0
    }
}

/// Share of recent directional premium on the setup's side, or `None`
/// when there is too little premium to judge.
pub fn flow_alignment_percent(events: &[FlowEvent], direction: Direction, now_ms: i64) -> Option<f64> {
    let (mut bullish, mut bearish) = (0.0, 0.0);
    for event in events.iter().filter(|e| is_recent(e, now_ms)) {
        match event.direction {
            Direction::Bullish => bullish += premium_of(event),
            Direction::Bearish => bearish += premium_of(event),
        }
    }
    let total = bullish + bearish;
    if total < FLOW_MIN_DIRECTIONAL_PREMIUM {
        return None;
    }
    let aligned = match direction {
        Direction::Bullish => bullish,
        Direction::Bearish => bearish,
    };
    Some(aligned * 100.0 / total)
}

/// Recent same-direction premium that is large overall and concentrated
/// near the zone.
pub fn has_flow_confirmation(events: &[FlowEvent], direction: Direction, zone_center: f64, now_ms: i64) -> bool {
    let directional: Vec<&FlowEvent> = events
        .iter()
        .filter(|e| e.direction == direction && is_recent(e, now_ms))
        .collect();
    if directional.is_empty() {
        return false;
    }
    let total: f64 = directional.iter().map(|e| premium_of(e)).sum();
    if total < FLOW_MIN_DIRECTIONAL_PREMIUM {
        return false;
    }
    let local: Vec<&&FlowEvent> = directional
        .iter()
        .filter(|e| (e.strike - zone_center).abs() <= FLOW_ZONE_TOLERANCE)
        .collect();
    let local_premium: f64 = local.iter().map(|e| premium_of(e)).sum();

    local_premium >= FLOW_MIN_LOCAL_PREMIUM
        || (local.len() >= FLOW_MIN_LOCAL_EVENTS && local_premium >= FLOW_MIN_DIRECTIONAL_PREMIUM)
}

pub fn is_ema_aligned(direction: Direction, current_price: f64, context: Option<&IndicatorContext>) -> bool {
    let Some(ctx) = context else {
        return false;
    };
    match direction {
        Direction::Bullish => {
            ctx.ema_fast >= ctx.ema_slow
                && ctx.ema_fast_slope >= -EMA_MIN_SLOPE
                && current_price >= ctx.ema_fast - EMA_PRICE_TOLERANCE
        }
        Direction::Bearish => {
            ctx.ema_fast <= ctx.ema_slow
                && ctx.ema_fast_slope <= EMA_MIN_SLOPE
                && current_price <= ctx.ema_fast + EMA_PRICE_TOLERANCE
        }
    }
}

/// Trending/breakout regimes need rising volume; the others need it quiet.
pub fn is_volume_regime_aligned(regime: Regime, context: Option<&IndicatorContext>) -> bool {
    let trend = context.map(|ctx| ctx.volume_trend).unwrap_or(VolumeTrend::Flat);
    match regime {
        Regime::Trending | Regime::Breakout => trend == VolumeTrend::Rising,
        Regime::Ranging | Regime::Compression => {
            matches!(trend, VolumeTrend::Flat | VolumeTrend::Falling)
        }
    }
}

/// Default target distance when no zone lies beyond the setup.
pub fn fallback_distance(gex: &GexLandscape) -> f64 {
    MIN_FALLBACK_DISTANCE.max((gex.combined.call_wall - gex.combined.put_wall).abs() / 4.0)
}

/// Mid of the next two zones beyond `reference` in the trade direction,
/// else one and two fallback distances away.
pub fn target_prices(
    zones: &[ClusterZone],
    reference: f64,
    direction: Direction,
    fallback: f64,
) -> (f64, f64) {
    let mut beyond: Vec<&ClusterZone> = match direction {
        Direction::Bullish => zones.iter().filter(|z| z.price_low > reference).collect(),
        Direction::Bearish => zones.iter().filter(|z| z.price_high < reference).collect(),
    };
    match direction {
        Direction::Bullish => beyond.sort_by(|a, b| a.price_low.total_cmp(&b.price_low)),
        Direction::Bearish => beyond.sort_by(|a, b| b.price_high.total_cmp(&a.price_high)),
    }
    let sign = direction.sign();
    let first = beyond
        .first()
        .map(|z| z.center())
        .unwrap_or(reference + sign * fallback);
    let second = beyond
        .get(1)
        .map(|z| z.center())
        .unwrap_or(reference + sign * fallback * 2.0);
    (round2(first), round2(second))
}

/// Keep trend-family targets within [1.0R, 2.2R] and [1.6R, 3.4R] of the
/// entry midpoint, with target 2 clearly beyond target 1.
pub fn bound_trend_targets(
    direction: Direction,
    entry: &EntryZone,
    stop: f64,
    target1: f64,
    target2: f64,
) -> (f64, f64) {
    let mid = entry.mid();
    let risk = (mid - stop).abs().max(0.5);
    let t1_distance = (target1 - mid).abs().max(0.25).clamp(risk * 1.0, risk * 2.2);
    let t2_distance = (target2 - mid)
        .abs()
        .max(0.4)
        .clamp(risk * 1.6, risk * 3.4)
        .max(t1_distance + (risk * 0.55).max(0.35));
    let sign = direction.sign();
    (round2(mid + sign * t1_distance), round2(mid + sign * t2_distance))
}

fn stop_buffer(setup_type: SetupType, zone_type: ZoneType) -> f64 {
    let base = if zone_type == ZoneType::Fortress {
        FORTRESS_STOP_BUFFER
    } else {
        DEFAULT_STOP_BUFFER
    };
    if setup_type.is_fade_family() {
        base.max(FADE_STOP_BUFFER)
    } else {
        base
    }
}

/// VWAP or opening-range refinement of the classified archetype, with the
/// geometry that comes with it.
struct Refinement {
    setup_type: SetupType,
    entry_zone: EntryZone,
    stop: Option<f64>,
    targets: Option<(f64, f64)>,
}

fn refine_archetype(
    direction: Direction,
    current_price: f64,
    zone: &ClusterZone,
    context: Option<&IndicatorContext>,
    config: &LifecycleConfig,
) -> Option<Refinement> {
    let ctx = context?;

    if config.orb_enabled && ctx.minutes_since_open <= ORB_ACTIVE_WINDOW_MINUTES {
        let edge = match direction {
            Direction::Bullish if current_price >= ctx.orb_high + ORB_BREAK_CONFIRM => Some(ctx.orb_high),
            Direction::Bearish if current_price <= ctx.orb_low - ORB_BREAK_CONFIRM => Some(ctx.orb_low),
            _ => None,
        };
        if let Some(edge) = edge {
            return Some(Refinement {
                setup_type: SetupType::OrbBreakout,
                entry_zone: orb_entry_zone(zone.price_low, zone.price_high, edge),
                stop: None,
                targets: None,
            });
        }
    }

    if config.vwap_enabled {
        let bands = ctx.vwap.as_ref()?;
        if let (Some(latest), Some(prior)) = (ctx.latest_bar, ctx.prior_bar) {
            if detect_vwap_reclaim(prior.close, latest.close, bands) == Some(direction) {
                let geometry = reclaim_geometry(direction, bands);
                return Some(Refinement {
                    setup_type: SetupType::VwapReclaim,
                    entry_zone: geometry.entry_zone,
                    stop: Some(geometry.stop),
                    targets: Some((geometry.target1, geometry.target2)),
                });
            }
        }
        if detect_vwap_fade(current_price, bands) == Some(direction) {
            let geometry = fade_geometry(direction, bands);
            return Some(Refinement {
                setup_type: SetupType::VwapFadeAtBand,
                entry_zone: geometry.entry_zone,
                stop: Some(geometry.stop),
                targets: Some((geometry.target1, geometry.target2)),
            });
        }
    }

    None
}

fn age_ms(now: DateTime<Utc>, then: DateTime<Utc>) -> i64 {
    (now - then).num_milliseconds()
}

/// Per-cycle detector. Owns the process-local hysteresis table.
#[derive(Debug, Default)]
pub struct SetupDetector {
    context: ContextTracker,
}

impl SetupDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all hysteresis state, e.g. between replayed dates.
    pub fn reset(&mut self) {
        self.context.clear();
    }

    pub fn context(&self) -> &ContextTracker {
        &self.context
    }

    /// Run one detection cycle at `now` against the previous cycle's list.
    pub fn detect(
        &mut self,
        inputs: &CycleInputs,
        previous: &[Setup],
        now: DateTime<Utc>,
        config: &LifecycleConfig,
    ) -> Vec<Setup> {
        let current_price = inputs.gex.spx.spot_price;
        let now_ms = now.timestamp_millis();
        let date = session_date(now);
        let previous_by_id: HashMap<&str, &Setup> =
            previous.iter().map(|setup| (setup.id.as_str(), setup)).collect();
        let fallback = fallback_distance(&inputs.gex);
        let combined = &inputs.gex.combined;
        let indicator = inputs.indicator_context.as_ref();

        let mut seen: HashSet<String> = HashSet::new();
        let mut setups: Vec<Setup> = Vec::new();

        for zone in pick_candidate_zones(&inputs.levels.clusters, current_price) {
            let direction = setup_direction(zone, current_price);
            let center = zone.center();

            let regime_conflict = has_regime_conflict(
                direction,
                &inputs.regime,
                config.regime_conflict_confidence_threshold,
            );
            let alignment = flow_alignment_percent(&inputs.flow_events, direction, now_ms);
            let flow_divergence =
                alignment.is_some_and(|pct| pct < config.flow_divergence_threshold as f64);
            let fib_touch = inputs
                .fib_levels
                .iter()
                .any(|fib| (fib.price - center).abs() <= FIB_TOUCH_TOLERANCE);
            let ema_aligned = is_ema_aligned(direction, current_price, indicator);
            let volume_aligned = is_volume_regime_aligned(inputs.regime.regime, indicator);
            let flow_confirmed = has_flow_confirmation(&inputs.flow_events, direction, center, now_ms);

            let classified = classify_setup_type(&ClassifierInput {
                regime: inputs.regime.regime,
                ema_aligned,
                volume_regime_aligned: volume_aligned,
                fast_ema: indicator.map(|ctx| ctx.ema_fast),
                latest_completed_close: indicator
                    .and_then(|ctx| ctx.latest_completed_bar())
                    .map(|bar| bar.close),
                zone_center: center,
                flip_point: combined.flip_point,
                net_gex: combined.net_gex,
            });
            let refinement = refine_archetype(direction, current_price, zone, indicator, config);
            let setup_type = refinement.as_ref().map_or(classified, |r| r.setup_type);

            let id = setup_id(date, setup_type, &zone.id, zone.price_low, zone.price_high);
            if !seen.insert(id.clone()) {
                continue;
            }
            let prev = previous_by_id.get(id.as_str()).copied();

            // Terminal states absorb
            if let Some(prev) = prev.filter(|p| p.status.is_terminal()) {
                setups.push(prev.clone());
                continue;
            }

            let regime_aligned = is_regime_aligned(setup_type, inputs.regime.regime);
            let confluence = calculate_confluence(&ConfluenceInput {
                zone,
                direction,
                current_price,
                flip_point: combined.flip_point,
                net_gex: combined.net_gex,
                fib_touch,
                regime_aligned,
                flow_confirmed,
            });

            let entry_zone = refinement.as_ref().map_or(
                EntryZone {
                    low: round2(zone.price_low),
                    high: round2(zone.price_high),
                },
                |r| r.entry_zone,
            );
            let stop = refinement.as_ref().and_then(|r| r.stop).unwrap_or_else(|| {
                let buffer = stop_buffer(setup_type, zone.zone_type);
                match direction {
                    Direction::Bullish => round2(entry_zone.low - buffer),
                    Direction::Bearish => round2(entry_zone.high + buffer),
                }
            });
            let (target1, target2) = match refinement.as_ref().and_then(|r| r.targets) {
                Some(targets) => targets,
                None => {
                    let (t1, t2) = target_prices(&inputs.levels.clusters, center, direction, fallback);
                    if setup_type.is_trend_family() {
                        bound_trend_targets(direction, &entry_zone, stop, t1, t2)
                    } else {
                        (t1, t2)
                    }
                }
            };

            let fresh = SetupGeometry {
                direction,
                entry_zone,
                stop,
                target1: PriceTarget::target1(target1),
                target2: PriceTarget::target2(target2),
            };
            let computed = base_status(confluence.score, current_price, &fresh.entry_zone);
            let geometry = SetupGeometry::effective(prev, fresh);

            let context = self.context.update(
                &id,
                now_ms,
                ContextSignals {
                    regime_conflict,
                    flow_divergence,
                    stop_breach: geometry.is_stop_breached(current_price),
                },
            );
            let outcome = advance(&LifecycleInput {
                computed,
                current_price,
                fallback_distance: fallback,
                geometry: &geometry,
                previous: prev,
                context,
                now,
                config,
            });

            let decayed = self.decayed_score(
                inputs,
                zone,
                direction,
                now,
                confluence.gex_aligned,
                regime_aligned,
                ema_aligned,
                flow_confirmed,
            );

            setups.push(Setup {
                id,
                setup_type,
                direction: geometry.direction,
                entry_zone: geometry.entry_zone,
                stop: geometry.stop,
                target1: geometry.target1,
                target2: geometry.target2,
                confluence_score: confluence.score,
                confluence_sources: confluence.sources,
                decayed_confluence_score: round2(decayed),
                cluster_zone: zone.clone(),
                regime: inputs.regime.regime,
                status: outcome.metadata.status,
                status_updated_at: outcome.metadata.status_updated_at,
                ttl_expires_at: outcome.metadata.ttl_expires_at,
                invalidation_reason: outcome.metadata.invalidation_reason,
                probability: probability_for_score(confluence.score),
                flow_confirmed,
                ema_aligned,
                volume_regime_aligned: volume_aligned,
                alignment_score: alignment.map(round2),
                rank: None,
                created_at: prev.map_or(now, |p| p.created_at),
                triggered_at: outcome.triggered_at,
            });
        }

        let current_ids: HashSet<String> = setups.iter().map(|s| s.id.clone()).collect();
        setups.extend(carry_forward_missing(previous, &current_ids, current_price, now, config));

        let active: HashSet<String> = setups
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id.clone())
            .collect();
        self.context.prune(&active, now_ms);

        sort_and_rank(&mut setups);
        log_cycle(&setups, config);
        setups
    }

    #[allow(clippy::too_many_arguments)]
    fn decayed_score(
        &self,
        inputs: &CycleInputs,
        zone: &ClusterZone,
        direction: Direction,
        now: DateTime<Utc>,
        gex_aligned: bool,
        regime_aligned: bool,
        ema_aligned: bool,
        flow_confirmed: bool,
    ) -> f64 {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let zone_seen = zone.last_test_at.unwrap_or(inputs.levels.generated_at);
        let now_ms = now.timestamp_millis();
        let latest_flow = inputs
            .flow_events
            .iter()
            .filter(|e| e.direction == direction && is_recent(e, now_ms))
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(now);

        let mut components = vec![
            DecayInput {
                component: ConfluenceComponent::Flow,
                value: flag(flow_confirmed),
                age_ms: age_ms(now, latest_flow),
            },
            DecayInput {
                component: ConfluenceComponent::Gex,
                value: flag(gex_aligned),
                age_ms: age_ms(now, inputs.gex.combined.timestamp),
            },
            DecayInput {
                component: ConfluenceComponent::Regime,
                value: flag(regime_aligned),
                age_ms: age_ms(now, inputs.regime.timestamp),
            },
            DecayInput {
                component: ConfluenceComponent::Zone,
                value: flag(matches!(zone.zone_type, ZoneType::Fortress | ZoneType::Defended)),
                age_ms: age_ms(now, zone_seen),
            },
            DecayInput {
                component: ConfluenceComponent::Memory,
                value: flag(zone.held == Some(true)),
                age_ms: age_ms(now, zone_seen),
            },
        ];
        if let Some(ctx) = inputs.indicator_context.as_ref() {
            components.push(DecayInput {
                component: ConfluenceComponent::Ema,
                value: flag(ema_aligned),
                age_ms: age_ms(now, ctx.as_of),
            });
        }
        decayed_confluence_score(&components)
    }
}

fn log_cycle(setups: &[Setup], config: &LifecycleConfig) {
    let count = |status: SetupStatus| setups.iter().filter(|s| s.status == status).count();

    if config.telemetry_enabled {
        let mut reasons: HashMap<InvalidationReason, usize> = HashMap::new();
        for setup in setups.iter().filter(|s| s.status == SetupStatus::Invalidated) {
            *reasons
                .entry(setup.invalidation_reason.unwrap_or(InvalidationReason::Unknown))
                .or_default() += 1;
        }
        let mut histogram: Vec<String> = reasons
            .iter()
            .map(|(reason, n)| format!("{}={}", reason, n))
            .collect();
        histogram.sort();
        info!(
            lifecycle_enabled = config.lifecycle_enabled,
            demotion_streak = config.demotion_streak,
            invalidation_streak = config.invalidation_streak,
            stop_confirmation_ticks = config.stop_confirmation_ticks,
            invalidation_reasons = %histogram.join(","),
            "setup lifecycle telemetry"
        );
    }

    info!(
        count = setups.len(),
        ready = count(SetupStatus::Ready),
        triggered = count(SetupStatus::Triggered),
        invalidated = count(SetupStatus::Invalidated),
        expired = count(SetupStatus::Expired),
        "setups detected"
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::setup_core::lifecycle::tests::t;
    use crate::setup_core::types::{FlowEventType, GexProfile, RegimeDirection};

    pub(crate) fn zone(id: &str, low: f64, high: f64, zone_type: ZoneType) -> ClusterZone {
        ClusterZone {
            id: id.to_string(),
            price_low: low,
            price_high: high,
            cluster_score: 3.0,
            zone_type,
            test_count: 1,
            last_test_at: None,
            held: None,
            hold_rate: None,
        }
    }

    fn profile(spot: f64, at: DateTime<Utc>) -> GexProfile {
        GexProfile {
            symbol: "SPX".to_string(),
            spot_price: spot,
            net_gex: 1_000.0,
            flip_point: 4990.0,
            call_wall: 5040.0,
            put_wall: 4960.0,
            gex_by_strike: vec![],
            timestamp: at,
        }
    }

    /// Ranging market, price 5010, one defended support and two resistances.
    pub(crate) fn inputs(spot: f64, at: DateTime<Utc>) -> CycleInputs {
        CycleInputs {
            levels: LevelData {
                clusters: vec![
                    zone("support", 5000.0, 5004.0, ZoneType::Defended),
                    zone("r1", 5018.0, 5020.0, ZoneType::Moderate),
                    zone("r2", 5028.0, 5030.0, ZoneType::Minor),
                ],
                generated_at: at,
            },
            gex: GexLandscape {
                spx: profile(spot, at),
                spy: profile(spot / 10.0, at),
                combined: profile(spot, at),
            },
            fib_levels: vec![],
            regime: RegimeState {
                regime: Regime::Ranging,
                direction: RegimeDirection::Neutral,
                probability: 60.0,
                confidence: 60.0,
                timestamp: at,
            },
            flow_events: vec![],
            indicator_context: None,
        }
    }

    fn support_setup(setups: &[Setup]) -> &Setup {
        setups
            .iter()
            .find(|s| s.cluster_zone.id == "support")
            .unwrap()
    }

    #[test]
    fn test_candidate_zones_by_distance_then_score() {
        let mut zones: Vec<ClusterZone> = (0..10)
            .map(|i| zone(&format!("z{}", i), 5000.0 + i as f64 * 10.0, 5002.0 + i as f64 * 10.0, ZoneType::Minor))
            .collect();
        let mut strong = zone("strong", 4998.0, 5000.0, ZoneType::Minor);
        strong.cluster_score = 9.0;
        zones.push(strong);

        let picked = pick_candidate_zones(&zones, 5000.0);
        assert_eq!(picked.len(), MAX_CANDIDATE_ZONES);
        // Both sit 1 point from price; stronger cluster first
        assert_eq!(picked[0].id, "strong");
        assert_eq!(picked[1].id, "z0");
    }

    #[test]
    fn test_flow_alignment_and_confirmation() {
        let now = t(0);
        let event = |direction: Direction, strike: f64, premium: f64, minutes_ago: i64| FlowEvent {
            id: format!("{}-{}", strike, minutes_ago),
            event_type: FlowEventType::Block,
            symbol: "SPX".to_string(),
            strike,
            expiry: "2026-03-02".to_string(),
            size: 10,
            direction,
            premium,
            timestamp: now - chrono::Duration::minutes(minutes_ago),
        };
        let events = vec![
            event(Direction::Bullish, 5002.0, 160_000.0, 5),
            event(Direction::Bearish, 5050.0, 40_000.0, 5),
            event(Direction::Bearish, 5050.0, 900_000.0, 25),
        ];
        assert_eq!(flow_alignment_percent(&events, Direction::Bullish, now.timestamp_millis()), Some(80.0));
        assert!(has_flow_confirmation(&events, Direction::Bullish, 5002.0, now.timestamp_millis()));
        assert!(!has_flow_confirmation(&events, Direction::Bullish, 5030.0, now.timestamp_millis()));
        assert_eq!(flow_alignment_percent(&events[1..2], Direction::Bullish, now.timestamp_millis()), None);
    }

    #[test]
    fn test_targets_use_next_zones_then_fallback() {
        let zones = vec![
            zone("a", 5018.0, 5020.0, ZoneType::Minor),
            zone("b", 5028.0, 5030.0, ZoneType::Minor),
        ];
        assert_eq!(target_prices(&zones, 5002.0, Direction::Bullish, 20.0), (5019.0, 5029.0));
        assert_eq!(target_prices(&zones, 5002.0, Direction::Bearish, 20.0), (4982.0, 4962.0));
        assert_eq!(target_prices(&zones[..1], 5002.0, Direction::Bullish, 20.0), (5019.0, 5042.0));
    }

    #[test]
    fn test_trend_targets_are_bounded_by_risk() {
        let entry = EntryZone { low: 5000.0, high: 5004.0 };
        // Risk 3.5 from mid 5002
        let (t1, t2) = bound_trend_targets(Direction::Bullish, &entry, 4998.5, 5003.0, 5100.0);
        assert_eq!(t1, 5005.5);
        assert_eq!(t2, 5013.9);
    }

    #[test]
    fn test_ranging_cycle_builds_fade_setup() {
        let mut detector = SetupDetector::new();
        let config = LifecycleConfig::default();
        let setups = detector.detect(&inputs(5010.0, t(0)), &[], t(0), &config);

        let support = support_setup(&setups);
        assert_eq!(support.setup_type, SetupType::FadeAtWall);
        assert_eq!(support.direction, Direction::Bullish);
        // Defended zone, fade buffer 2.25
        assert_eq!(support.stop, 4997.75);
        assert_eq!(support.target1.price, 5019.0);
        assert_eq!(support.target2.price, 5029.0);
        // level_quality + gex_alignment + regime_alignment
        assert_eq!(support.confluence_score, 3);
        assert_eq!(support.status, SetupStatus::Ready);
        assert_eq!(support.probability, 58.0);
        assert_eq!(support.ttl_expires_at, Some(t(25)));
        assert!(support.triggered_at.is_none());
        assert!(setups.iter().all(|s| s.rank.is_some()));
    }

    #[test]
    fn test_regime_conflict_invalidates_triggered_on_third_cycle() {
        let mut detector = SetupDetector::new();
        let config = LifecycleConfig::default();
        let mut previous = Vec::new();

        for minute in 0..3 {
            let mut cycle = inputs(5002.0, t(minute));
            cycle.regime.direction = RegimeDirection::Bearish;
            cycle.regime.confidence = 80.0;
            previous = detector.detect(&cycle, &previous, t(minute), &config);
            let support = support_setup(&previous);
            if minute < 2 {
                assert_eq!(support.status, SetupStatus::Triggered);
            } else {
                assert_eq!(support.status, SetupStatus::Invalidated);
                assert_eq!(support.invalidation_reason, Some(InvalidationReason::RegimeConflict));
                assert_eq!(support.triggered_at, Some(t(0)));
            }
        }
    }

    #[test]
    fn test_ready_demotes_to_forming_under_conflict() {
        let mut detector = SetupDetector::new();
        let config = LifecycleConfig::default();
        let mut previous = Vec::new();
        let mut statuses = Vec::new();

        for minute in 0..2 {
            let mut cycle = inputs(5010.0, t(minute));
            cycle.regime.direction = RegimeDirection::Bearish;
            cycle.regime.confidence = 80.0;
            previous = detector.detect(&cycle, &previous, t(minute), &config);
            statuses.push(support_setup(&previous).status);
        }
        assert_eq!(statuses, vec![SetupStatus::Ready, SetupStatus::Forming]);
    }

    #[test]
    fn test_stop_breach_confirmed_after_two_ticks() {
        let mut detector = SetupDetector::new();
        let config = LifecycleConfig::default();

        let triggered = detector.detect(&inputs(5002.0, t(0)), &[], t(0), &config);
        assert_eq!(support_setup(&triggered).status, SetupStatus::Triggered);

        // Price below the stop: the zone is now above price (bearish by
        // direction) but the frozen long geometry is what is evaluated
        let once = detector.detect(&inputs(4997.0, t(1)), &triggered, t(1), &config);
        let id = support_setup(&triggered).id.clone();
        let first = once.iter().find(|s| s.id == id).unwrap();
        assert_eq!(first.status, SetupStatus::Triggered);

        let twice = detector.detect(&inputs(4997.0, t(2)), &once, t(2), &config);
        let second = twice.iter().find(|s| s.id == id).unwrap();
        assert_eq!(second.status, SetupStatus::Invalidated);
        assert_eq!(second.invalidation_reason, Some(InvalidationReason::StopBreachConfirmed));
        assert_eq!(second.stop, 4997.75);
        assert_eq!(second.direction, Direction::Bullish);
    }

    #[test]
    fn test_ttl_expires_ready_setup() {
        let mut detector = SetupDetector::new();
        let config = LifecycleConfig::default();
        let first = detector.detect(&inputs(5010.0, t(0)), &[], t(0), &config);
        let later = detector.detect(&inputs(5010.0, t(26)), &first, t(26), &config);

        let support = support_setup(&later);
        assert_eq!(support.status, SetupStatus::Expired);
        assert_eq!(support.status_updated_at, t(26));

        // Terminal records absorb
        let after = detector.detect(&inputs(5010.0, t(27)), &later, t(27), &config);
        assert_eq!(support_setup(&after).status, SetupStatus::Expired);
        assert_eq!(support_setup(&after).status_updated_at, t(26));
    }

    #[test]
    fn test_missing_triggered_setup_is_carried_forward() {
        let mut detector = SetupDetector::new();
        let config = LifecycleConfig::default();
        let first = detector.detect(&inputs(5002.0, t(0)), &[], t(0), &config);
        let triggered = support_setup(&first).clone();
        assert_eq!(triggered.status, SetupStatus::Triggered);

        let mut moved = inputs(5010.0, t(1));
        moved.levels.clusters.retain(|z| z.id != "support");
        let next = detector.detect(&moved, &first, t(1), &config);
        let carried = next.iter().find(|s| s.id == triggered.id).unwrap();
        assert_eq!(carried.status, SetupStatus::Triggered);
        assert_eq!(carried.triggered_at, triggered.triggered_at);

        let mut through_target = inputs(5030.0, t(2));
        through_target.levels.clusters.retain(|z| z.id != "support");
        let next = detector.detect(&through_target, &first, t(2), &config);
        let carried = next.iter().find(|s| s.id == triggered.id).unwrap();
        assert_eq!(carried.status, SetupStatus::Expired);
    }

    #[test]
    fn test_identical_cycles_yield_identical_ids() {
        let config = LifecycleConfig::default();
        let a = SetupDetector::new().detect(&inputs(5010.0, t(0)), &[], t(0), &config);
        let b = SetupDetector::new().detect(&inputs(5010.0, t(5)), &[], t(5), &config);
        let ids = |s: &[Setup]| s.iter().map(|x| x.id.clone()).collect::<HashSet<_>>();
        assert_eq!(ids(&a), ids(&b));
    }
}
