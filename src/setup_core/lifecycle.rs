//! Setup Lifecycle State Machine
//!
//! Advances one setup per cycle:
//! 1. FORMING / READY - discrete confluence below / at the ready threshold
//! 2. TRIGGERED - price inside the entry zone; geometry frozen from here on
//! 3. INVALIDATED - confirmed stop breach, persistent context conflict, or
//!    TTL lapse while triggered (terminal)
//! 4. EXPIRED - target 2 reached, zone went stale, or TTL lapse before
//!    trigger (terminal)
//!
//! The only backwards move is the READY -> FORMING demotion under sustained
//! regime conflict or flow divergence.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use super::config::LifecycleConfig;
use super::context::ContextState;
use super::types::{Direction, EntryZone, InvalidationReason, PriceTarget, Setup, SetupStatus};

/// Discrete confluence needed for READY
pub const READY_CONFLUENCE_THRESHOLD: u8 = 3;

/// Floor for the distance at which an untriggered zone goes stale
const MIN_STALE_DISTANCE: f64 = 18.0;
const STALE_FALLBACK_MULT: f64 = 2.5;

/// Trade geometry that freezes at first trigger
#[derive(Debug, Clone, PartialEq)]
pub struct SetupGeometry {
    pub direction: Direction,
    pub entry_zone: EntryZone,
    pub stop: f64,
    pub target1: PriceTarget,
    pub target2: PriceTarget,
}

impl SetupGeometry {
    pub fn of(setup: &Setup) -> Self {
        Self {
            direction: setup.direction,
            entry_zone: setup.entry_zone,
            stop: setup.stop,
            target1: setup.target1.clone(),
            target2: setup.target2.clone(),
        }
    }

    /// Geometry to evaluate this cycle: the previous record's if it was
    /// already triggered, otherwise the freshly computed one.
    pub fn effective(previous: Option<&Setup>, fresh: SetupGeometry) -> SetupGeometry {
        match previous {
            Some(prev) if prev.status == SetupStatus::Triggered => SetupGeometry::of(prev),
            _ => fresh,
        }
    }

    pub fn is_stop_breached(&self, price: f64) -> bool {
        match self.direction {
            Direction::Bullish => price <= self.stop,
            Direction::Bearish => price >= self.stop,
        }
    }

    pub fn is_target2_reached(&self, price: f64) -> bool {
        match self.direction {
            Direction::Bullish => price >= self.target2.price,
            Direction::Bearish => price <= self.target2.price,
        }
    }
}

/// Status from this cycle's evidence alone, before history is applied.
pub fn base_status(confluence_score: u8, current_price: f64, entry_zone: &EntryZone) -> SetupStatus {
    if entry_zone.contains(current_price) {
        SetupStatus::Triggered
    } else if confluence_score >= READY_CONFLUENCE_THRESHOLD {
        SetupStatus::Ready
    } else {
        SetupStatus::Forming
    }
}

/// Apply sticky trigger, target-2 resolution and stale-zone expiry.
pub fn resolve_lifecycle_status(
    computed: SetupStatus,
    current_price: f64,
    fallback_distance: f64,
    geometry: &SetupGeometry,
    previous: Option<&Setup>,
) -> SetupStatus {
    let was_triggered = previous.is_some_and(|prev| prev.status == SetupStatus::Triggered);

    if let Some(prev) = previous.filter(|_| was_triggered) {
        if SetupGeometry::of(prev).is_target2_reached(current_price) {
            return SetupStatus::Expired;
        }
    }

    let mut status = computed;
    if was_triggered {
        status = SetupStatus::Triggered;
    }

    if status == SetupStatus::Triggered && geometry.is_target2_reached(current_price) {
        return SetupStatus::Expired;
    }

    if matches!(status, SetupStatus::Forming | SetupStatus::Ready) {
        let stale_distance = MIN_STALE_DISTANCE.max(fallback_distance * STALE_FALLBACK_MULT);
        if (current_price - geometry.entry_zone.mid()).abs() > stale_distance {
            return SetupStatus::Expired;
        }
    }

    status
}

/// Invalidation reason when either context streak reached the invalidation
/// threshold. Ties go to regime conflict.
pub fn context_invalidation_reason(
    state: &ContextState,
    config: &LifecycleConfig,
) -> Option<InvalidationReason> {
    let regime = state.regime_conflict_streak >= config.invalidation_streak;
    let flow = state.flow_divergence_streak >= config.invalidation_streak;
    match (regime, flow) {
        (false, false) => None,
        (true, true) if state.regime_conflict_streak >= state.flow_divergence_streak => {
            Some(InvalidationReason::RegimeConflict)
        }
        (true, true) => Some(InvalidationReason::FlowDivergence),
        (true, false) => Some(InvalidationReason::RegimeConflict),
        (false, true) => Some(InvalidationReason::FlowDivergence),
    }
}

/// Context-driven overrides, highest priority first: confirmed stop breach,
/// context invalidation of a triggered setup, demotion of a ready one.
pub fn apply_context_overrides(
    status: SetupStatus,
    state: &ContextState,
    config: &LifecycleConfig,
) -> (SetupStatus, Option<InvalidationReason>) {
    if !config.lifecycle_enabled {
        return (status, None);
    }

    let stop_confirmed = state.stop_breach_streak >= config.stop_confirmation_ticks;
    let demote = state.regime_conflict_streak >= config.demotion_streak
        || state.flow_divergence_streak >= config.demotion_streak;

    match status {
        SetupStatus::Ready | SetupStatus::Triggered if stop_confirmed => (
            SetupStatus::Invalidated,
            Some(InvalidationReason::StopBreachConfirmed),
        ),
        SetupStatus::Triggered => match context_invalidation_reason(state, config) {
            Some(reason) => (SetupStatus::Invalidated, Some(reason)),
            None => (status, None),
        },
        SetupStatus::Ready if demote => (SetupStatus::Forming, None),
        _ => (status, None),
    }
}

pub fn ttl_ms_for_status(status: SetupStatus, config: &LifecycleConfig) -> Option<i64> {
    match status {
        SetupStatus::Forming => Some(config.ttl_forming_ms),
        SetupStatus::Ready => Some(config.ttl_ready_ms),
        SetupStatus::Triggered => Some(config.ttl_triggered_ms),
        SetupStatus::Invalidated | SetupStatus::Expired => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleMetadata {
    pub status: SetupStatus,
    pub status_updated_at: DateTime<Utc>,
    pub ttl_expires_at: Option<DateTime<Utc>>,
    pub invalidation_reason: Option<InvalidationReason>,
}

/// Residency bookkeeping. The TTL is measured from when the current status
/// was entered; a lapse sends triggered to invalidated(ttl_expired) and
/// everything else to expired.
pub fn resolve_lifecycle_metadata(
    now: DateTime<Utc>,
    status: SetupStatus,
    previous: Option<&Setup>,
    reason: Option<InvalidationReason>,
    config: &LifecycleConfig,
) -> LifecycleMetadata {
    let mut status = status;
    let mut reason = if status == SetupStatus::Invalidated {
        Some(reason.unwrap_or(InvalidationReason::Unknown))
    } else {
        None
    };

    let mut anchor = match previous {
        Some(prev) if prev.status == status => prev.status_updated_at,
        _ => now,
    };

    let mut ttl_expires_at = None;
    if let Some(ttl_ms) = ttl_ms_for_status(status, config) {
        let deadline = anchor + Duration::milliseconds(ttl_ms);
        if now > deadline {
            if status == SetupStatus::Triggered {
                status = SetupStatus::Invalidated;
                reason = Some(InvalidationReason::TtlExpired);
            } else {
                status = SetupStatus::Expired;
                reason = None;
            }
            anchor = now;
        } else {
            ttl_expires_at = Some(deadline);
        }
    }

    if status == SetupStatus::Invalidated && reason.is_none() {
        reason = Some(
            previous
                .and_then(|prev| prev.invalidation_reason)
                .unwrap_or(InvalidationReason::Unknown),
        );
    }
    if status != SetupStatus::Invalidated {
        reason = None;
    }
    if status.is_terminal() {
        ttl_expires_at = None;
    }

    LifecycleMetadata {
        status,
        status_updated_at: anchor,
        ttl_expires_at,
        invalidation_reason: reason,
    }
}

/// Everything the state machine needs for one setup in one cycle
#[derive(Debug, Clone)]
pub struct LifecycleInput<'a> {
    pub computed: SetupStatus,
    pub current_price: f64,
    pub fallback_distance: f64,
    pub geometry: &'a SetupGeometry,
    pub previous: Option<&'a Setup>,
    pub context: ContextState,
    pub now: DateTime<Utc>,
    pub config: &'a LifecycleConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleOutcome {
    pub metadata: LifecycleMetadata,
    pub triggered_at: Option<DateTime<Utc>>,
}

/// Run the full per-cycle transition for one setup.
pub fn advance(input: &LifecycleInput<'_>) -> LifecycleOutcome {
    let status = resolve_lifecycle_status(
        input.computed,
        input.current_price,
        input.fallback_distance,
        input.geometry,
        input.previous,
    );
    let (status, reason) = apply_context_overrides(status, &input.context, input.config);

    let mut triggered_at = input.previous.and_then(|prev| prev.triggered_at);
    if status == SetupStatus::Triggered && triggered_at.is_none() {
        triggered_at = Some(input.now);
    }

    let metadata = resolve_lifecycle_metadata(input.now, status, input.previous, reason, input.config);
    if matches!(metadata.status, SetupStatus::Forming | SetupStatus::Ready) {
        triggered_at = None;
    }

    LifecycleOutcome { metadata, triggered_at }
}

/// Previous active setups whose zone dropped out of the candidate set.
/// Forming/ready records expire. A triggered record expires only when price
/// reached its target 2; otherwise it is carried unchanged until its TTL
/// lapses. Terminal records are dropped.
pub fn carry_forward_missing(
    previous: &[Setup],
    current_ids: &HashSet<String>,
    current_price: f64,
    now: DateTime<Utc>,
    config: &LifecycleConfig,
) -> Vec<Setup> {
    previous
        .iter()
        .filter(|prev| !current_ids.contains(&prev.id) && !prev.status.is_terminal())
        .map(|prev| {
            let mut carried = prev.clone();
            let expire = prev.status != SetupStatus::Triggered
                || SetupGeometry::of(prev).is_target2_reached(current_price);

            if expire {
                carried.status = SetupStatus::Expired;
                carried.status_updated_at = now;
                carried.ttl_expires_at = None;
                carried.invalidation_reason = None;
            } else {
                let ttl = Duration::milliseconds(config.ttl_triggered_ms);
                if now > prev.status_updated_at + ttl {
                    carried.status = SetupStatus::Invalidated;
                    carried.status_updated_at = now;
                    carried.ttl_expires_at = None;
                    carried.invalidation_reason = Some(InvalidationReason::TtlExpired);
                }
            }
            carried
        })
        .collect()
}

/// Output order: status, then probability (desc), then most recently
/// updated. Assigns the 1-based rank.
pub fn sort_and_rank(setups: &mut [Setup]) {
    setups.sort_by(|a, b| {
        a.status
            .sort_rank()
            .cmp(&b.status.sort_rank())
            .then_with(|| b.probability.total_cmp(&a.probability))
            .then_with(|| b.status_updated_at.cmp(&a.status_updated_at))
    });
    for (index, setup) in setups.iter_mut().enumerate() {
        setup.rank = Some(index as u32 + 1);
    }
}

/// Setups that are triggered now but were not triggered in `previous`.
pub fn newly_triggered<'a>(previous: &[Setup], current: &'a [Setup]) -> Vec<&'a Setup> {
    let before: HashMap<&str, SetupStatus> = previous
        .iter()
        .map(|setup| (setup.id.as_str(), setup.status))
        .collect();
    current
        .iter()
        .filter(|setup| setup.status == SetupStatus::Triggered)
        .filter(|setup| before.get(setup.id.as_str()) != Some(&SetupStatus::Triggered))
        .collect()
}
