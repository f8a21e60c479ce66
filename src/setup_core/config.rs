//! Lifecycle thresholds and TTLs for the setup state machine

use serde::{Deserialize, Serialize};

/// Thresholds and per-status residency limits, re-read every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Apply context overrides (stop breach, regime conflict, flow divergence)
    pub lifecycle_enabled: bool,

    /// Emit the per-cycle lifecycle telemetry event
    pub telemetry_enabled: bool,

    /// Regime confidence at or above which an opposing regime counts as a conflict
    pub regime_conflict_confidence_threshold: u32,

    /// Flow alignment percentage below which flow counts as diverging
    pub flow_divergence_threshold: u32,

    /// Consecutive conflicting cycles that demote ready back to forming
    pub demotion_streak: u32,

    /// Consecutive conflicting cycles that invalidate a triggered setup
    pub invalidation_streak: u32,

    /// Consecutive cycles beyond the stop before the breach is confirmed
    pub stop_confirmation_ticks: u32,

    /// Max residency in forming, milliseconds
    pub ttl_forming_ms: i64,

    /// Max residency in ready, milliseconds
    pub ttl_ready_ms: i64,

    /// Max residency in triggered, milliseconds
    pub ttl_triggered_ms: i64,

    /// Allow the vwap_reclaim / vwap_fade_at_band refinements
    pub vwap_enabled: bool,

    /// Allow the orb_breakout refinement
    pub orb_enabled: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            lifecycle_enabled: true,
            telemetry_enabled: true,
            regime_conflict_confidence_threshold: 68,
            flow_divergence_threshold: 38,
            demotion_streak: 2,
            invalidation_streak: 3,
            stop_confirmation_ticks: 2,
            ttl_forming_ms: 20 * 60 * 1000,    // 20 minutes
            ttl_ready_ms: 25 * 60 * 1000,      // 25 minutes
            ttl_triggered_ms: 90 * 60 * 1000,  // 90 minutes
            vwap_enabled: true,
            orb_enabled: true,
        }
    }
}

const MIN_TTL_MS: i64 = 60_000;

impl LifecycleConfig {
    /// Load from the process environment, falling back to defaults per value.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unparseable values use the default,
    /// parsed values are raised to their minimum.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str, fallback: bool| parse_bool(lookup(key).as_deref(), fallback);
        let int = |key: &str, fallback: u32, minimum: u32| {
            // Values past u32 saturate
            u32::try_from(parse_int(lookup(key).as_deref(), fallback as i64, minimum as i64)).unwrap_or(u32::MAX)
        };
        let ttl = |key: &str, fallback: i64| parse_int(lookup(key).as_deref(), fallback, MIN_TTL_MS);

        Self {
            lifecycle_enabled: flag("SPX_SETUP_LIFECYCLE_ENABLED", defaults.lifecycle_enabled),
            telemetry_enabled: flag(
                "SPX_SETUP_TRANSITION_TELEMETRY_ENABLED",
                defaults.telemetry_enabled,
            ),
            regime_conflict_confidence_threshold: int(
                "SPX_SETUP_REGIME_CONFLICT_CONFIDENCE_THRESHOLD",
                defaults.regime_conflict_confidence_threshold,
                0,
            ),
            flow_divergence_threshold: int(
                "SPX_SETUP_FLOW_DIVERGENCE_THRESHOLD",
                defaults.flow_divergence_threshold,
                0,
            ),
            demotion_streak: int("SPX_SETUP_DEMOTION_STREAK", defaults.demotion_streak, 1),
            invalidation_streak: int(
                "SPX_SETUP_INVALIDATION_STREAK",
                defaults.invalidation_streak,
                2,
            ),
            stop_confirmation_ticks: int(
                "SPX_SETUP_STOP_CONFIRMATION_TICKS",
                defaults.stop_confirmation_ticks,
                1,
            ),
            ttl_forming_ms: ttl("SPX_SETUP_TTL_FORMING_MS", defaults.ttl_forming_ms),
            ttl_ready_ms: ttl("SPX_SETUP_TTL_READY_MS", defaults.ttl_ready_ms),
            ttl_triggered_ms: ttl("SPX_SETUP_TTL_TRIGGERED_MS", defaults.ttl_triggered_ms),
            vwap_enabled: flag("SPX_SETUP_VWAP_ENABLED", defaults.vwap_enabled),
            orb_enabled: flag("SPX_SETUP_ORB_ENABLED", defaults.orb_enabled),
        }
    }
}

fn parse_bool(value: Option<&str>, fallback: bool) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => false,
        _ => fallback,
    }
}

fn parse_int(value: Option<&str>, fallback: i64, minimum: i64) -> i64 {
    match value.and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(parsed) => parsed.max(minimum),
        None => fallback,
    }
}
