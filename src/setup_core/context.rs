//! Cross-cycle hysteresis counters, keyed by setup id.

use std::collections::{HashMap, HashSet};

/// Untouched entries older than this start over from zero
pub const CONTEXT_STREAK_TTL_MS: i64 = 30 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextState {
    pub regime_conflict_streak: u32,
    pub flow_divergence_streak: u32,
    pub stop_breach_streak: u32,
    pub updated_at_ms: i64,
}

/// Signals observed for one setup in one cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextSignals {
    pub regime_conflict: bool,
    pub flow_divergence: bool,
    pub stop_breach: bool,
}

/// Process-local streak table. Each replayed date gets a fresh one.
#[derive(Debug, Default)]
pub struct ContextTracker {
    states: HashMap<String, ContextState>,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the streaks for `setup_id`: a true signal extends its streak,
    /// a false one resets it.
    pub fn update(&mut self, setup_id: &str, now_ms: i64, signals: ContextSignals) -> ContextState {
        let base = match self.states.get(setup_id) {
            Some(previous) if now_ms - previous.updated_at_ms <= CONTEXT_STREAK_TTL_MS => *previous,
            _ => ContextState::default(),
        };
        let bump = |flag: bool, streak: u32| if flag { streak + 1 } else { 0 };

        let next = ContextState {
            regime_conflict_streak: bump(signals.regime_conflict, base.regime_conflict_streak),
            flow_divergence_streak: bump(signals.flow_divergence, base.flow_divergence_streak),
            stop_breach_streak: bump(signals.stop_breach, base.stop_breach_streak),
            updated_at_ms: now_ms,
        };
        self.states.insert(setup_id.to_string(), next);
        next
    }

    /// Drop entries that are stale or whose setup is no longer active.
    pub fn prune(&mut self, active_ids: &HashSet<String>, now_ms: i64) {
        self.states.retain(|id, state| {
            now_ms - state.updated_at_ms <= CONTEXT_STREAK_TTL_MS && active_ids.contains(id)
        });
    }

    pub fn get(&self, setup_id: &str) -> Option<&ContextState> {
        self.states.get(setup_id)
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
