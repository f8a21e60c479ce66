//! Win-rate backtest of observed setups against the session's minute bars
//!
//! Each bar is walked as a price path (open, low, high, close for up bars;
//! open, high, low, close for down bars). A setup triggers when the path
//! enters its entry zone and is then resolved against its stop and targets:
//! - half the position is taken off at target 1 and the stop moves to the
//!   entry fill
//! - the runner exits at target 2, the moved stop, or the last close
//!
//! Realized R uses a risk floor of 0.25 points.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::setup_core::types::{round2, round_to, Direction, MinuteBar, Regime, Setup, SetupType};

const PARTIAL_AT_T1: f64 = 0.5;
const MIN_RISK_POINTS: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    T2BeforeStop,
    T1BeforeStop,
    StopBeforeT1,
    ExpiredUnresolved,
}

/// One evaluated setup, flat so it writes as a CSV row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRow {
    pub engine_setup_id: String,
    pub session_date: NaiveDate,
    pub setup_type: SetupType,
    pub direction: Direction,
    pub regime: Regime,
    pub triggered_at: Option<DateTime<Utc>>,
    pub final_outcome: Option<FinalOutcome>,
    pub t1_hit_at: Option<DateTime<Utc>>,
    pub t2_hit_at: Option<DateTime<Utc>>,
    pub stop_hit_at: Option<DateTime<Utc>>,
    pub realized_r: Option<f64>,
    pub entry_fill_price: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestAnalytics {
    pub triggered_count: usize,
    pub resolved_count: usize,
    pub t1_wins: usize,
    pub t2_wins: usize,
    pub stops_before_t1: usize,
    pub expired_unresolved: usize,
    pub t1_win_rate_pct: f64,
    pub t2_win_rate_pct: f64,
    pub failure_rate_pct: f64,
    pub average_realized_r: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestReport {
    pub rows: Vec<BacktestRow>,
    pub analytics: BacktestAnalytics,
}

pub fn bar_path(bar: &MinuteBar) -> [f64; 4] {
    let (open, high, low, close) = (bar.open_or_close(), bar.high_or_close(), bar.low_or_close(), bar.close);
    if close >= open {
        [open, low, high, close]
    } else {
        [open, high, low, close]
    }
}

/// Price at which a path segment first enters the entry zone.
pub fn find_entry_trigger(start: f64, end: f64, entry_low: f64, entry_high: f64) -> Option<f64> {
    let (low, high) = (entry_low.min(entry_high), entry_low.max(entry_high));
    if start >= low && start <= high {
        return Some(start);
    }
    if start < low && end >= low {
        return Some(low);
    }
    if start > high && end <= high {
        return Some(high);
    }
    None
}

struct TradeTracker {
    direction: Direction,
    stop: f64,
    target1: f64,
    target2: f64,
    entry_fill: f64,
    t1_hit_at: Option<DateTime<Utc>>,
    t2_hit_at: Option<DateTime<Utc>>,
    stop_hit_at: Option<DateTime<Utc>>,
    outcome: Option<FinalOutcome>,
}

impl TradeTracker {
    fn active_stop(&self) -> f64 {
        if self.t1_hit_at.is_some() {
            self.entry_fill
        } else {
            self.stop
        }
    }

    fn mark_stop(&mut self, at: DateTime<Utc>) {
        if self.outcome.is_some() {
            return;
        }
        self.stop_hit_at.get_or_insert(at);
        self.outcome = Some(if self.t1_hit_at.is_some() {
            FinalOutcome::T1BeforeStop
        } else {
            FinalOutcome::StopBeforeT1
        });
    }

    fn mark_t1(&mut self, at: DateTime<Utc>) {
        self.t1_hit_at.get_or_insert(at);
    }

    fn mark_t2(&mut self, at: DateTime<Utc>) {
        if self.outcome.is_some() {
            return;
        }
        self.t1_hit_at.get_or_insert(at);
        self.t2_hit_at.get_or_insert(at);
        self.outcome = Some(FinalOutcome::T2BeforeStop);
    }

    /// Favorable distance from `a` to `b` in the trade direction
    fn favorable(&self, a: f64, b: f64) -> f64 {
        self.direction.sign() * (b - a)
    }

    fn apply_point(&mut self, price: f64, at: DateTime<Utc>) {
        if self.outcome.is_some() {
            return;
        }
        if self.favorable(self.active_stop(), price) <= 0.0 {
            self.mark_stop(at);
        } else if self.favorable(self.target2, price) >= 0.0 {
            self.mark_t2(at);
        } else if self.favorable(self.target1, price) >= 0.0 {
            self.mark_t1(at);
        }
    }

    fn apply_segment(&mut self, start: f64, end: f64, at: DateTime<Utc>) {
        if self.outcome.is_some() || start == end {
            return;
        }
        let crosses = |level: f64| {
            let (lo, hi) = (start.min(end), start.max(end));
            // Level passed strictly after start, reached by end
            level != start && level >= lo && level <= hi
        };

        if self.favorable(start, end) > 0.0 {
            if self.t1_hit_at.is_none() && crosses(self.target1) {
                self.mark_t1(at);
            }
            if crosses(self.target2) {
                self.mark_t2(at);
            }
        } else {
            let stop = self.active_stop();
            if self.favorable(stop, start) > 0.0 && self.favorable(stop, end) <= 0.0 {
                self.mark_stop(at);
            }
        }
    }
}

fn bar_time(bar: &MinuteBar) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(bar.timestamp_ms).single()
}

/// Evaluate one setup from its first sighting onward.
pub fn evaluate_setup(setup: &Setup, bars: &[MinuteBar], session_date: NaiveDate) -> BacktestRow {
    let entry_mid = round2(setup.entry_zone.mid());
    let first_seen_ms = setup.created_at.timestamp_millis();
    let mut tracker = TradeTracker {
        direction: setup.direction,
        stop: setup.stop,
        target1: setup.target1.price,
        target2: setup.target2.price,
        entry_fill: entry_mid,
        t1_hit_at: None,
        t2_hit_at: None,
        stop_hit_at: None,
        outcome: None,
    };
    let mut triggered_at: Option<DateTime<Utc>> = None;
    let mut last_close: Option<f64> = None;

    for bar in bars.iter().filter(|bar| bar.timestamp_ms >= first_seen_ms && bar.has_valid_close()) {
        let Some(at) = bar_time(bar) else {
            continue;
        };
        last_close = Some(bar.close);
        let path = bar_path(bar);

        for segment in path.windows(2) {
            let mut start = segment[0];
            let end = segment[1];

            if triggered_at.is_none() {
                let Some(trigger) =
                    find_entry_trigger(start, end, setup.entry_zone.low, setup.entry_zone.high)
                else {
                    continue;
                };
                triggered_at = Some(at);
                tracker.entry_fill = trigger;
                start = trigger;
            }

            tracker.apply_point(start, at);
            tracker.apply_segment(start, end, at);
            tracker.apply_point(end, at);
            if tracker.outcome.is_some() {
                break;
            }
        }
        if tracker.outcome.is_some() {
            break;
        }
    }

    if triggered_at.is_some() && tracker.outcome.is_none() {
        tracker.outcome = Some(if tracker.t1_hit_at.is_some() {
            FinalOutcome::T1BeforeStop
        } else {
            FinalOutcome::ExpiredUnresolved
        });
    }

    let realized_r = tracker.outcome.filter(|_| triggered_at.is_some()).map(|outcome| {
        let entry = tracker.entry_fill;
        let risk = (entry - setup.stop).abs().max(MIN_RISK_POINTS);
        let t1_r = (setup.target1.price - entry).abs() / risk;
        let t2_r = (setup.target2.price - entry).abs() / risk;
        let mark_to_close = || tracker.favorable(entry, last_close.unwrap_or(entry)) / risk;

        let r = match outcome {
            FinalOutcome::T2BeforeStop => PARTIAL_AT_T1 * t1_r + (1.0 - PARTIAL_AT_T1) * t2_r,
            FinalOutcome::T1BeforeStop => {
                // Runner stopped at breakeven, or marked to the close
                let runner = if tracker.stop_hit_at.is_some() { 0.0 } else { mark_to_close() };
                PARTIAL_AT_T1 * t1_r + (1.0 - PARTIAL_AT_T1) * runner
            }
            FinalOutcome::StopBeforeT1 => -1.0,
            FinalOutcome::ExpiredUnresolved => mark_to_close(),
        };
        round_to(r, 4)
    });

    let triggered = triggered_at.is_some();
    BacktestRow {
        engine_setup_id: setup.id.clone(),
        session_date,
        setup_type: setup.setup_type,
        direction: setup.direction,
        regime: setup.regime,
        triggered_at,
        final_outcome: tracker.outcome.filter(|_| triggered),
        t1_hit_at: tracker.t1_hit_at.filter(|_| triggered),
        t2_hit_at: tracker.t2_hit_at.filter(|_| triggered),
        stop_hit_at: tracker.stop_hit_at.filter(|_| triggered),
        realized_r,
        entry_fill_price: triggered.then(|| round2(tracker.entry_fill)),
    }
}

/// Win rates are over resolved trades; average R over trades with an R.
pub fn summarize(rows: &[BacktestRow]) -> BacktestAnalytics {
    let mut analytics = BacktestAnalytics::default();
    let mut r_sum = 0.0;
    let mut r_count = 0usize;

    for row in rows.iter().filter(|row| row.triggered_at.is_some()) {
        analytics.triggered_count += 1;
        if let Some(outcome) = row.final_outcome {
            analytics.resolved_count += 1;
            match outcome {
                FinalOutcome::T2BeforeStop => {
                    analytics.t2_wins += 1;
                    analytics.t1_wins += 1;
                }
                FinalOutcome::T1BeforeStop => analytics.t1_wins += 1,
                FinalOutcome::StopBeforeT1 => analytics.stops_before_t1 += 1,
                FinalOutcome::ExpiredUnresolved => analytics.expired_unresolved += 1,
            }
        }
        if let Some(r) = row.realized_r {
            r_sum += r;
            r_count += 1;
        }
    }

    let pct = |n: usize| {
        if analytics.resolved_count > 0 {
            round2(n as f64 / analytics.resolved_count as f64 * 100.0)
        } else {
            0.0
        }
    };
    analytics.t1_win_rate_pct = pct(analytics.t1_wins);
    analytics.t2_win_rate_pct = pct(analytics.t2_wins);
    analytics.failure_rate_pct = pct(analytics.stops_before_t1);
    analytics.average_realized_r = if r_count > 0 { round_to(r_sum / r_count as f64, 4) } else { 0.0 };
    analytics
}

pub fn run_backtest(setups: &[Setup], bars: &[MinuteBar], session_date: NaiveDate) -> BacktestReport {
    let mut sorted: Vec<MinuteBar> = bars.to_vec();
    sorted.sort_by_key(|bar| bar.timestamp_ms);
    let rows: Vec<BacktestRow> = setups
        .iter()
        .map(|setup| evaluate_setup(setup, &sorted, session_date))
        .collect();
    let analytics = summarize(&rows);
    BacktestReport { rows, analytics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup_core::lifecycle::tests::{sample_setup, t};
    use crate::setup_core::types::SetupStatus;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn bar(minute: i64, o: f64, h: f64, l: f64, c: f64) -> MinuteBar {
        MinuteBar {
            timestamp_ms: t(minute).timestamp_millis(),
            open: Some(o),
            high: Some(h),
            low: Some(l),
            close: c,
            volume: 100.0,
        }
    }

    /// Long, entry [5000, 5004], stop 4997.75, t1 5015, t2 5025
    fn long_setup() -> Setup {
        sample_setup(SetupStatus::Ready, t(0))
    }

    #[test]
    fn test_entry_trigger_crossing() {
        assert_eq!(find_entry_trigger(5002.0, 5010.0, 5000.0, 5004.0), Some(5002.0));
        assert_eq!(find_entry_trigger(5010.0, 5001.0, 5000.0, 5004.0), Some(5004.0));
        assert_eq!(find_entry_trigger(4990.0, 5001.0, 5000.0, 5004.0), Some(5000.0));
        assert_eq!(find_entry_trigger(5010.0, 5006.0, 5000.0, 5004.0), None);
    }

    #[test]
    fn test_t2_before_stop() {
        let bars = vec![
            bar(0, 5008.0, 5009.0, 5003.0, 5005.0),
            bar(1, 5005.0, 5026.0, 5004.0, 5024.0),
        ];
        let row = evaluate_setup(&long_setup(), &bars, date());
        assert_eq!(row.final_outcome, Some(FinalOutcome::T2BeforeStop));
        assert_eq!(row.entry_fill_price, Some(5004.0));
        assert_eq!(row.triggered_at, Some(t(0)));
        assert_eq!(row.t2_hit_at, Some(t(1)));
        // risk 6.25, t1 11/6.25 = 1.76, t2 21/6.25 = 3.36
        assert_eq!(row.realized_r, Some(2.56));
    }

    #[test]
    fn test_stop_before_t1() {
        let bars = vec![bar(0, 5003.0, 5004.0, 4990.0, 4991.0)];
        let row = evaluate_setup(&long_setup(), &bars, date());
        assert_eq!(row.final_outcome, Some(FinalOutcome::StopBeforeT1));
        assert_eq!(row.realized_r, Some(-1.0));
    }

    #[test]
    fn test_t1_then_breakeven_stop() {
        let bars = vec![
            bar(0, 5002.0, 5002.0, 5002.0, 5002.0),
            bar(1, 5002.0, 5016.0, 5002.0, 5016.0),
            bar(2, 5016.0, 5016.0, 5001.0, 5001.0),
        ];
        let row = evaluate_setup(&long_setup(), &bars, date());
        assert_eq!(row.final_outcome, Some(FinalOutcome::T1BeforeStop));
        assert_eq!(row.t1_hit_at, Some(t(1)));
        assert_eq!(row.stop_hit_at, Some(t(2)));
        // risk 4.25, t1 13/4.25, runner flat
        assert_eq!(row.realized_r, Some(1.5294));
    }

    #[test]
    fn test_untriggered_and_bars_before_first_sighting() {
        let mut setup = long_setup();
        setup.created_at = t(5);
        let bars = vec![bar(0, 5002.0, 5003.0, 5001.0, 5002.0), bar(6, 5010.0, 5012.0, 5008.0, 5011.0)];
        let row = evaluate_setup(&setup, &bars, date());
        assert_eq!(row.triggered_at, None);
        assert_eq!(row.final_outcome, None);
        assert_eq!(row.realized_r, None);
        assert_eq!(row.entry_fill_price, None);
    }

    #[test]
    fn test_summary_rates() {
        let bars = vec![
            bar(0, 5008.0, 5009.0, 5003.0, 5005.0),
            bar(1, 5005.0, 5026.0, 5004.0, 5024.0),
        ];
        let mut loser = long_setup();
        loser.id = "loser".to_string();
        loser.stop = 5004.5;
        loser.entry_zone.high = 5006.0;
        let mut idle = long_setup();
        idle.id = "idle".to_string();
        idle.entry_zone.low = 4900.0;
        idle.entry_zone.high = 4901.0;

        let report = run_backtest(&[long_setup(), loser, idle], &bars, date());
        assert_eq!(report.rows.len(), 3);
        assert_eq!(report.analytics.triggered_count, 2);
        assert_eq!(report.analytics.resolved_count, 2);
        assert_eq!(report.analytics.t1_win_rate_pct, 50.0);
        assert_eq!(report.analytics.t2_win_rate_pct, 50.0);
        assert_eq!(report.analytics.failure_rate_pct, 50.0);
    }
}
