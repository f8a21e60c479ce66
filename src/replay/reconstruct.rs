//! Minute-by-minute reconstruction of a past session
//!
//! Replays the same detection cycle the live engine runs, once per SPX
//! minute bar, with every input rebuilt from what was knowable at that
//! minute. Every setup observed during the day is merged into one record
//! per id, stored, and scored by the backtest.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::backtest::{run_backtest, BacktestAnalytics};
use super::fib::time_sliced_fib_levels;
use super::flow::{flow_from_snapshots, interval_flow};
use super::gex::{basis, build_landscape, with_spot_prices};
use crate::setup_core::cache::MemoryKvStore;
use crate::setup_core::detector::CycleInputs;
use crate::setup_core::engine::{DetectOptions, SetupEngine};
use crate::setup_core::indicators::{build_indicator_context, trend_strength, volume_trend};
use crate::setup_core::types::{MinuteBar, Setup, Underlying};
use crate::sources::store::SetupStore;
use crate::sources::{HistoricalDataSource, RegimeClassifier, RegimeInput};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub setups_generated: usize,
    pub setups_triggered_at_generation: usize,
    #[serde(default)]
    pub backtest: Option<BacktestAnalytics>,
}

/// Most recent Monday-to-Friday date strictly before `date`
pub fn prior_weekday(date: NaiveDate) -> NaiveDate {
    let mut day = date;
    loop {
        day = match day.checked_sub_days(Days::new(1)) {
            Some(prev) => prev,
            None => return date,
        };
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            return day;
        }
    }
}

/// Fold one observation into the day's record for that id. A terminal
/// observation wins over a live one, otherwise the later update wins.
/// The earliest `created_at` and the first `triggered_at` are kept.
pub fn merge_observed_setup(existing: Option<&Setup>, incoming: &Setup) -> Setup {
    let Some(existing) = existing else {
        return incoming.clone();
    };

    let prefer_incoming = incoming.status.is_terminal()
        || (!existing.status.is_terminal() && incoming.status_updated_at >= existing.status_updated_at);
    let mut merged = if prefer_incoming { incoming.clone() } else { existing.clone() };
    merged.created_at = existing.created_at.min(incoming.created_at);
    merged.triggered_at = existing.triggered_at.or(incoming.triggered_at);
    merged
}

/// SPY bars up to `cursor`, keeping at least the first bar so an SPX bar
/// printed ahead of SPY still has a SPY swing to cross-validate against.
fn spy_bars_to_now(spy_bars: &[MinuteBar], cursor: usize) -> &[MinuteBar] {
    &spy_bars[..cursor.max(1).min(spy_bars.len())]
}

fn bar_time(bar: &MinuteBar) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(bar.timestamp_ms).single()
}

/// Replays dates against historical data, storing what it observes.
pub struct SessionReplayer {
    source: Arc<dyn HistoricalDataSource>,
    classifier: Arc<dyn RegimeClassifier>,
    store: Arc<dyn SetupStore>,
    engine: SetupEngine,
}

impl SessionReplayer {
    pub fn new(
        source: Arc<dyn HistoricalDataSource>,
        classifier: Arc<dyn RegimeClassifier>,
        store: Arc<dyn SetupStore>,
    ) -> Self {
        let engine = SetupEngine::new(None, Arc::new(MemoryKvStore::new()));
        Self::with_engine(source, classifier, store, engine)
    }

    pub fn with_engine(
        source: Arc<dyn HistoricalDataSource>,
        classifier: Arc<dyn RegimeClassifier>,
        store: Arc<dyn SetupStore>,
        engine: SetupEngine,
    ) -> Self {
        Self { source, classifier, store, engine }
    }

    pub fn store(&self) -> &Arc<dyn SetupStore> {
        &self.store
    }

    pub async fn replay_date(&self, date: NaiveDate) -> Result<ReplayResult> {
        let source = self.source.as_ref();
        let (spx_bars, spy_bars, spx_options, spy_options) = tokio::try_join!(
            source.minute_bars(Underlying::Spx, date),
            source.minute_bars(Underlying::Spy, date),
            source.option_snapshots(Underlying::Spx, date),
            source.option_snapshots(Underlying::Spy, date),
        )
        .with_context(|| format!("Failed to load market data for {}", date))?;

        let mut spx_bars: Vec<MinuteBar> = spx_bars.into_iter().filter(|bar| bar.has_valid_close()).collect();
        spx_bars.sort_by_key(|bar| bar.timestamp_ms);
        let mut spy_bars: Vec<MinuteBar> = spy_bars.into_iter().filter(|bar| bar.has_valid_close()).collect();
        spy_bars.sort_by_key(|bar| bar.timestamp_ms);

        let Some(first) = spx_bars.first() else {
            warn!("No SPX minute bars for {}, nothing to replay", date);
            return Ok(ReplayResult::default());
        };
        let initial_spx = first.close;
        let initial_spy = spy_bars.first().map_or(initial_spx / 10.0, |bar| bar.close);

        let base_gex = build_landscape(date, initial_spx, initial_spy, &spx_options, &spy_options);
        let base_basis = basis(&base_gex);

        let mut reference_fibs = source.reference_fib_levels(prior_weekday(date), base_basis).await?;
        if reference_fibs.is_empty() {
            reference_fibs = source.reference_fib_levels(date, base_basis).await?;
        }

        let Some(levels) = source.cluster_zones(date, &base_gex).await? else {
            warn!("No cluster zones for {}, nothing to replay", date);
            return Ok(ReplayResult::default());
        };

        let (spx_flow, spy_flow) = tokio::join!(
            interval_flow(source, Underlying::Spx, date, &spx_options),
            interval_flow(source, Underlying::Spy, date, &spy_options),
        );
        let (interval_count, mut flow_events) = (spx_flow.len() + spy_flow.len(), [spx_flow, spy_flow].concat());
        if flow_events.is_empty() {
            flow_events = [
                flow_from_snapshots(Underlying::Spx, date, &spx_options),
                flow_from_snapshots(Underlying::Spy, date, &spy_options),
            ]
            .concat();
        }
        flow_events.sort_by_key(|event| event.timestamp);
        info!(
            "Flow for {}: {} interval events, {} used after fallback",
            date,
            interval_count,
            flow_events.len()
        );

        self.engine.reset_context().await;

        let mut observed: Vec<Setup> = Vec::new();
        let mut observed_index: HashMap<String, usize> = HashMap::new();
        let mut previous: Vec<Setup> = Vec::new();
        let mut spy_cursor = 0usize;
        let mut flow_cursor = 0usize;
        let mut simulated_bars = 0usize;

        for (i, bar) in spx_bars.iter().enumerate() {
            let Some(at) = bar_time(bar) else {
                continue;
            };
            while spy_cursor < spy_bars.len() && spy_bars[spy_cursor].timestamp_ms <= bar.timestamp_ms {
                spy_cursor += 1;
            }
            let spy_spot = spy_cursor
                .checked_sub(1)
                .map_or(initial_spy, |idx| spy_bars[idx].close);
            while flow_cursor < flow_events.len() && flow_events[flow_cursor].timestamp <= at {
                flow_cursor += 1;
            }

            let bars_to_now = &spx_bars[..=i];
            let gex = with_spot_prices(&base_gex, bar.close, spy_spot, at);
            let fib_levels =
                time_sliced_fib_levels(bars_to_now, spy_bars_to_now(&spy_bars, spy_cursor), basis(&gex), &reference_fibs);
            let volume = volume_trend(bars_to_now);
            let strength = trend_strength(bars_to_now);
            let regime = self
                .classifier
                .classify(RegimeInput {
                    bars: bars_to_now,
                    gex: &gex,
                    volume_trend: volume,
                    trend_strength: strength,
                    as_of: at,
                })
                .await
                .with_context(|| format!("Regime classification failed at {}", at))?;

            let inputs = CycleInputs {
                levels: levels.clone(),
                gex,
                fib_levels,
                regime,
                flow_events: flow_events[..flow_cursor].to_vec(),
                indicator_context: build_indicator_context(bars_to_now, at),
            };
            let setups = self
                .engine
                .detect_active_setups(DetectOptions {
                    force_refresh: true,
                    as_of: Some(at),
                    previous_setups: Some(std::mem::take(&mut previous)),
                    inputs: Some(inputs),
                })
                .await?;

            for setup in &setups {
                match observed_index.get(&setup.id) {
                    Some(&idx) => observed[idx] = merge_observed_setup(Some(&observed[idx]), setup),
                    None => {
                        observed_index.insert(setup.id.clone(), observed.len());
                        observed.push(setup.clone());
                    }
                }
            }
            previous = setups;
            simulated_bars += 1;
        }

        self.store
            .save_setups(date, &observed)
            .await
            .with_context(|| format!("Failed to store setups for {}", date))?;

        let report = run_backtest(&observed, &spx_bars, date);
        self.store
            .save_backtest_rows(date, &report.rows)
            .await
            .with_context(|| format!("Failed to store backtest rows for {}", date))?;

        info!(
            date = %date,
            simulated_bars,
            final_setup_count = observed.len(),
            triggered_count = report.analytics.triggered_count,
            t1_win_rate_pct = report.analytics.t1_win_rate_pct,
            t2_win_rate_pct = report.analytics.t2_win_rate_pct,
            "replay complete"
        );

        Ok(ReplayResult {
            setups_generated: observed.len(),
            setups_triggered_at_generation: report.analytics.triggered_count,
            backtest: Some(report.analytics),
        })
    }
}
