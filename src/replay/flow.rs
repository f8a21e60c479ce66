//! Flow events synthesized from historical option data
//!
//! Tick-level flow is not available for past sessions. Instead, the most
//! active near-dated contracts are scanned minute by minute and intervals
//! whose premium stands out from that contract's own average become events.
//! Treat anything built on these as approximate.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use futures::future::join_all;
use tracing::warn;

use crate::setup_core::identity::stable_id;
use crate::setup_core::types::{
    round2, ContractType, Direction, FlowEvent, FlowEventType, MinuteBar, OptionSnapshot, Underlying,
};
use crate::sources::HistoricalDataSource;

use super::gex::session_close;

pub const MIN_FLOW_VOLUME: f64 = 10.0;
pub const MIN_FLOW_PREMIUM: f64 = 10_000.0;
pub const MAX_FLOW_EVENTS: usize = 240;
pub const FLOW_CONTRACT_SCAN_LIMIT: usize = 16;
pub const FLOW_EXPIRY_WINDOW_DAYS: u64 = 7;
const FLOW_BARS_BATCH_SIZE: usize = 4;

pub const INTERVAL_MIN_PREMIUM: f64 = 25_000.0;
pub const INTERVAL_MIN_VOLUME: f64 = 3.0;
pub const INTERVAL_SWEEP_VOLUME: f64 = 35.0;
const INTERVAL_PREMIUM_MULT: f64 = 1.35;
const INTERVAL_SWEEP_PREMIUM_MULT: f64 = 2.1;
const SNAPSHOT_SWEEP_VOLUME: f64 = 200.0;

const FLOW_ID_PREFIX: &str = "historical_flow";

#[derive(Debug, Clone, PartialEq)]
pub struct FlowCandidate {
    pub ticker: String,
    pub underlying: Underlying,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub contract_type: ContractType,
    pub day_volume: f64,
    pub day_premium: f64,
}

fn direction_for(contract_type: ContractType) -> Direction {
    match contract_type {
        ContractType::Call => Direction::Bullish,
        ContractType::Put => Direction::Bearish,
    }
}

/// Most active contracts expiring within a week of `date`, by estimated
/// day premium then volume.
pub fn flow_candidates(underlying: Underlying, date: NaiveDate, snapshots: &[OptionSnapshot]) -> Vec<FlowCandidate> {
    let window_end = date.checked_add_days(Days::new(FLOW_EXPIRY_WINDOW_DAYS)).unwrap_or(date);

    let mut candidates: Vec<FlowCandidate> = snapshots
        .iter()
        .filter_map(|snapshot| {
            let ticker = snapshot.ticker.clone().filter(|t| !t.is_empty())?;
            let strike = snapshot.strike.filter(|s| s.is_finite())?;
            let expiry = snapshot.expiration_date.filter(|e| *e >= date && *e <= window_end)?;
            let contract_type = snapshot.contract_type?;

            let day_volume = snapshot.volume();
            if day_volume < MIN_FLOW_VOLUME {
                return None;
            }
            let day_premium = round2(snapshot.mid() * day_volume * 100.0);
            if day_premium < MIN_FLOW_PREMIUM {
                return None;
            }
            Some(FlowCandidate {
                ticker,
                underlying,
                strike: round2(strike),
                expiry,
                contract_type,
                day_volume,
                day_premium,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.day_premium
            .total_cmp(&a.day_premium)
            .then_with(|| b.day_volume.total_cmp(&a.day_volume))
    });
    candidates.truncate(FLOW_CONTRACT_SCAN_LIMIT);
    candidates
}

/// Minutes whose premium clears max(25k, 1.35 × the contract's average
/// minute premium).
pub fn events_from_contract_bars(candidate: &FlowCandidate, bars: &[MinuteBar]) -> Vec<FlowEvent> {
    let usable: Vec<&MinuteBar> = bars
        .iter()
        .filter(|bar| bar.volume.is_finite() && bar.volume >= INTERVAL_MIN_VOLUME && bar.has_valid_close())
        .collect();
    if usable.is_empty() {
        return Vec::new();
    }

    let avg_premium =
        usable.iter().map(|bar| bar.close * bar.volume * 100.0).sum::<f64>() / usable.len() as f64;
    let threshold = INTERVAL_MIN_PREMIUM.max(avg_premium * INTERVAL_PREMIUM_MULT);
    let sweep_premium = (INTERVAL_MIN_PREMIUM * 2.0).max(avg_premium * INTERVAL_SWEEP_PREMIUM_MULT);

    usable
        .into_iter()
        .filter_map(|bar| {
            let premium = round2(bar.close * bar.volume * 100.0);
            if premium < threshold {
                return None;
            }
            let timestamp = Utc.timestamp_millis_opt(bar.timestamp_ms).single()?;
            let sweep = bar.volume >= INTERVAL_SWEEP_VOLUME || premium >= sweep_premium;
            Some(FlowEvent {
                id: stable_id(
                    FLOW_ID_PREFIX,
                    &format!(
                        "{}|{}|{}|{}|{}",
                        candidate.underlying, candidate.ticker, bar.timestamp_ms, bar.volume, premium
                    ),
                ),
                event_type: if sweep { FlowEventType::Sweep } else { FlowEventType::Block },
                symbol: candidate.underlying.to_string(),
                strike: candidate.strike,
                expiry: candidate.expiry.format("%Y-%m-%d").to_string(),
                size: bar.volume.round() as u64,
                direction: direction_for(candidate.contract_type),
                premium,
                timestamp,
            })
        })
        .collect()
}

/// Scan candidate contracts' minute bars in small concurrent batches. A
/// contract whose bars cannot be fetched contributes nothing.
pub async fn interval_flow(
    source: &dyn HistoricalDataSource,
    underlying: Underlying,
    date: NaiveDate,
    snapshots: &[OptionSnapshot],
) -> Vec<FlowEvent> {
    let candidates = flow_candidates(underlying, date, snapshots);
    let mut events = Vec::new();

    for batch in candidates.chunks(FLOW_BARS_BATCH_SIZE) {
        let fetched = join_all(batch.iter().map(|candidate| async move {
            match source.contract_minute_bars(&candidate.ticker, date).await {
                Ok(bars) => (candidate, bars),
                Err(e) => {
                    warn!("Contract bar fetch failed for {} on {}: {:#}", candidate.ticker, date, e);
                    (candidate, Vec::new())
                }
            }
        }))
        .await;

        for (candidate, bars) in fetched {
            events.extend(events_from_contract_bars(candidate, &bars));
        }
    }

    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| b.premium.total_cmp(&a.premium))
    });
    let excess = events.len().saturating_sub(MAX_FLOW_EVENTS);
    events.drain(..excess);
    events
}

/// Epoch seconds, milliseconds, microseconds or nanoseconds to a timestamp.
pub fn epoch_to_datetime(raw: i64) -> Option<DateTime<Utc>> {
    if raw <= 0 {
        return None;
    }
    let ms = if raw > 100_000_000_000_000_000 {
        raw / 1_000_000
    } else if raw > 100_000_000_000_000 {
        raw / 1_000
    } else if raw > 100_000_000_000 {
        raw
    } else {
        raw * 1_000
    };
    Utc.timestamp_millis_opt(ms).single()
}

/// One event per actively traded contract, used when interval scanning
/// finds nothing. Undated quotes are stamped at the session close.
pub fn flow_from_snapshots(underlying: Underlying, date: NaiveDate, snapshots: &[OptionSnapshot]) -> Vec<FlowEvent> {
    let mut events: Vec<FlowEvent> = snapshots
        .iter()
        .filter_map(|snapshot| {
            let strike = snapshot.strike.filter(|s| s.is_finite())?;
            let expiry = snapshot.expiration_date?;
            let contract_type = snapshot.contract_type?;
            let volume = snapshot.volume();
            if volume < MIN_FLOW_VOLUME {
                return None;
            }
            let premium = round2(snapshot.mid() * volume * 100.0);
            if premium < MIN_FLOW_PREMIUM {
                return None;
            }
            let timestamp = snapshot
                .last_updated
                .and_then(epoch_to_datetime)
                .unwrap_or_else(|| session_close(date));

            Some(FlowEvent {
                id: stable_id(
                    FLOW_ID_PREFIX,
                    &format!(
                        "{}|{}|{}|{:?}|{}|{}",
                        underlying, strike, expiry, contract_type, volume, premium
                    ),
                ),
                event_type: if volume >= SNAPSHOT_SWEEP_VOLUME {
                    FlowEventType::Sweep
                } else {
                    FlowEventType::Block
                },
                symbol: underlying.to_string(),
                strike: round2(strike),
                expiry: expiry.format("%Y-%m-%d").to_string(),
                size: volume.round() as u64,
                direction: direction_for(contract_type),
                premium,
                timestamp,
            })
        })
        .collect();

    events.sort_by(|a, b| b.premium.total_cmp(&a.premium).then_with(|| b.size.cmp(&a.size)));
    events.truncate(MAX_FLOW_EVENTS);
    events
}
