//! Replay a range of past sessions
//!
//! Stored rows for the range are purged first; only a missing table is
//! tolerated there. Each weekday is then replayed on its own: a failing date
//! is recorded and the run continues.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::reconstruct::SessionReplayer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRow {
    pub date: NaiveDate,
    pub setups_generated: usize,
    pub setups_triggered_at_generation: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub rows: Vec<BackfillRow>,
    pub attempted_days: usize,
    pub successful_days: usize,
    pub failed_days: usize,
}

/// Noon UTC on `date`, clear of any timezone date shift
fn noon_anchor(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)) + chrono::Duration::hours(12)
}

/// Monday-to-Friday dates in `[from, to]`, ascending. Empty when `from > to`.
pub fn weekdays_between(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut cursor = noon_anchor(from);
    let end = noon_anchor(to);
    while cursor <= end {
        let day = cursor.date_naive();
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            dates.push(day);
        }
        cursor = match cursor.checked_add_days(Days::new(1)) {
            Some(next) => next,
            None => break,
        };
    }
    dates
}

pub async fn backfill_range(replayer: &SessionReplayer, from: NaiveDate, to: NaiveDate) -> Result<BackfillSummary> {
    match replayer.store().purge(from, to).await {
        Ok(removed) => info!("Purged {} stored sessions in {}..={}", removed, from, to),
        Err(e) if e.is_missing_table() => warn!("Nothing to purge for {}..={}: {}", from, to, e),
        Err(e) => return Err(e).with_context(|| format!("Failed to purge stored setups for {}..={}", from, to)),
    }

    let dates = weekdays_between(from, to);
    let mut rows = Vec::with_capacity(dates.len());
    for date in dates {
        let row = match replayer.replay_date(date).await {
            Ok(result) => BackfillRow {
                date,
                setups_generated: result.setups_generated,
                setups_triggered_at_generation: result.setups_triggered_at_generation,
                errors: vec![],
            },
            Err(e) => {
                warn!("Backfill failed for {}: {:#}", date, e);
                BackfillRow {
                    date,
                    setups_generated: 0,
                    setups_triggered_at_generation: 0,
                    errors: vec![format!("{:#}", e)],
                }
            }
        };
        rows.push(row);
    }

    let failed_days = rows.iter().filter(|row| !row.errors.is_empty()).count();
    let summary = BackfillSummary {
        from,
        to,
        attempted_days: rows.len(),
        successful_days: rows.len() - failed_days,
        failed_days,
        rows,
    };
    info!(
        from = %from,
        to = %to,
        attempted = summary.attempted_days,
        successful = summary.successful_days,
        failed = summary.failed_days,
        "backfill complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::reconstruct::tests::{date, replayer, FakeHistory};
    use crate::sources::store::tests::MemorySetupStore;
    use crate::setup_core::cache::MemoryKvStore;
    use crate::setup_core::config::LifecycleConfig;
    use crate::setup_core::engine::SetupEngine;
    use crate::setup_core::types::RegimeState;
    use crate::sources::store::SetupStore;
    use crate::sources::{RegimeClassifier, RegimeInput};
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_weekdays_between_skips_weekends() {
        // Fri 27 Feb through Tue 3 Mar
        let dates = weekdays_between(NaiveDate::from_ymd_opt(2026, 2, 27).unwrap(), day(3));
        assert_eq!(
            dates,
            vec![NaiveDate::from_ymd_opt(2026, 2, 27).unwrap(), day(2), day(3)]
        );
        assert!(weekdays_between(day(3), day(2)).is_empty());
        assert!(weekdays_between(day(7), day(8)).is_empty());
    }

    #[tokio::test]
    async fn test_backfill_replays_each_weekday_and_purges_first() {
        let store = Arc::new(MemorySetupStore::default());
        store.save_setups(day(4), &[]).await.unwrap();
        let replayer = replayer(FakeHistory::session(), store.clone());

        let summary = backfill_range(&replayer, date(), day(4)).await.unwrap();
        assert_eq!(summary.attempted_days, 3);
        assert_eq!(summary.successful_days, 3);
        assert_eq!(summary.failed_days, 0);
        assert!(summary.rows[0].setups_generated > 0);
        // Days without data replay to nothing and store nothing
        assert_eq!(summary.rows[1].setups_generated, 0);
        let stored: Vec<NaiveDate> = store.setups.lock().unwrap().keys().copied().collect();
        assert_eq!(stored, vec![date()]);
    }

    #[tokio::test]
    async fn test_missing_table_is_not_fatal() {
        let store = Arc::new(MemorySetupStore { missing_table: true, ..Default::default() });
        let replayer = replayer(FakeHistory::session(), store.clone());
        let summary = backfill_range(&replayer, date(), date()).await.unwrap();
        assert_eq!(summary.successful_days, 1);
        assert_eq!(summary.rows[0].errors, Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_purge_failure_aborts_before_replay() {
        let store = Arc::new(MemorySetupStore { purge_offline: true, ..Default::default() });
        store.save_setups(day(4), &[]).await.unwrap();
        let replayer = replayer(FakeHistory::session(), store.clone());

        let err = backfill_range(&replayer, date(), day(4)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("connection reset"));
        // Nothing replayed, stale day left for the next attempt to purge
        let stored: Vec<NaiveDate> = store.setups.lock().unwrap().keys().copied().collect();
        assert_eq!(stored, vec![day(4)]);
    }

    struct BrokenRegime;

    #[async_trait::async_trait]
    impl RegimeClassifier for BrokenRegime {
        async fn classify(&self, _input: RegimeInput<'_>) -> anyhow::Result<RegimeState> {
            anyhow::bail!("classifier offline")
        }
    }

    #[tokio::test]
    async fn test_failing_date_does_not_stop_the_range() {
        let store = Arc::new(MemorySetupStore::default());
        let engine = SetupEngine::with_config(None, Arc::new(MemoryKvStore::new()), LifecycleConfig::default());
        let replayer =
            SessionReplayer::with_engine(Arc::new(FakeHistory::session()), Arc::new(BrokenRegime), store, engine);

        let summary = backfill_range(&replayer, date(), day(3)).await.unwrap();
        assert_eq!(summary.attempted_days, 2);
        assert_eq!(summary.failed_days, 1);
        assert_eq!(summary.successful_days, 1);
        assert!(summary.rows[0].errors[0].contains("classifier offline"));
        assert!(summary.rows[1].errors.is_empty());
    }
}
