//! Session archives for historical replay
//!
//! One zstd-compressed JSON file per trading day, named `YYYYMMDD.json.zst`,
//! holding everything a replay of that day reads: SPX and SPY minute bars,
//! both end-of-day option chains, per-contract minute bars and optionally the
//! cluster zones and fibonacci levels published that day.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::HistoricalDataSource;
use crate::replay::fib::session_fib_levels;
use crate::replay::gex::{basis, session_close};
use crate::setup_core::identity::stable_id;
use crate::setup_core::types::{
    round2, ClusterZone, FibLevel, GexLandscape, LevelData, MinuteBar, OptionSnapshot, Underlying, ZoneType,
};

pub const ARCHIVE_SUFFIX: &str = ".json.zst";
const ARCHIVE_COMPRESSION_LEVEL: i32 = 3;
/// Half-width of zones derived from gamma strikes
const DERIVED_ZONE_HALF_WIDTH: f64 = 1.5;
const DERIVED_MINOR_ZONES: usize = 5;

/// Recorded market data for a single trading day
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionArchive {
    pub date: String,
    #[serde(default)]
    pub spx_bars: Vec<MinuteBar>,
    #[serde(default)]
    pub spy_bars: Vec<MinuteBar>,
    #[serde(default)]
    pub spx_options: Vec<OptionSnapshot>,
    #[serde(default)]
    pub spy_options: Vec<OptionSnapshot>,
    /// Minute bars keyed by option ticker
    #[serde(default)]
    pub contract_bars: HashMap<String, Vec<MinuteBar>>,
    #[serde(default)]
    pub fib_levels: Vec<FibLevel>,
    #[serde(default)]
    pub levels: Option<LevelData>,
}

pub fn archive_key(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn archive_path(archive_dir: &Path, date: NaiveDate) -> PathBuf {
    archive_dir.join(format!("{}{}", archive_key(date), ARCHIVE_SUFFIX))
}

/// Load one day's archive, `None` when the file does not exist
pub fn load_archive(archive_dir: &Path, date: NaiveDate) -> Result<Option<SessionArchive>> {
    let path = archive_path(archive_dir, date);
    if !path.exists() {
        return Ok(None);
    }

    let compressed = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let json = zstd::decode_all(&compressed[..]).with_context(|| format!("Failed to decompress {}", path.display()))?;
    let archive: SessionArchive =
        serde_json::from_slice(&json).with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(Some(archive))
}

pub fn write_archive(archive_dir: &Path, date: NaiveDate, archive: &SessionArchive) -> Result<PathBuf> {
    std::fs::create_dir_all(archive_dir)
        .with_context(|| format!("Failed to create {}", archive_dir.display()))?;
    let path = archive_path(archive_dir, date);
    let json = serde_json::to_vec(archive)?;
    let compressed = zstd::encode_all(&json[..], ARCHIVE_COMPRESSION_LEVEL)?;
    std::fs::write(&path, compressed).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Dates with an archive on disk, ascending
pub fn list_archive_dates(archive_dir: &Path) -> Result<Vec<NaiveDate>> {
    if !archive_dir.exists() {
        return Ok(vec![]);
    }

    let mut dates = Vec::new();
    for entry in std::fs::read_dir(archive_dir)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().to_string();
        if let Some(key) = filename.strip_suffix(ARCHIVE_SUFFIX) {
            if let Ok(date) = NaiveDate::parse_from_str(key, "%Y%m%d") {
                dates.push(date);
            }
        }
    }

    dates.sort();
    Ok(dates)
}

/// Zones at the combined call wall, put wall and flip point plus the
/// largest remaining gamma strikes. Used when a day has no stored levels.
pub fn zones_from_landscape(date: NaiveDate, landscape: &GexLandscape) -> Option<LevelData> {
    let profile = &landscape.combined;
    if profile.gex_by_strike.is_empty() {
        return None;
    }

    let zone = |strike: f64, zone_type: ZoneType, score: f64| ClusterZone {
        id: stable_id("gex_zone", &format!("{}|{:.2}", date, strike)),
        price_low: round2(strike - DERIVED_ZONE_HALF_WIDTH),
        price_high: round2(strike + DERIVED_ZONE_HALF_WIDTH),
        cluster_score: score,
        zone_type,
        test_count: 0,
        last_test_at: None,
        held: None,
        hold_rate: None,
    };

    let mut clusters = vec![
        zone(profile.call_wall, ZoneType::Defended, 4.0),
        zone(profile.put_wall, ZoneType::Defended, 4.0),
        zone(profile.flip_point, ZoneType::Moderate, 3.0),
    ];

    let mut rest: Vec<_> = profile
        .gex_by_strike
        .iter()
        .filter(|row| {
            row.strike != profile.call_wall && row.strike != profile.put_wall && row.strike != profile.flip_point
        })
        .collect();
    rest.sort_by(|a, b| b.gex.abs().total_cmp(&a.gex.abs()));
    clusters.extend(rest.into_iter().take(DERIVED_MINOR_ZONES).map(|row| zone(row.strike, ZoneType::Minor, 1.5)));

    clusters.sort_by(|a, b| a.price_low.total_cmp(&b.price_low));
    clusters.dedup_by(|a, b| a.id == b.id);

    Some(LevelData { clusters, generated_at: session_close(date) })
}

/// [`HistoricalDataSource`] over a directory of session archives. Each
/// archive is decoded once and kept for the life of the source. Missing
/// days read as empty.
pub struct ArchiveDataSource {
    archive_dir: PathBuf,
    loaded: Mutex<HashMap<NaiveDate, Option<Arc<SessionArchive>>>>,
}

impl ArchiveDataSource {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self { archive_dir: archive_dir.into(), loaded: Mutex::new(HashMap::new()) }
    }

    async fn archive(&self, date: NaiveDate) -> Result<Option<Arc<SessionArchive>>> {
        let mut loaded = self.loaded.lock().await;
        if let Some(archive) = loaded.get(&date) {
            return Ok(archive.clone());
        }

        let dir = self.archive_dir.clone();
        let archive = tokio::task::spawn_blocking(move || load_archive(&dir, date))
            .await
            .context("archive loader panicked")??
            .map(Arc::new);
        match &archive {
            Some(a) => info!(
                "Loaded archive {} ({} SPX bars, {} SPX options, {} contracts)",
                a.date,
                a.spx_bars.len(),
                a.spx_options.len(),
                a.contract_bars.len()
            ),
            None => debug!("No archive for {}", date),
        }
        loaded.insert(date, archive.clone());
        Ok(archive)
    }
}

#[async_trait]
impl HistoricalDataSource for ArchiveDataSource {
    async fn minute_bars(&self, underlying: Underlying, date: NaiveDate) -> Result<Vec<MinuteBar>> {
        Ok(self
            .archive(date)
            .await?
            .map(|archive| match underlying {
                Underlying::Spx => archive.spx_bars.clone(),
                Underlying::Spy => archive.spy_bars.clone(),
            })
            .unwrap_or_default())
    }

    async fn option_snapshots(&self, underlying: Underlying, date: NaiveDate) -> Result<Vec<OptionSnapshot>> {
        Ok(self
            .archive(date)
            .await?
            .map(|archive| match underlying {
                Underlying::Spx => archive.spx_options.clone(),
                Underlying::Spy => archive.spy_options.clone(),
            })
            .unwrap_or_default())
    }

    async fn contract_minute_bars(&self, ticker: &str, date: NaiveDate) -> Result<Vec<MinuteBar>> {
        Ok(self
            .archive(date)
            .await?
            .and_then(|archive| archive.contract_bars.get(ticker).cloned())
            .unwrap_or_default())
    }

    async fn reference_fib_levels(&self, date: NaiveDate, basis: f64) -> Result<Vec<FibLevel>> {
        let Some(archive) = self.archive(date).await? else {
            return Ok(vec![]);
        };
        if !archive.fib_levels.is_empty() {
            return Ok(archive.fib_levels.clone());
        }
        Ok(session_fib_levels(&archive.spx_bars, &archive.spy_bars, basis))
    }

    async fn cluster_zones(&self, date: NaiveDate, landscape: &GexLandscape) -> Result<Option<LevelData>> {
        let stored = self.archive(date).await?.and_then(|archive| archive.levels.clone());
        match stored {
            Some(levels) if !levels.clusters.is_empty() => Ok(Some(levels)),
            _ => {
                debug!("Deriving zones from gamma profile for {} (basis {})", date, basis(landscape));
                Ok(zones_from_landscape(date, landscape))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::gex::build_landscape;
    use crate::setup_core::types::{ContractType, GexStrike};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spx-archive-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn bar(minute: i64, close: f64) -> MinuteBar {
        MinuteBar { timestamp_ms: minute * 60_000, open: None, high: None, low: None, close, volume: 10.0 }
    }

    #[test]
    fn test_write_then_list_and_load() {
        let dir = scratch_dir("roundtrip");
        let archive = SessionArchive {
            date: archive_key(date()),
            spx_bars: vec![bar(0, 5000.0), bar(1, 5001.0)],
            ..Default::default()
        };
        let path = write_archive(&dir, date(), &archive).unwrap();
        assert!(path.ends_with("20260302.json.zst"));
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        assert_eq!(list_archive_dates(&dir).unwrap(), vec![date()]);
        let loaded = load_archive(&dir, date()).unwrap().unwrap();
        assert_eq!(loaded.spx_bars.len(), 2);
        assert!(load_archive(&dir, date().succ_opt().unwrap()).unwrap().is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_source_reads_archive_and_defaults_missing_days() {
        let dir = scratch_dir("source");
        let mut contract_bars = HashMap::new();
        contract_bars.insert("O:SPXW260302C05000000".to_string(), vec![bar(0, 4.5)]);
        let archive = SessionArchive {
            date: archive_key(date()),
            spy_bars: vec![bar(0, 500.0)],
            spx_options: vec![OptionSnapshot {
                strike: Some(5000.0),
                contract_type: Some(ContractType::Call),
                ..Default::default()
            }],
            contract_bars,
            ..Default::default()
        };
        write_archive(&dir, date(), &archive).unwrap();

        let source = ArchiveDataSource::new(&dir);
        assert_eq!(source.minute_bars(Underlying::Spy, date()).await.unwrap().len(), 1);
        assert!(source.minute_bars(Underlying::Spx, date()).await.unwrap().is_empty());
        assert_eq!(source.option_snapshots(Underlying::Spx, date()).await.unwrap().len(), 1);
        assert_eq!(
            source.contract_minute_bars("O:SPXW260302C05000000", date()).await.unwrap()[0].close,
            4.5
        );

        let missing = date().pred_opt().unwrap();
        assert!(source.minute_bars(Underlying::Spx, missing).await.unwrap().is_empty());
        assert!(source.reference_fib_levels(missing, 0.0).await.unwrap().is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_zones_from_landscape() {
        let mut landscape = build_landscape(date(), 5000.0, 500.0, &[], &[]);
        assert!(zones_from_landscape(date(), &landscape).is_none());

        landscape.combined.gex_by_strike = vec![
            GexStrike { strike: 4950.0, gex: -900.0 },
            GexStrike { strike: 4990.0, gex: 5.0 },
            GexStrike { strike: 5010.0, gex: 300.0 },
            GexStrike { strike: 5050.0, gex: 1200.0 },
        ];
        landscape.combined.call_wall = 5050.0;
        landscape.combined.put_wall = 4950.0;
        landscape.combined.flip_point = 4990.0;

        let levels = zones_from_landscape(date(), &landscape).unwrap();
        let lows: Vec<f64> = levels.clusters.iter().map(|zone| zone.price_low).collect();
        assert_eq!(lows, vec![4948.5, 4988.5, 5008.5, 5048.5]);
        assert_eq!(levels.clusters[0].zone_type, ZoneType::Defended);
        assert_eq!(levels.clusters[2].zone_type, ZoneType::Minor);
    }
}
