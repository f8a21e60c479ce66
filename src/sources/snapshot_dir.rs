//! Live inputs from a directory of JSON snapshots
//!
//! The upstream engines publish their latest output as files:
//! `levels.json`, `gex.json`, `fib.json`, `regime.json`, `flow.json` and
//! `bars.json` (today's SPX minute bars). Every read goes to disk, so a
//! forced refresh behaves like a normal one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use super::{FibEngine, FlowEngine, GexEngine, IndicatorEngine, LevelEngine, MarketSources, RegimeEngine};
use crate::setup_core::indicators::build_indicator_context;
use crate::setup_core::types::{
    FibLevel, FlowEvent, GexLandscape, IndicatorContext, LevelData, MinuteBar, RegimeState,
};

pub const LEVELS_FILE: &str = "levels.json";
pub const GEX_FILE: &str = "gex.json";
pub const FIB_FILE: &str = "fib.json";
pub const REGIME_FILE: &str = "regime.json";
pub const FLOW_FILE: &str = "flow.json";
pub const BARS_FILE: &str = "bars.json";

#[derive(Debug, Clone)]
pub struct SnapshotDir {
    root: PathBuf,
}

impl SnapshotDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wire this directory in as every collaborator.
    pub fn into_sources(self) -> MarketSources {
        let dir = Arc::new(self);
        MarketSources {
            levels: dir.clone(),
            gex: dir.clone(),
            fib: dir.clone(),
            regime: dir.clone(),
            flow: dir.clone(),
            indicators: Some(dir),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.root.join(name);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[async_trait]
impl LevelEngine for SnapshotDir {
    async fn levels(&self, _force_refresh: bool) -> Result<LevelData> {
        self.read_json(LEVELS_FILE).await
    }
}

#[async_trait]
impl GexEngine for SnapshotDir {
    async fn landscape(&self, _force_refresh: bool) -> Result<GexLandscape> {
        self.read_json(GEX_FILE).await
    }
}

#[async_trait]
impl FibEngine for SnapshotDir {
    async fn fib_levels(&self, _force_refresh: bool) -> Result<Vec<FibLevel>> {
        self.read_json(FIB_FILE).await
    }
}

#[async_trait]
impl RegimeEngine for SnapshotDir {
    async fn regime(&self, _force_refresh: bool) -> Result<RegimeState> {
        self.read_json(REGIME_FILE).await
    }
}

#[async_trait]
impl FlowEngine for SnapshotDir {
    async fn flow_events(&self, _force_refresh: bool) -> Result<Vec<FlowEvent>> {
        self.read_json(FLOW_FILE).await
    }
}

#[async_trait]
impl IndicatorEngine for SnapshotDir {
    async fn indicator_context(&self, as_of: DateTime<Utc>) -> Result<Option<IndicatorContext>> {
        let bars: Vec<MinuteBar> = self.read_json(BARS_FILE).await?;
        Ok(build_indicator_context(&bars, as_of))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup_core::detector::tests::inputs;
    use crate::setup_core::lifecycle::tests::t;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("spx-snapshot-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_reads_all_snapshots() {
        let dir = scratch_dir("all");
        let cycle = inputs(5010.0, t(0));
        std::fs::write(dir.join(LEVELS_FILE), serde_json::to_vec(&cycle.levels).unwrap()).unwrap();
        std::fs::write(dir.join(GEX_FILE), serde_json::to_vec(&cycle.gex).unwrap()).unwrap();
        std::fs::write(dir.join(FIB_FILE), b"[]").unwrap();
        std::fs::write(dir.join(REGIME_FILE), serde_json::to_vec(&cycle.regime).unwrap()).unwrap();
        std::fs::write(dir.join(FLOW_FILE), b"[]").unwrap();
        std::fs::write(dir.join(BARS_FILE), b"[]").unwrap();

        let fetched = SnapshotDir::new(&dir).into_sources().fetch(false, t(0)).await.unwrap();
        assert_eq!(fetched.levels.clusters.len(), 3);
        assert_eq!(fetched.gex.spx.spot_price, 5010.0);
        assert!(fetched.indicator_context.is_none());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_file_names_the_path() {
        let dir = scratch_dir("missing");
        let err = SnapshotDir::new(&dir).levels(false).await.unwrap_err();
        assert!(format!("{:#}", err).contains(LEVELS_FILE));
        std::fs::remove_dir_all(&dir).ok();
    }
}
