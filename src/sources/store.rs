//! Persistence of replayed setups and backtest rows

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tracing::info;

use crate::replay::backtest::BacktestRow;
use crate::setup_core::types::Setup;

pub const SETUPS_TABLE: &str = "setups";
pub const BACKTEST_TABLE: &str = "backtest";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not find the table {0}")]
    MissingTable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// True for a missing table, including backends that only report it
    /// in the message text.
    pub fn is_missing_table(&self) -> bool {
        match self {
            StoreError::MissingTable(_) => true,
            StoreError::Other(e) => {
                let message = format!("{:#}", e).to_lowercase();
                message.contains("could not find the table") || message.contains("does not exist")
            }
        }
    }
}

#[async_trait]
pub trait SetupStore: Send + Sync {
    /// Replace the stored setups for `date`
    async fn save_setups(&self, date: NaiveDate, setups: &[Setup]) -> Result<(), StoreError>;

    /// Replace the stored backtest rows for `date`
    async fn save_backtest_rows(&self, date: NaiveDate, rows: &[BacktestRow]) -> Result<(), StoreError>;

    /// Delete everything stored for dates in `[from, to]`, returning the
    /// number of sessions removed
    async fn purge(&self, from: NaiveDate, to: NaiveDate) -> Result<usize, StoreError>;
}

/// Setups as `setups/YYYYMMDD.json`, backtest rows as `backtest/YYYYMMDD.csv`
#[derive(Debug, Clone)]
pub struct FileSetupStore {
    root: PathBuf,
}

impl FileSetupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, table: &str, date: NaiveDate, extension: &str) -> PathBuf {
        self.root.join(table).join(format!("{}.{}", date.format("%Y%m%d"), extension))
    }

    async fn write_file(&self, path: PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    async fn purge_table(&self, table: &str, from: NaiveDate, to: NaiveDate) -> Result<usize, StoreError> {
        let dir = self.root.join(table);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(StoreError::MissingTable(table.to_string()));
        }

        let (from_key, to_key) = (from.format("%Y%m%d").to_string(), to.format("%Y%m%d").to_string());
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await.context("Failed to read directory entry")? {
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some((key, _)) = filename.split_once('.') else {
                continue;
            };
            if key.len() == 8 && key >= from_key.as_str() && key <= to_key.as_str() {
                tokio::fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("Failed to remove {}", filename))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn backtest_rows_csv(rows: &[BacktestRow]) -> anyhow::Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.into_inner().context("Failed to flush CSV writer")
}

#[async_trait]
impl SetupStore for FileSetupStore {
    async fn save_setups(&self, date: NaiveDate, setups: &[Setup]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(setups).context("Failed to serialize setups")?;
        self.write_file(self.table_path(SETUPS_TABLE, date, "json"), json).await?;
        info!("Stored {} setups for {}", setups.len(), date);
        Ok(())
    }

    async fn save_backtest_rows(&self, date: NaiveDate, rows: &[BacktestRow]) -> Result<(), StoreError> {
        let csv = backtest_rows_csv(rows)?;
        self.write_file(self.table_path(BACKTEST_TABLE, date, "csv"), csv).await
    }

    async fn purge(&self, from: NaiveDate, to: NaiveDate) -> Result<usize, StoreError> {
        // Setup files define the sessions; backtest files follow them
        let removed = self.purge_table(SETUPS_TABLE, from, to).await?;
        match self.purge_table(BACKTEST_TABLE, from, to).await {
            Ok(_) => {}
            Err(e) if e.is_missing_table() => {}
            Err(e) => return Err(e),
        }
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::replay::backtest::run_backtest;
    use crate::setup_core::lifecycle::tests::{sample_setup, t};
    use crate::setup_core::types::SetupStatus;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory store; `missing_table` makes purge fail the way an
    /// unprovisioned backend does, `purge_offline` like a dropped connection.
    #[derive(Default)]
    pub(crate) struct MemorySetupStore {
        pub setups: Mutex<BTreeMap<NaiveDate, Vec<Setup>>>,
        pub rows: Mutex<BTreeMap<NaiveDate, Vec<BacktestRow>>>,
        pub missing_table: bool,
        pub purge_offline: bool,
    }

    #[async_trait]
    impl SetupStore for MemorySetupStore {
        async fn save_setups(&self, date: NaiveDate, setups: &[Setup]) -> Result<(), StoreError> {
            self.setups.lock().unwrap().insert(date, setups.to_vec());
            Ok(())
        }

        async fn save_backtest_rows(&self, date: NaiveDate, rows: &[BacktestRow]) -> Result<(), StoreError> {
            self.rows.lock().unwrap().insert(date, rows.to_vec());
            Ok(())
        }

        async fn purge(&self, from: NaiveDate, to: NaiveDate) -> Result<usize, StoreError> {
            if self.missing_table {
                return Err(anyhow::anyhow!("relation \"spx_setup_instances\" does not exist").into());
            }
            if self.purge_offline {
                return Err(StoreError::Other(anyhow::anyhow!("connection reset")));
            }
            let mut setups = self.setups.lock().unwrap();
            let before = setups.len();
            setups.retain(|date, _| *date < from || *date > to);
            self.rows.lock().unwrap().retain(|date, _| *date < from || *date > to);
            Ok(before - setups.len())
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spx-store-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_missing_table_detection() {
        assert!(StoreError::MissingTable("setups".into()).is_missing_table());
        assert!(StoreError::from(anyhow::anyhow!("Could not find the table public.x")).is_missing_table());
        assert!(!StoreError::from(anyhow::anyhow!("connection reset")).is_missing_table());
    }

    #[tokio::test]
    async fn test_file_store_save_and_purge() {
        let dir = scratch_dir("purge");
        let store = FileSetupStore::new(&dir);
        assert!(store.purge(date(2), date(3)).await.unwrap_err().is_missing_table());

        let setup = sample_setup(SetupStatus::Triggered, t(0));
        let report = run_backtest(std::slice::from_ref(&setup), &[], date(2));
        for day in [2, 3, 4] {
            store.save_setups(date(day), std::slice::from_ref(&setup)).await.unwrap();
        }
        store.save_backtest_rows(date(2), &report.rows).await.unwrap();

        let csv = std::fs::read_to_string(dir.join(BACKTEST_TABLE).join("20260302.csv")).unwrap();
        assert!(csv.starts_with("engine_setup_id,session_date,setup_type"));
        assert!(csv.contains("spx_setup_test,2026-03-02,fade_at_wall,bullish,ranging"));

        assert_eq!(store.purge(date(2), date(3)).await.unwrap(), 2);
        assert!(dir.join(SETUPS_TABLE).join("20260304.json").exists());
        assert!(!dir.join(BACKTEST_TABLE).join("20260302.csv").exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
