//! Detection coordinator
//!
//! Live callers read through the 10-second result cache and share one
//! in-flight cycle. Forced callers, and callers that supply their own
//! inputs (replay), bypass both and run a cycle directly.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::cache::{
    KvStore, ReadThroughCache, SingleFlight, PREVIOUS_SETUPS_KEY, PREVIOUS_SETUPS_TTL_SECONDS,
    SETUPS_CACHE_KEY, SETUPS_CACHE_TTL_SECONDS,
};
use super::config::LifecycleConfig;
use super::detector::{CycleInputs, SetupDetector};
use super::types::Setup;
use crate::sources::MarketSources;

/// Per-call overrides for one detection
#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    /// Bypass the result cache and single-flight, refetching collaborators
    pub force_refresh: bool,
    /// Evaluation time, defaults to now
    pub as_of: Option<DateTime<Utc>>,
    /// Previous cycle's list, instead of the stored one
    pub previous_setups: Option<Vec<Setup>>,
    /// Collaborator snapshots, instead of fetching them
    pub inputs: Option<CycleInputs>,
}

impl DetectOptions {
    pub fn forced() -> Self {
        Self { force_refresh: true, ..Default::default() }
    }

    fn is_live(&self) -> bool {
        !self.force_refresh && self.inputs.is_none() && self.previous_setups.is_none() && self.as_of.is_none()
    }
}

struct EngineInner {
    sources: Option<MarketSources>,
    detector: Mutex<SetupDetector>,
    config: Option<LifecycleConfig>,
    cache: ReadThroughCache<Vec<Setup>>,
    previous: ReadThroughCache<Vec<Setup>>,
    flight: SingleFlight<Vec<Setup>>,
}

/// Cheap to clone; clones share the detector, cache and in-flight slot.
#[derive(Clone)]
pub struct SetupEngine {
    inner: Arc<EngineInner>,
}

impl SetupEngine {
    pub fn new(sources: Option<MarketSources>, store: Arc<dyn KvStore>) -> Self {
        Self::build(sources, store, None)
    }

    /// Pin the lifecycle config instead of re-reading the environment each cycle.
    pub fn with_config(sources: Option<MarketSources>, store: Arc<dyn KvStore>, config: LifecycleConfig) -> Self {
        Self::build(sources, store, Some(config))
    }

    fn build(sources: Option<MarketSources>, store: Arc<dyn KvStore>, config: Option<LifecycleConfig>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                sources,
                detector: Mutex::new(SetupDetector::new()),
                config,
                cache: ReadThroughCache::new(store.clone(), SETUPS_CACHE_KEY, SETUPS_CACHE_TTL_SECONDS),
                previous: ReadThroughCache::new(store, PREVIOUS_SETUPS_KEY, PREVIOUS_SETUPS_TTL_SECONDS),
                flight: SingleFlight::new(),
            }),
        }
    }

    /// Drop all hysteresis state, e.g. before replaying another date.
    pub async fn reset_context(&self) {
        self.inner.detector.lock().await.reset();
    }

    pub async fn detect_active_setups(&self, options: DetectOptions) -> Result<Vec<Setup>> {
        if !options.is_live() {
            return self.inner.run_cycle(options).await;
        }

        if let Some(cached) = self.inner.cache.get().await {
            debug!("Serving {} cached setups", cached.len());
            return Ok(cached);
        }

        let inner = self.inner.clone();
        self.inner
            .flight
            .run(move || async move { inner.run_cycle(DetectOptions::default()).await }.boxed())
            .await
            .map_err(|e| anyhow!("{:#}", e))
    }

    pub async fn setup_by_id(&self, id: &str, options: DetectOptions) -> Result<Option<Setup>> {
        let setups = self.detect_active_setups(options).await?;
        Ok(setups.into_iter().find(|setup| setup.id == id))
    }
}

impl EngineInner {
    async fn run_cycle(&self, options: DetectOptions) -> Result<Vec<Setup>> {
        let now = options.as_of.unwrap_or_else(Utc::now);
        let config = self.config.clone().unwrap_or_else(LifecycleConfig::from_env);

        let fetched_live = options.inputs.is_none();
        let inputs = match options.inputs {
            Some(inputs) => inputs,
            None => match &self.sources {
                Some(sources) => sources.fetch(options.force_refresh, now).await?,
                None => bail!("no market sources configured and no inputs supplied"),
            },
        };

        // Held from reading the previous list until the result is stored, so
        // overlapping cycles always diff against the latest stored list.
        let mut detector = self.detector.lock().await;

        let previous = match options.previous_setups {
            Some(previous) => previous,
            None => match self.previous.get().await {
                Some(previous) => previous,
                None => self.cache.get().await.unwrap_or_default(),
            },
        };

        let setups = detector.detect(&inputs, &previous, now, &config);

        if fetched_live {
            self.cache.set(&setups).await;
            self.previous.set(&setups).await;
            info!("Stored {} setups", setups.len());
        }
        Ok(setups)
    }
}
