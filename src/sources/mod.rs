//! Upstream collaborators
//!
//! The detection cycle consumes five engines (levels, gamma exposure,
//! fibonacci, regime, flow) plus an optional indicator source. Each is a
//! trait so live wiring, snapshot files and test fakes are interchangeable.

pub mod archive;
pub mod snapshot_dir;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use crate::setup_core::detector::CycleInputs;
use crate::setup_core::types::{
    FibLevel, FlowEvent, GexLandscape, IndicatorContext, LevelData, MinuteBar, OptionSnapshot,
    RegimeState, Underlying, VolumeTrend,
};

#[async_trait]
pub trait LevelEngine: Send + Sync {
    async fn levels(&self, force_refresh: bool) -> Result<LevelData>;
}

#[async_trait]
pub trait GexEngine: Send + Sync {
    async fn landscape(&self, force_refresh: bool) -> Result<GexLandscape>;
}

#[async_trait]
pub trait FibEngine: Send + Sync {
    async fn fib_levels(&self, force_refresh: bool) -> Result<Vec<FibLevel>>;
}

#[async_trait]
pub trait RegimeEngine: Send + Sync {
    async fn regime(&self, force_refresh: bool) -> Result<RegimeState>;
}

#[async_trait]
pub trait FlowEngine: Send + Sync {
    async fn flow_events(&self, force_refresh: bool) -> Result<Vec<FlowEvent>>;
}

#[async_trait]
pub trait IndicatorEngine: Send + Sync {
    async fn indicator_context(&self, as_of: DateTime<Utc>) -> Result<Option<IndicatorContext>>;
}

/// Live collaborator set for one process
#[derive(Clone)]
pub struct MarketSources {
    pub levels: Arc<dyn LevelEngine>,
    pub gex: Arc<dyn GexEngine>,
    pub fib: Arc<dyn FibEngine>,
    pub regime: Arc<dyn RegimeEngine>,
    pub flow: Arc<dyn FlowEngine>,
    pub indicators: Option<Arc<dyn IndicatorEngine>>,
}

impl MarketSources {
    /// Fetch all inputs concurrently. Any of the five core engines failing
    /// fails the cycle; the indicator context is optional and degrades to
    /// `None`.
    pub async fn fetch(&self, force_refresh: bool, as_of: DateTime<Utc>) -> Result<CycleInputs> {
        let indicators = async {
            match &self.indicators {
                Some(engine) => match engine.indicator_context(as_of).await {
                    Ok(context) => context,
                    Err(e) => {
                        warn!("Indicator context unavailable: {:#}", e);
                        None
                    }
                },
                None => None,
            }
        };

        let (levels, gex, fib_levels, regime, flow_events, indicator_context) = tokio::try_join!(
            async { self.levels.levels(force_refresh).await.context("level engine") },
            async { self.gex.landscape(force_refresh).await.context("gex engine") },
            async { self.fib.fib_levels(force_refresh).await.context("fib engine") },
            async { self.regime.regime(force_refresh).await.context("regime engine") },
            async { self.flow.flow_events(force_refresh).await.context("flow engine") },
            async { Ok::<_, anyhow::Error>(indicators.await) },
        )?;

        Ok(CycleInputs {
            levels,
            gex,
            fib_levels,
            regime,
            flow_events,
            indicator_context,
        })
    }
}

/// Historical market data for replaying a past session
#[async_trait]
pub trait HistoricalDataSource: Send + Sync {
    /// Regular-session minute bars for an underlying
    async fn minute_bars(&self, underlying: Underlying, date: NaiveDate) -> Result<Vec<MinuteBar>>;

    /// End-of-day options chain snapshot
    async fn option_snapshots(&self, underlying: Underlying, date: NaiveDate) -> Result<Vec<OptionSnapshot>>;

    /// Minute bars for a single option contract
    async fn contract_minute_bars(&self, ticker: &str, date: NaiveDate) -> Result<Vec<MinuteBar>>;

    /// Fibonacci levels computed as of the close of `date`
    async fn reference_fib_levels(&self, date: NaiveDate, basis: f64) -> Result<Vec<FibLevel>>;

    /// Cluster zones for `date`, or `None` when no levels can be built
    async fn cluster_zones(&self, date: NaiveDate, landscape: &GexLandscape) -> Result<Option<LevelData>>;
}

/// Everything a regime classifier sees at one replayed minute
#[derive(Debug, Clone, Copy)]
pub struct RegimeInput<'a> {
    pub bars: &'a [MinuteBar],
    pub gex: &'a GexLandscape,
    pub volume_trend: VolumeTrend,
    pub trend_strength: f64,
    pub as_of: DateTime<Utc>,
}

#[async_trait]
pub trait RegimeClassifier: Send + Sync {
    async fn classify(&self, input: RegimeInput<'_>) -> Result<RegimeState>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::setup_core::detector::tests::inputs;
    use crate::setup_core::lifecycle::tests::t;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed [`CycleInputs`] from every engine and counts level
    /// fetches.
    pub(crate) struct FixedEngines {
        pub inputs: CycleInputs,
        pub level_calls: AtomicUsize,
        pub fail_regime: bool,
    }

    impl FixedEngines {
        pub(crate) fn new(inputs: CycleInputs) -> Arc<Self> {
            Arc::new(Self { inputs, level_calls: AtomicUsize::new(0), fail_regime: false })
        }

        pub(crate) fn sources(self: &Arc<Self>) -> MarketSources {
            MarketSources {
                levels: self.clone(),
                gex: self.clone(),
                fib: self.clone(),
                regime: self.clone(),
                flow: self.clone(),
                indicators: Some(self.clone()),
            }
        }
    }

    #[async_trait]
    impl LevelEngine for FixedEngines {
        async fn levels(&self, _force_refresh: bool) -> Result<LevelData> {
            self.level_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(self.inputs.levels.clone())
        }
    }

    #[async_trait]
    impl GexEngine for FixedEngines {
        async fn landscape(&self, _force_refresh: bool) -> Result<GexLandscape> {
            Ok(self.inputs.gex.clone())
        }
    }

    #[async_trait]
    impl FibEngine for FixedEngines {
        async fn fib_levels(&self, _force_refresh: bool) -> Result<Vec<FibLevel>> {
            Ok(self.inputs.fib_levels.clone())
        }
    }

    #[async_trait]
    impl RegimeEngine for FixedEngines {
        async fn regime(&self, _force_refresh: bool) -> Result<RegimeState> {
            if self.fail_regime {
                tokio::task::yield_now().await;
                anyhow::bail!("regime service unavailable");
            }
            Ok(self.inputs.regime.clone())
        }
    }

    #[async_trait]
    impl FlowEngine for FixedEngines {
        async fn flow_events(&self, _force_refresh: bool) -> Result<Vec<FlowEvent>> {
            Ok(self.inputs.flow_events.clone())
        }
    }

    #[async_trait]
    impl IndicatorEngine for FixedEngines {
        async fn indicator_context(&self, _as_of: DateTime<Utc>) -> Result<Option<IndicatorContext>> {
            anyhow::bail!("no bars yet")
        }
    }

    #[tokio::test]
    async fn test_fetch_joins_all_engines() {
        let engines = FixedEngines::new(inputs(5010.0, t(0)));
        let fetched = engines.sources().fetch(false, t(0)).await.unwrap();
        assert_eq!(fetched.levels.clusters.len(), 3);
        // Indicator failure degrades instead of failing the cycle
        assert!(fetched.indicator_context.is_none());
    }

    #[tokio::test]
    async fn test_fetch_fails_when_core_engine_fails() {
        let engines = Arc::new(FixedEngines {
            inputs: inputs(5010.0, t(0)),
            level_calls: AtomicUsize::new(0),
            fail_regime: true,
        });
        let err = engines.sources().fetch(false, t(0)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("regime service unavailable"));
    }
}
