//! Polls the engine on a fixed interval and pushes new triggers

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::setup_core::lifecycle::newly_triggered;
use crate::setup_core::DetectOptions;
use crate::types::{AppState, WsMessage};

/// Run one live cycle and broadcast setups that became triggered since the
/// previous poll. Returns how many were broadcast.
pub async fn poll_once(state: &AppState) -> Result<usize> {
    let setups = state.engine.detect_active_setups(DetectOptions::default()).await?;

    let mut last = state.last_setups.write().await;
    let fresh: Vec<_> = newly_triggered(&last, &setups).into_iter().cloned().collect();
    for setup in &fresh {
        info!(
            "Setup triggered: {} {} {} @ {:.2}-{:.2}",
            setup.id, setup.setup_type, setup.direction, setup.entry_zone.low, setup.entry_zone.high
        );
        // No receivers is fine
        let _ = state.tx.send(WsMessage::SetupTriggered(setup.clone()));
    }
    *last = setups;
    Ok(fresh.len())
}

pub async fn run_scheduler(state: Arc<AppState>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match poll_once(&state).await {
            Ok(0) => debug!("Poll complete, no new triggers"),
            Ok(n) => info!("Broadcast {} newly triggered setups", n),
            Err(e) => {
                warn!("Setup poll failed: {:#}", e);
                let _ = state.tx.send(WsMessage::Error { message: format!("{:#}", e) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup_core::cache::MemoryKvStore;
    use crate::setup_core::config::LifecycleConfig;
    use crate::setup_core::detector::tests::inputs;
    use crate::setup_core::SetupEngine;
    use crate::sources::tests::FixedEngines;
    use chrono::Utc;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_poll_broadcasts_each_trigger_once() {
        // Price inside the 5000-5004 support zone
        let engines = FixedEngines::new(inputs(5002.0, Utc::now()));
        let engine = SetupEngine::with_config(
            Some(engines.sources()),
            Arc::new(MemoryKvStore::new()),
            LifecycleConfig::default(),
        );
        let (tx, mut rx) = broadcast::channel(16);
        let state = AppState::new(engine, tx);

        assert_eq!(poll_once(&state).await.unwrap(), 1);
        match rx.try_recv().unwrap() {
            WsMessage::SetupTriggered(setup) => assert_eq!(setup.cluster_zone.id, "support"),
            other => panic!("unexpected message {:?}", other),
        }

        assert_eq!(poll_once(&state).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }
}
