use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::setup_core::{Setup, SetupEngine};

/// Messages pushed to WebSocket clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    SetupTriggered(Setup),
    Connected {
        #[serde(rename = "activeSetups")]
        active_setups: usize,
    },
    Error { message: String },
}

/// Shared application state
pub struct AppState {
    pub tx: broadcast::Sender<WsMessage>,
    pub engine: SetupEngine,
    /// Last list the scheduler saw, for spotting new triggers
    pub last_setups: RwLock<Vec<Setup>>,
}

impl AppState {
    pub fn new(engine: SetupEngine, tx: broadcast::Sender<WsMessage>) -> Self {
        Self { tx, engine, last_setups: RwLock::new(Vec::new()) }
    }
}
