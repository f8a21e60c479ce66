// Library crate - setup engine, collaborators, replay and server plumbing

pub mod setup_core;
pub mod sources;
pub mod replay;
pub mod types;
pub mod api;
pub mod scheduler;

// Re-export commonly used types
pub use setup_core::{DetectOptions, LifecycleConfig, Setup, SetupEngine, SetupStatus};
pub use types::{AppState, WsMessage};
