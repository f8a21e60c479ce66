//! Setup lifecycle and confluence engine
//!
//! Candidate zones come in from the level engine each cycle; every zone
//! becomes a setup with a stable id whose status moves through
//! forming, ready, triggered and one of the terminal states.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod confluence;
pub mod context;
pub mod detector;
pub mod engine;
pub mod entry_zone;
pub mod identity;
pub mod indicators;
pub mod lifecycle;
pub mod market_state;
pub mod types;
pub mod vwap;

pub use config::LifecycleConfig;
pub use detector::{CycleInputs, SetupDetector};
pub use engine::{DetectOptions, SetupEngine};
pub use types::{Direction, Setup, SetupStatus, SetupType};
