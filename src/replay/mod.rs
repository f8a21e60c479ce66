//! Historical replay
//!
//! Rebuilds the engine's inputs for a past session from archived market
//! data, runs the live detection cycle minute by minute, and scores the
//! result with a win-rate backtest.

pub mod backfill;
pub mod backtest;
pub mod fib;
pub mod flow;
pub mod gex;
pub mod reconstruct;

pub use backfill::{backfill_range, BackfillSummary};
pub use backtest::{run_backtest, BacktestAnalytics, BacktestRow};
pub use reconstruct::{ReplayResult, SessionReplayer};
