//! camview - shared, self-healing live camera sessions
//!
//! This crate keeps one WebRTC session per camera endpoint alive for any
//! number of viewers, restarts it when it stalls or fails, and falls back to
//! periodic snapshots whenever no viewer is presenting live media.

pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod snapshot;
pub mod stats;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{AppError, Result};
