//! Run-state synchronization for a local conductor server.
//!
//! `RunSupervisor` owns the run registry, per-run log accumulators and live
//! log streams. Callers drive it from one task: invoke commands, feed it
//! `StreamSignal`s from `next_signal`, and render from its accessors.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod accumulator;
mod api;
mod controller;
mod error;
mod log_stream;
mod reconnect;
mod registry;
mod stats;
mod streams;
mod supervisor;

pub use accumulator::{LevelCounts, LogAccumulator, LogSnapshot, format_log_line};
pub use api::ConductorApi;
pub use controller::RunController;
pub use error::{ConductorError, ResourceKind};
pub use log_stream::{
    COMPLETED_EVENT, CONNECTED_EVENT, LifecycleMarker, LogFrame, LogStream, LogStreamSnapshot,
    LogStreamState, StreamStep, decode_frame,
};
pub use reconnect::{
    DisconnectReason, ReconnectPlan, ReconnectPolicy, ReconnectTracker,
    classify_disconnect_reason,
};
pub use registry::{RefreshSummary, RunRegistry};
pub use stats::StatsCache;
pub use streams::{LogStreams, SIGNAL_CHANNEL_CAPACITY, SignalKind, StreamSignal};
pub use supervisor::{RunSupervisor, StreamNotice, WatchOutcome};
