//! Single owner of run state, logs and live streams.
//!
//! All mutation happens through `&mut RunSupervisor`. Network work either
//! completes inside an `async` method or arrives later as a `StreamSignal`
//! that the caller hands back to `handle_signal`, so a log record is decoded
//! and appended in one step and a closed stream can never receive more.

use std::collections::HashMap;
use std::sync::Arc;

use conductor_client::{ConductorClientError, Run, RunStatus, StartRunRequest, Stats};
use tokio::sync::mpsc;

use crate::accumulator::{LogAccumulator, LogSnapshot};
use crate::api::ConductorApi;
use crate::controller::RunController;
use crate::error::ConductorError;
use crate::log_stream::{LogStreamSnapshot, LogStreamState, StreamStep};
use crate::reconnect::DisconnectReason;
use crate::registry::RunRegistry;
use crate::stats::StatsCache;
use crate::streams::{LogStreams, SIGNAL_CHANNEL_CAPACITY, SignalKind, StreamSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Opened,
    AlreadyWatching,
    /// Terminal runs produce no further logs, so no stream is opened.
    RunTerminal(RunStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamNotice {
    Connected {
        run_id: String,
    },
    Appended {
        run_id: String,
        index: usize,
    },
    Completed {
        run_id: String,
    },
    ConnectionLost {
        run_id: String,
        reason: DisconnectReason,
        error: ConductorError,
    },
}

#[derive(Debug)]
pub struct RunSupervisor<A> {
    api: Arc<A>,
    controller: RunController<A>,
    registry: RunRegistry,
    logs: HashMap<String, LogAccumulator>,
    streams: LogStreams,
    stats: StatsCache,
    signals: mpsc::Receiver<StreamSignal>,
}

impl<A> RunSupervisor<A>
where
    A: ConductorApi,
{
    #[must_use]
    pub fn new(api: Arc<A>) -> Self {
        let (sender, signals) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            controller: RunController::new(Arc::clone(&api)),
            api,
            registry: RunRegistry::new(),
            logs: HashMap::new(),
            streams: LogStreams::new(sender),
            stats: StatsCache::default(),
            signals,
        }
    }

    #[must_use]
    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    #[must_use]
    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    #[must_use]
    pub fn runs(&self) -> &[Run] {
        self.registry.list_runs()
    }

    pub fn run(&self, run_id: &str) -> Result<&Run, ConductorError> {
        self.registry.require(run_id)
    }

    pub async fn refresh(&mut self) -> bool {
        let result = self.api.list_runs().await;
        self.apply_refresh(result)
    }

    /// Apply a run list fetched elsewhere, e.g. by a spawned poll task.
    ///
    /// Streams of runs that are now terminal are closed.
    pub fn apply_refresh(&mut self, result: Result<Vec<Run>, ConductorClientError>) -> bool {
        if !self.registry.apply_refresh_result(result) {
            return false;
        }
        for run_id in self.streams.live_run_ids() {
            if self.registry.is_terminal(&run_id) && self.streams.close(&run_id) {
                tracing::info!(run_id = %run_id, "run reached terminal status; log stream closed");
            }
        }
        true
    }

    pub async fn refresh_stats(&mut self) -> bool {
        self.stats.refresh(self.api.as_ref()).await
    }

    pub fn apply_stats(&mut self, result: Result<Stats, ConductorClientError>) -> bool {
        self.stats.apply(result)
    }

    #[must_use]
    pub fn stats(&self) -> &StatsCache {
        &self.stats
    }

    pub async fn start(&mut self, request: StartRunRequest) -> Result<Run, ConductorError> {
        self.controller.start(&mut self.registry, request).await
    }

    pub async fn stop(&mut self, run_id: &str) -> Result<(), ConductorError> {
        self.controller
            .stop(&mut self.registry, &mut self.streams, run_id)
            .await
    }

    /// Begin streaming logs for a run, replacing any previous log contents.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(&mut self, run_id: &str) -> WatchOutcome {
        if self.registry.is_terminal(run_id) {
            let status = self
                .registry
                .get(run_id)
                .map_or(RunStatus::Stopped, |run| run.status);
            tracing::debug!(run_id = %run_id, status = %status, "not watching terminal run");
            return WatchOutcome::RunTerminal(status);
        }
        if self.streams.is_live(run_id) {
            return WatchOutcome::AlreadyWatching;
        }
        self.logs.entry(run_id.to_string()).or_default().clear();
        match self.streams.open(Arc::clone(&self.api), run_id) {
            Some(generation) => {
                tracing::debug!(run_id = %run_id, generation, "watching run logs");
                WatchOutcome::Opened
            }
            None => WatchOutcome::AlreadyWatching,
        }
    }

    /// Stop watching: closes the stream and discards its state and logs.
    pub fn unwatch(&mut self, run_id: &str) -> bool {
        let closed = self.streams.remove(run_id);
        self.logs.remove(run_id);
        closed
    }

    #[must_use]
    pub fn logs(&self, run_id: &str) -> Option<LogSnapshot<'_>> {
        self.logs.get(run_id).map(LogAccumulator::snapshot)
    }

    #[must_use]
    pub fn accumulator(&self, run_id: &str) -> Option<&LogAccumulator> {
        self.logs.get(run_id)
    }

    #[must_use]
    pub fn stream_state(&self, run_id: &str) -> Option<LogStreamState> {
        self.streams.state(run_id)
    }

    #[must_use]
    pub fn stream_snapshot(&self, run_id: &str) -> Option<LogStreamSnapshot> {
        self.streams.snapshot(run_id)
    }

    #[must_use]
    pub fn is_watching(&self, run_id: &str) -> bool {
        self.streams.is_live(run_id)
    }

    /// Wait for the next transport signal. Cancel-safe.
    pub async fn next_signal(&mut self) -> Option<StreamSignal> {
        self.signals.recv().await
    }

    /// Apply one transport signal. Signals from replaced or closed transports
    /// yield nothing.
    pub fn handle_signal(&mut self, signal: StreamSignal) -> Option<StreamNotice> {
        let StreamSignal {
            run_id,
            generation,
            kind,
        } = signal;
        let Some(stream) = self.streams.current_mut(&run_id, generation) else {
            tracing::trace!(run_id = %run_id, generation, "discarding stale stream signal");
            return None;
        };

        match kind {
            SignalKind::Opened => match stream.on_open() {
                StreamStep::Marker(_) => Some(StreamNotice::Connected { run_id }),
                _ => None,
            },
            SignalKind::Frame(frame) => match stream.on_frame(&frame) {
                StreamStep::Append(record) => {
                    let logs = self.logs.entry(run_id.clone()).or_default();
                    logs.append(record);
                    Some(StreamNotice::Appended {
                        index: logs.len() - 1,
                        run_id,
                    })
                }
                StreamStep::Completed => {
                    self.streams.finish(&run_id);
                    Some(StreamNotice::Completed { run_id })
                }
                StreamStep::Marker(_) | StreamStep::Dropped(_) | StreamStep::Ignored => None,
            },
            SignalKind::Failed(error) => {
                if !stream.on_transport_error(error.reason()) {
                    return None;
                }
                self.streams.release(&run_id);
                Some(StreamNotice::ConnectionLost {
                    reason: DisconnectReason::from_client_error(&error),
                    error: ConductorError::from(error),
                    run_id,
                })
            }
            SignalKind::Ended => {
                let message = "stream ended before completion";
                if !stream.on_transport_error(message) {
                    return None;
                }
                self.streams.release(&run_id);
                Some(StreamNotice::ConnectionLost {
                    run_id,
                    reason: DisconnectReason::StreamEnded,
                    error: ConductorError::transport(message),
                })
            }
        }
    }
}
