//! Local view of the server's runs.
//!
//! The registry is replaced wholesale by each successful poll, with two
//! exceptions: a run the user stopped stays stopped until the server agrees,
//! and a run already seen in a terminal status never regresses to running.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use conductor_client::{ConductorClientError, Run, RunStatus};

use crate::error::ConductorError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub total: usize,
    pub held_stopped: usize,
    pub held_terminal: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    None,
    Stopped,
    Terminal,
}

#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Vec<Run>,
    pending_stops: HashSet<String>,
    last_refreshed_at: Option<DateTime<Utc>>,
    last_refresh_error: Option<String>,
}

impl RunRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn list_runs(&self) -> &[Run] {
        &self.runs
    }

    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<&Run> {
        self.runs.iter().find(|run| run.id == run_id)
    }

    pub fn require(&self, run_id: &str) -> Result<&Run, ConductorError> {
        self.get(run_id)
            .ok_or_else(|| ConductorError::run_not_found(run_id))
    }

    /// True when the run is known terminal or a local stop is outstanding.
    #[must_use]
    pub fn is_terminal(&self, run_id: &str) -> bool {
        self.pending_stops.contains(run_id)
            || self
                .get(run_id)
                .is_some_and(|run| run.status.is_terminal())
    }

    #[must_use]
    pub fn has_pending_stop(&self, run_id: &str) -> bool {
        self.pending_stops.contains(run_id)
    }

    #[must_use]
    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed_at
    }

    #[must_use]
    pub fn last_refresh_error(&self) -> Option<&str> {
        self.last_refresh_error.as_deref()
    }

    /// Record a run the server just created. A repeated id overwrites in place,
    /// keeping a local stop or terminal status the same way a poll does.
    pub fn apply_start(&mut self, mut run: Run) {
        let known = self.get(&run.id).map(|existing| existing.status);
        self.reconcile_status(&mut run, known);
        match self.runs.iter_mut().find(|existing| existing.id == run.id) {
            Some(existing) => *existing = run,
            None => self.runs.push(run),
        }
    }

    /// Hold a locally stopped or terminal status against an incoming
    /// non-terminal one. A terminal incoming status confirms any pending stop.
    fn reconcile_status(&mut self, run: &mut Run, known: Option<RunStatus>) -> Hold {
        if run.status.is_terminal() {
            self.pending_stops.remove(&run.id);
            Hold::None
        } else if self.pending_stops.contains(&run.id) {
            run.status = RunStatus::Stopped;
            Hold::Stopped
        } else if let Some(status) = known.filter(|status| status.is_terminal()) {
            run.status = status;
            Hold::Terminal
        } else {
            Hold::None
        }
    }

    /// Optimistically mark a run stopped ahead of server confirmation.
    ///
    /// Returns whether a running entry changed. The stop intent is remembered
    /// even when the run has not been fetched yet.
    pub fn apply_stop(&mut self, run_id: &str) -> bool {
        let Some(run) = self.runs.iter_mut().find(|run| run.id == run_id) else {
            self.pending_stops.insert(run_id.to_string());
            return false;
        };
        if run.status.is_terminal() {
            return false;
        }
        run.status = RunStatus::Stopped;
        self.pending_stops.insert(run_id.to_string());
        true
    }

    /// Replace the registry with a fetched run list.
    ///
    /// Display order stays stable: runs already known keep their position and
    /// new runs are appended in fetched order.
    pub fn apply_refresh(&mut self, fetched: Vec<Run>) -> RefreshSummary {
        let previous: HashMap<String, (usize, RunStatus)> = self
            .runs
            .iter()
            .enumerate()
            .map(|(index, run)| (run.id.clone(), (index, run.status)))
            .collect();

        let mut summary = RefreshSummary {
            total: fetched.len(),
            ..RefreshSummary::default()
        };
        let mut next = Vec::with_capacity(fetched.len());
        let fetched_ids: HashSet<String> = fetched.iter().map(|run| run.id.clone()).collect();
        // A stop for a run the server no longer lists has nothing left to hold.
        self.pending_stops.retain(|run_id| fetched_ids.contains(run_id));

        for (fetched_index, mut run) in fetched.into_iter().enumerate() {
            let known = previous.get(&run.id).copied();
            match self.reconcile_status(&mut run, known.map(|(_, status)| status)) {
                Hold::Stopped => summary.held_stopped += 1,
                Hold::Terminal => summary.held_terminal += 1,
                Hold::None => {}
            }
            let position = known.map_or(usize::MAX, |(index, _)| index);
            next.push(((position, fetched_index), run));
        }
        next.sort_by_key(|(order, _)| *order);

        self.runs = next.into_iter().map(|(_, run)| run).collect();
        self.last_refreshed_at = Some(Utc::now());
        self.last_refresh_error = None;
        summary
    }

    /// Keep the current runs and remember why the poll failed.
    pub fn record_refresh_failure(&mut self, error: &ConductorClientError) {
        tracing::warn!(error = %error, "run refresh failed; keeping previous runs");
        self.last_refresh_error = Some(error.reason());
    }

    pub fn apply_refresh_result(&mut self, result: Result<Vec<Run>, ConductorClientError>) -> bool {
        match result {
            Ok(runs) => {
                let summary = self.apply_refresh(runs);
                tracing::debug!(
                    total = summary.total,
                    held_stopped = summary.held_stopped,
                    held_terminal = summary.held_terminal,
                    "runs refreshed"
                );
                true
            }
            Err(error) => {
                self.record_refresh_failure(&error);
                false
            }
        }
    }
}
