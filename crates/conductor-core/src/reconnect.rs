//! Opt-in reconnection for dropped log streams.
//!
//! Nothing here reconnects by itself; the caller decides whether to re-watch
//! after a `ConnectionLost` notice and uses the plan for the delay.

use std::collections::HashMap;
use std::time::Duration;

use conductor_client::{ConductorClientError, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the stream without a completion event.
    StreamEnded,
    Unauthorized,
    Forbidden,
    NotFound,
    Network,
    Unknown,
}

impl DisconnectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamEnded => "stream_ended",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    /// Auth and missing-run failures will not fix themselves on retry.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::StreamEnded | Self::Network | Self::Unknown)
    }

    #[must_use]
    pub fn from_client_error(error: &ConductorClientError) -> Self {
        match error {
            ConductorClientError::Http { status, .. } => match *status {
                StatusCode::UNAUTHORIZED => Self::Unauthorized,
                StatusCode::FORBIDDEN => Self::Forbidden,
                StatusCode::NOT_FOUND => Self::NotFound,
                _ => Self::Unknown,
            },
            ConductorClientError::Request { message } | ConductorClientError::Read { message } => {
                classify_disconnect_reason(message)
            }
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub fn classify_disconnect_reason(error: &str) -> DisconnectReason {
    let normalized = error.to_ascii_lowercase();
    if normalized.contains("unauthorized") || normalized.contains(" 401") {
        return DisconnectReason::Unauthorized;
    }
    if normalized.contains("forbidden") || normalized.contains(" 403") {
        return DisconnectReason::Forbidden;
    }
    if normalized.contains("closed")
        || normalized.contains("connection reset")
        || normalized.contains("connection refused")
        || normalized.contains("timed out")
        || normalized.contains("timeout")
        || normalized.contains("network")
        || normalized.contains("error sending request")
        || normalized.contains("error decoding response body")
    {
        return DisconnectReason::Network;
    }
    DisconnectReason::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    /// `None` retries without limit.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 250,
            max_ms: 8_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: doubles from `base_ms`, capped at `max_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(10);
        let base = self.base_ms.max(1);
        let scaled = base.saturating_mul(1_u64 << exponent);
        Duration::from_millis(scaled.min(self.max_ms.max(base)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    pub attempt: u32,
    pub delay: Duration,
}

/// Per-run attempt counters.
#[derive(Debug, Clone, Default)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: HashMap<String, u32>,
}

impl ReconnectTracker {
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: HashMap::new(),
        }
    }

    /// Plan the next attempt, or `None` when the reason is permanent or the
    /// attempt budget is spent.
    pub fn on_disconnect(&mut self, run_id: &str, reason: DisconnectReason) -> Option<ReconnectPlan> {
        if !reason.is_retryable() {
            self.attempts.remove(run_id);
            return None;
        }
        let attempt = self.attempts.entry(run_id.to_string()).or_insert(0);
        *attempt = attempt.saturating_add(1);
        if self.policy.max_attempts.is_some_and(|max| *attempt > max) {
            return None;
        }
        Some(ReconnectPlan {
            attempt: *attempt,
            delay: self.policy.delay_for(*attempt),
        })
    }

    /// A stream delivered data again; start the backoff over.
    pub fn on_connected(&mut self, run_id: &str) {
        self.attempts.remove(run_id);
    }

    #[must_use]
    pub fn attempts(&self, run_id: &str) -> u32 {
        self.attempts.get(run_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1).as_millis(), 250);
        assert_eq!(policy.delay_for(2).as_millis(), 500);
        assert_eq!(policy.delay_for(3).as_millis(), 1_000);
        assert_eq!(policy.delay_for(7).as_millis(), 8_000);
        assert_eq!(policy.delay_for(40).as_millis(), 8_000);
    }

    #[test]
    fn tracker_resets_after_connect_and_respects_budget() {
        let mut tracker = ReconnectTracker::new(ReconnectPolicy {
            max_attempts: Some(2),
            ..ReconnectPolicy::default()
        });
        let first = tracker.on_disconnect("run_a", DisconnectReason::Network);
        assert_eq!(first.map(|plan| plan.delay.as_millis()), Some(250));
        let second = tracker.on_disconnect("run_a", DisconnectReason::StreamEnded);
        assert_eq!(second.map(|plan| plan.attempt), Some(2));
        assert_eq!(tracker.on_disconnect("run_a", DisconnectReason::Network), None);

        tracker.on_connected("run_a");
        assert_eq!(tracker.attempts("run_a"), 0);
        assert!(tracker.on_disconnect("run_a", DisconnectReason::Network).is_some());
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let mut tracker = ReconnectTracker::default();
        assert_eq!(tracker.on_disconnect("run_a", DisconnectReason::Unauthorized), None);
        assert_eq!(tracker.on_disconnect("run_a", DisconnectReason::NotFound), None);
    }

    #[test]
    fn client_errors_classify_by_status_then_message() {
        let not_found = ConductorClientError::Http {
            status: StatusCode::NOT_FOUND,
            body: "missing".to_string(),
        };
        assert_eq!(
            DisconnectReason::from_client_error(&not_found),
            DisconnectReason::NotFound
        );
        let reset = ConductorClientError::Read {
            message: "connection reset by peer".to_string(),
        };
        assert_eq!(
            DisconnectReason::from_client_error(&reset),
            DisconnectReason::Network
        );
        assert_eq!(
            classify_disconnect_reason("something odd"),
            DisconnectReason::Unknown
        );
    }
}
