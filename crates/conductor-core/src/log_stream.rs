//! Per-run log stream lifecycle and frame classification.
//!
//! ```text
//! idle -> connecting -> open -> closing -> closed
//!             |          |
//!             +----------+--> errored
//! ```
//!
//! Any state moves to `closed` on an explicit close. Records are accepted
//! only while `open`, so frames that race a close are dropped.

use chrono::{DateTime, Utc};
use conductor_client::{LogRecord, SseEvent};
use serde_json::Value;

use crate::error::ConductorError;

pub const CONNECTED_EVENT: &str = "connected";
pub const COMPLETED_EVENT: &str = "completed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStreamState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl LogStreamState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }

    /// A live stream owns a transport.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl std::fmt::Display for LogStreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleMarker {
    Connected,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogFrame {
    Record(LogRecord),
    Marker(LifecycleMarker),
}

/// Classify one event-stream frame.
///
/// Lifecycle markers are recognised before the strict record decode so that
/// `{"connected":true}` and completion payloads never reach the log.
pub fn decode_frame(frame: &SseEvent) -> Result<LogFrame, ConductorError> {
    match frame.event.as_str() {
        COMPLETED_EVENT => return Ok(LogFrame::Marker(LifecycleMarker::Completed)),
        CONNECTED_EVENT => return Ok(LogFrame::Marker(LifecycleMarker::Connected)),
        _ => {}
    }

    let data = frame.data.trim();
    if data.is_empty() {
        return Err(ConductorError::Decode {
            message: "empty payload".to_string(),
        });
    }
    let value: Value = serde_json::from_str(data).map_err(|error| ConductorError::Decode {
        message: error.to_string(),
    })?;
    if !value.is_object() {
        return Err(ConductorError::Decode {
            message: "payload is not an object".to_string(),
        });
    }
    if value.get("connected").and_then(Value::as_bool) == Some(true) {
        return Ok(LogFrame::Marker(LifecycleMarker::Connected));
    }
    match value.get("event").and_then(Value::as_str) {
        Some(CONNECTED_EVENT) => return Ok(LogFrame::Marker(LifecycleMarker::Connected)),
        Some(COMPLETED_EVENT) => return Ok(LogFrame::Marker(LifecycleMarker::Completed)),
        _ => {}
    }

    serde_json::from_value::<LogRecord>(value)
        .map(LogFrame::Record)
        .map_err(|error| ConductorError::Decode {
            message: error.to_string(),
        })
}

/// What the owner should do with a frame after the state machine saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    Append(LogRecord),
    Marker(LifecycleMarker),
    /// The server signalled completion; the transport can be released.
    Completed,
    Dropped(ConductorError),
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogStreamSnapshot {
    pub run_id: String,
    pub state: LogStreamState,
    pub records_delivered: u64,
    pub frames_dropped: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogStream {
    run_id: String,
    state: LogStreamState,
    records_delivered: u64,
    frames_dropped: u64,
    opened_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl LogStream {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: LogStreamState::Idle,
            records_delivered: 0,
            frames_dropped: 0,
            opened_at: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    #[must_use]
    pub fn state(&self) -> LogStreamState {
        self.state
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub fn snapshot(&self) -> LogStreamSnapshot {
        LogStreamSnapshot {
            run_id: self.run_id.clone(),
            state: self.state,
            records_delivered: self.records_delivered,
            frames_dropped: self.frames_dropped,
            opened_at: self.opened_at,
            last_error: self.last_error.clone(),
        }
    }

    pub fn begin_connect(&mut self) -> bool {
        if self.state != LogStreamState::Idle {
            return false;
        }
        self.state = LogStreamState::Connecting;
        tracing::debug!(run_id = %self.run_id, "log stream connecting");
        true
    }

    /// The transport acknowledged the subscription.
    pub fn on_open(&mut self) -> StreamStep {
        if self.state != LogStreamState::Connecting {
            return StreamStep::Ignored;
        }
        self.state = LogStreamState::Open;
        self.opened_at = Some(Utc::now());
        tracing::info!(run_id = %self.run_id, "log stream open");
        StreamStep::Marker(LifecycleMarker::Connected)
    }

    pub fn on_frame(&mut self, frame: &SseEvent) -> StreamStep {
        if self.state != LogStreamState::Open {
            return StreamStep::Ignored;
        }
        match decode_frame(frame) {
            Ok(LogFrame::Record(record)) => {
                self.records_delivered = self.records_delivered.saturating_add(1);
                StreamStep::Append(record)
            }
            Ok(LogFrame::Marker(LifecycleMarker::Connected)) => {
                StreamStep::Marker(LifecycleMarker::Connected)
            }
            Ok(LogFrame::Marker(LifecycleMarker::Completed)) => {
                self.state = LogStreamState::Closing;
                tracing::info!(
                    run_id = %self.run_id,
                    records = self.records_delivered,
                    "log stream completed"
                );
                StreamStep::Completed
            }
            Err(error) => {
                self.frames_dropped = self.frames_dropped.saturating_add(1);
                tracing::warn!(
                    run_id = %self.run_id,
                    error = %error,
                    "dropping malformed log frame"
                );
                StreamStep::Dropped(error)
            }
        }
    }

    /// Returns whether the failure was accepted; late failures after a close
    /// or completion are ignored.
    pub fn on_transport_error(&mut self, message: impl Into<String>) -> bool {
        if !self.state.is_live() {
            return false;
        }
        let message = message.into();
        tracing::warn!(run_id = %self.run_id, error = %message, "log stream failed");
        self.state = LogStreamState::Errored;
        self.last_error = Some(message);
        true
    }

    /// Transport released after completion.
    pub fn finish_closing(&mut self) {
        if self.state == LogStreamState::Closing {
            self.state = LogStreamState::Closed;
        }
    }

    /// Close from any state. Closing a closed stream is a no-op.
    pub fn close(&mut self) -> bool {
        if self.state == LogStreamState::Closed {
            return false;
        }
        tracing::debug!(run_id = %self.run_id, from = %self.state, "log stream closed");
        self.state = LogStreamState::Closed;
        true
    }
}
