use conductor_client::ConductorClientError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Run,
    Template,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Template => "template",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures surfaced by run-state synchronization and log streaming.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConductorError {
    #[error("transport failure: {message}")]
    Transport { message: String },
    #[error("malformed stream payload: {message}")]
    Decode { message: String },
    #[error("failed to start run from template {template_id}: {message}")]
    StartFailed { template_id: String, message: String },
    #[error("failed to stop run {run_id}: {message}")]
    StopFailed { run_id: String, message: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },
}

impl ConductorError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn run_not_found(run_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ResourceKind::Run,
            id: run_id.into(),
        }
    }
}

impl From<ConductorClientError> for ConductorError {
    fn from(error: ConductorClientError) -> Self {
        match error {
            ConductorClientError::Decode { message } => Self::Decode { message },
            other => Self::Transport {
                message: other.reason(),
            },
        }
    }
}
