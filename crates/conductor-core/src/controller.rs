use std::sync::Arc;

use conductor_client::{Run, StartRunRequest};

use crate::api::ConductorApi;
use crate::error::ConductorError;
use crate::registry::RunRegistry;
use crate::streams::LogStreams;

/// Start and stop commands issued by the user.
#[derive(Debug)]
pub struct RunController<A> {
    api: Arc<A>,
}

impl<A> RunController<A>
where
    A: ConductorApi,
{
    #[must_use]
    pub fn new(api: Arc<A>) -> Self {
        Self { api }
    }

    /// Create a run. The registry only changes once the server has accepted it.
    pub async fn start(
        &self,
        registry: &mut RunRegistry,
        request: StartRunRequest,
    ) -> Result<Run, ConductorError> {
        match self.api.create_run(&request).await {
            Ok(run) => {
                tracing::info!(
                    run_id = %run.id,
                    template_id = %request.template,
                    "run started"
                );
                registry.apply_start(run.clone());
                Ok(run)
            }
            Err(error) => {
                tracing::warn!(
                    template_id = %request.template,
                    error = %error,
                    "run start rejected"
                );
                Err(ConductorError::StartFailed {
                    template_id: request.template,
                    message: error.reason(),
                })
            }
        }
    }

    /// Stop a run.
    ///
    /// The run is marked stopped and its log stream closed before the server
    /// answers; a failed request is still reported but does not undo either.
    pub async fn stop(
        &self,
        registry: &mut RunRegistry,
        streams: &mut LogStreams,
        run_id: &str,
    ) -> Result<(), ConductorError> {
        let marked = registry.apply_stop(run_id);
        let closed = streams.close(run_id);
        tracing::debug!(run_id = %run_id, marked, closed, "run stop applied locally");

        match self.api.stop_run(run_id).await {
            Ok(()) => {
                tracing::info!(run_id = %run_id, "run stopped");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(run_id = %run_id, error = %error, "run stop request failed");
                Err(ConductorError::StopFailed {
                    run_id: run_id.to_string(),
                    message: error.reason(),
                })
            }
        }
    }
}
