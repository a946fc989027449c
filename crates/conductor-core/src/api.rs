use async_trait::async_trait;
use conductor_client::{
    ConductorClient, ConductorClientError, Run, RunLogEvents, StartRunRequest, Stats,
};

/// Remote operations the synchronizer depends on.
///
/// `ConductorClient` is the production implementation; tests substitute an
/// in-memory server.
#[async_trait]
pub trait ConductorApi: Send + Sync + 'static {
    async fn list_runs(&self) -> Result<Vec<Run>, ConductorClientError>;

    async fn create_run(&self, request: &StartRunRequest) -> Result<Run, ConductorClientError>;

    async fn stop_run(&self, run_id: &str) -> Result<(), ConductorClientError>;

    async fn stats(&self) -> Result<Stats, ConductorClientError>;

    async fn open_run_logs(&self, run_id: &str) -> Result<RunLogEvents, ConductorClientError>;
}

#[async_trait]
impl ConductorApi for ConductorClient {
    async fn list_runs(&self) -> Result<Vec<Run>, ConductorClientError> {
        ConductorClient::list_runs(self).await
    }

    async fn create_run(&self, request: &StartRunRequest) -> Result<Run, ConductorClientError> {
        ConductorClient::create_run(self, request).await
    }

    async fn stop_run(&self, run_id: &str) -> Result<(), ConductorClientError> {
        ConductorClient::stop_run(self, run_id).await.map(|_| ())
    }

    async fn stats(&self) -> Result<Stats, ConductorClientError> {
        ConductorClient::stats(self).await
    }

    async fn open_run_logs(&self, run_id: &str) -> Result<RunLogEvents, ConductorClientError> {
        ConductorClient::open_run_logs(self, run_id).await
    }
}
