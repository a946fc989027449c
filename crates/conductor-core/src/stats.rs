use chrono::{DateTime, Utc};
use conductor_client::{ConductorClientError, Stats};

use crate::api::ConductorApi;

/// Last dashboard summary received from the server.
///
/// A failed fetch keeps the previous value and records the error.
#[derive(Debug, Clone, Default)]
pub struct StatsCache {
    stats: Option<Stats>,
    fetched_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl StatsCache {
    #[must_use]
    pub fn get(&self) -> Option<&Stats> {
        self.stats.as_ref()
    }

    #[must_use]
    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn apply(&mut self, result: Result<Stats, ConductorClientError>) -> bool {
        match result {
            Ok(stats) => {
                self.stats = Some(stats);
                self.fetched_at = Some(Utc::now());
                self.last_error = None;
                true
            }
            Err(error) => {
                tracing::warn!(error = %error, "stats refresh failed; keeping previous stats");
                self.last_error = Some(error.reason());
                false
            }
        }
    }

    pub async fn refresh<A>(&mut self, api: &A) -> bool
    where
        A: ConductorApi + ?Sized,
    {
        let result = api.stats().await;
        self.apply(result)
    }
}
