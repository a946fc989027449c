use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use conductor_client::{Budget, StartRunRequest};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Start, stop and follow agent runs on a local conductor server")]
pub struct ConductorCli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
pub struct GlobalArgs {
    /// Control API base URL (overrides CONDUCTOR_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,
    /// Session token sent with every request (overrides CONDUCTOR_SESSION_TOKEN)
    #[arg(long, global = true)]
    pub token: Option<String>,
    /// Per-request timeout in milliseconds (overrides CONDUCTOR_REQUEST_TIMEOUT_MS)
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List runs
    Runs {
        /// Keep polling and report status changes
        #[arg(long)]
        follow: bool,
    },
    /// Start a run from an installed template
    Start(StartArgs),
    /// Stop a running run
    Stop { run_id: String },
    /// Follow a run's live log stream
    Logs(LogsArgs),
    /// Show dashboard totals
    Stats {
        /// Keep polling on the stats interval
        #[arg(long)]
        follow: bool,
    },
    /// Check that the server is reachable
    Health,
    /// List installed templates, or show one
    Templates { template_id: Option<String> },
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[arg(long)]
    pub template: String,
    /// Run configuration as inline JSON
    #[arg(long, conflicts_with = "config_file")]
    pub config: Option<String>,
    /// Read run configuration JSON from a file
    #[arg(long)]
    pub config_file: Option<PathBuf>,
    #[arg(long)]
    pub max_usd: Option<f64>,
    #[arg(long)]
    pub max_tokens: Option<u64>,
    #[arg(long)]
    pub secrets_ref: Option<String>,
    #[arg(long)]
    pub schedule: Option<String>,
    /// Follow the new run's logs
    #[arg(long)]
    pub follow: bool,
}

impl StartArgs {
    pub fn to_request(&self) -> Result<StartRunRequest> {
        let config = match (&self.config, &self.config_file) {
            (Some(inline), _) => {
                serde_json::from_str::<Value>(inline).context("parse --config as JSON")?
            }
            (None, Some(path)) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                serde_json::from_str::<Value>(&raw)
                    .with_context(|| format!("parse config file {}", path.display()))?
            }
            (None, None) => Value::Object(serde_json::Map::new()),
        };

        Ok(StartRunRequest {
            secrets_ref: non_empty(self.secrets_ref.as_deref()),
            schedule: non_empty(self.schedule.as_deref()),
            ..StartRunRequest::new(self.template.trim(), config)
        }
        .with_budget(Some(Budget {
            max_usd: self.max_usd,
            max_tokens: self.max_tokens,
        })))
    }
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    pub run_id: String,
    /// Reconnect with backoff when the stream drops
    #[arg(long)]
    pub reconnect: bool,
    /// Write the collected log as text when following ends
    #[arg(long)]
    pub output: Option<PathBuf>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
