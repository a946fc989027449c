#![allow(clippy::print_stdout)]

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use conductor_client::{ConductorClient, ConductorClientError, Run};
use conductor_core::{
    ConductorApi, ConductorError, LogAccumulator, ReconnectPolicy, ReconnectTracker,
    ResourceKind, RunSupervisor, StreamNotice, WatchOutcome, format_log_line,
};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior, Sleep};

use crate::cli::{Commands, ConductorCli, LogsArgs, StartArgs};
use crate::config::Config;
use crate::render;

pub async fn run(cli: ConductorCli) -> Result<()> {
    let config = Config::from_env()
        .context("load configuration")?
        .with_overrides(&cli.global);
    let client = ConductorClient::new(config.client_config()).context("build conductor client")?;
    tracing::debug!(base_url = %client.base_url(), "conductor client ready");

    match cli.command {
        Commands::Runs { follow } => runs(client, &config, follow).await,
        Commands::Start(args) => start(client, &config, args).await,
        Commands::Stop { run_id } => stop(client, run_id.trim()).await,
        Commands::Logs(args) => logs(client, &config, args).await,
        Commands::Stats { follow } => stats(client, &config, follow).await,
        Commands::Health => health(&client).await,
        Commands::Templates { template_id } => templates(&client, template_id.as_deref()).await,
    }
}

fn poll_interval(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn refresh_or_fail<A>(supervisor: &mut RunSupervisor<A>) -> Result<()>
where
    A: ConductorApi,
{
    if supervisor.refresh().await {
        return Ok(());
    }
    let reason = supervisor
        .registry()
        .last_refresh_error()
        .unwrap_or("unknown error")
        .to_string();
    bail!("failed to list runs: {reason}")
}

fn print_runs(runs: &[Run]) {
    if runs.is_empty() {
        println!("no runs");
        return;
    }
    for run in runs {
        println!("{}", render::run_line(run));
    }
}

async fn runs(client: ConductorClient, config: &Config, follow: bool) -> Result<()> {
    let mut supervisor = RunSupervisor::new(Arc::new(client));
    refresh_or_fail(&mut supervisor).await?;
    print_runs(supervisor.runs());
    if !follow {
        return Ok(());
    }

    let mut ticker = poll_interval(config.runs_poll_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let before = render::status_map(supervisor.runs());
                if supervisor.refresh().await {
                    for line in render::status_changes(&before, supervisor.runs()) {
                        println!("{line}");
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("listen for ctrl-c")?;
                return Ok(());
            }
        }
    }
}

async fn start(client: ConductorClient, config: &Config, args: StartArgs) -> Result<()> {
    let request = args.to_request()?;
    let mut supervisor = RunSupervisor::new(Arc::new(client));
    let run = supervisor.start(request).await?;
    println!("{}", render::run_line(&run));

    if args.follow {
        follow_logs(&mut supervisor, config, &run.id, &FollowOptions::default()).await?;
    }
    Ok(())
}

async fn stop(client: ConductorClient, run_id: &str) -> Result<()> {
    let mut supervisor = RunSupervisor::new(Arc::new(client));
    if !supervisor.refresh().await {
        tracing::warn!(run_id = %run_id, "run list unavailable; sending stop anyway");
    } else if let Err(error) = supervisor.run(run_id) {
        tracing::warn!(error = %error, "stopping a run missing from the run list");
    }

    supervisor.stop(run_id).await?;
    println!("{run_id}: stopped");
    Ok(())
}

async fn logs(client: ConductorClient, config: &Config, args: LogsArgs) -> Result<()> {
    let mut supervisor = RunSupervisor::new(Arc::new(client));
    if !supervisor.refresh().await {
        tracing::warn!(run_id = %args.run_id, "run list unavailable; watching without status");
    }
    let options = FollowOptions {
        reconnect: args.reconnect,
        output: args.output,
    };
    follow_logs(&mut supervisor, config, args.run_id.trim(), &options).await
}

#[derive(Debug, Default)]
struct FollowOptions {
    reconnect: bool,
    output: Option<PathBuf>,
}

/// Watch a run until its stream completes, fails, or the user interrupts.
///
/// The stream is always unwatched on the way out; the log is exported first
/// when an output path was given.
async fn follow_logs<A>(
    supervisor: &mut RunSupervisor<A>,
    config: &Config,
    run_id: &str,
    options: &FollowOptions,
) -> Result<()>
where
    A: ConductorApi,
{
    if let WatchOutcome::RunTerminal(status) = supervisor.watch(run_id) {
        println!("{run_id} is {status}; no live logs");
        return Ok(());
    }

    let outcome = stream_until_done(supervisor, config, run_id, options.reconnect).await;
    let text = options.output.as_ref().map(|_| {
        supervisor
            .accumulator(run_id)
            .map(LogAccumulator::render_text)
            .unwrap_or_default()
    });
    supervisor.unwatch(run_id);

    if let (Some(path), Some(text)) = (&options.output, text) {
        export_logs(path, &text).await?;
        println!("logs written to {}", path.display());
    }
    outcome
}

async fn export_logs(path: &Path, text: &str) -> Result<()> {
    tokio::fs::write(path, text)
        .await
        .with_context(|| format!("write logs to {}", path.display()))
}

async fn stream_until_done<A>(
    supervisor: &mut RunSupervisor<A>,
    config: &Config,
    run_id: &str,
    reconnect: bool,
) -> Result<()>
where
    A: ConductorApi,
{
    let mut tracker = ReconnectTracker::new(ReconnectPolicy::default());
    let (refresh_tx, mut refresh_rx) =
        mpsc::channel::<Result<Vec<Run>, ConductorClientError>>(1);
    let mut refresh_in_flight = false;
    let mut poll = poll_interval(config.runs_poll_interval);
    poll.tick().await;
    let mut retry: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            signal = supervisor.next_signal() => {
                let Some(signal) = signal else {
                    bail!("log stream channel closed");
                };
                match supervisor.handle_signal(signal) {
                    Some(StreamNotice::Connected { .. }) => {
                        tracker.on_connected(run_id);
                        tracing::info!(run_id = %run_id, "following logs");
                    }
                    Some(StreamNotice::Appended { run_id: id, index }) => {
                        if let Some(record) = supervisor
                            .logs(&id)
                            .and_then(|logs| logs.records.get(index))
                        {
                            println!("{}", format_log_line(record));
                        }
                    }
                    Some(StreamNotice::Completed { run_id: id }) => {
                        if let Some(logs) = supervisor.logs(&id) {
                            println!("{}", render::log_summary(&id, &logs));
                        }
                        return Ok(());
                    }
                    Some(StreamNotice::ConnectionLost { reason, error, .. }) => {
                        let plan = if reconnect {
                            tracker.on_disconnect(run_id, reason)
                        } else {
                            None
                        };
                        let Some(plan) = plan else {
                            bail!("log stream for {run_id} lost ({reason}): {error}");
                        };
                        tracing::warn!(
                            run_id = %run_id,
                            reason = %reason,
                            attempt = plan.attempt,
                            delay = ?plan.delay,
                            "log stream lost; reconnecting"
                        );
                        retry = Some(Box::pin(tokio::time::sleep(plan.delay)));
                    }
                    None => {}
                }
            }
            _ = poll.tick(), if !refresh_in_flight => {
                refresh_in_flight = true;
                let api = Arc::clone(supervisor.api());
                let tx = refresh_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(api.list_runs().await).await;
                });
            }
            Some(result) = refresh_rx.recv() => {
                refresh_in_flight = false;
                supervisor.apply_refresh(result);
                if retry.is_none() && !supervisor.is_watching(run_id) {
                    if let Some(status) = supervisor
                        .registry()
                        .get(run_id)
                        .map(|run| run.status)
                        .filter(|status| status.is_terminal())
                    {
                        println!("{run_id} finished with status {status}");
                        return Ok(());
                    }
                }
            }
            () = async {
                if let Some(delay) = retry.as_mut() {
                    delay.await;
                }
            }, if retry.is_some() => {
                retry = None;
                if let WatchOutcome::RunTerminal(status) = supervisor.watch(run_id) {
                    println!("{run_id} is {status}; not reconnecting");
                    return Ok(());
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("listen for ctrl-c")?;
                tracing::info!(run_id = %run_id, "interrupted; closing log stream");
                return Ok(());
            }
        }
    }
}

async fn stats(client: ConductorClient, config: &Config, follow: bool) -> Result<()> {
    let mut supervisor = RunSupervisor::new(Arc::new(client));
    if !supervisor.refresh_stats().await {
        let reason = supervisor
            .stats()
            .last_error()
            .unwrap_or("unknown error")
            .to_string();
        bail!("failed to fetch stats: {reason}");
    }
    print_stats(&supervisor);
    if !follow {
        return Ok(());
    }

    let mut ticker = poll_interval(config.stats_poll_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if supervisor.refresh_stats().await {
                    println!();
                    print_stats(&supervisor);
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("listen for ctrl-c")?;
                return Ok(());
            }
        }
    }
}

fn print_stats<A>(supervisor: &RunSupervisor<A>)
where
    A: ConductorApi,
{
    if let Some(stats) = supervisor.stats().get() {
        for line in render::stats_lines(stats) {
            println!("{line}");
        }
    }
}

async fn health(client: &ConductorClient) -> Result<()> {
    let body = client
        .health()
        .await
        .with_context(|| format!("conductor at {} is unreachable", client.base_url()))?;
    println!("{}: {body}", client.base_url());
    Ok(())
}

async fn templates(client: &ConductorClient, template_id: Option<&str>) -> Result<()> {
    let Some(template_id) = template_id.map(str::trim) else {
        let templates = client.list_templates().await.context("list templates")?;
        if templates.is_empty() {
            println!("no templates installed");
        }
        for template in &templates {
            println!("{}", render::template_line(template));
        }
        return Ok(());
    };

    let Some(template) = client
        .get_template(template_id)
        .await
        .context("fetch template")?
    else {
        return Err(ConductorError::NotFound {
            kind: ResourceKind::Template,
            id: template_id.to_string(),
        }
        .into());
    };
    println!("{}", render::template_line(&template));
    if !template.description.trim().is_empty() {
        println!("  {}", template.description.trim());
    }
    if !template.author.trim().is_empty() {
        println!("  author: {}", template.author.trim());
    }
    if !template.tags.is_empty() {
        println!("  tags: {}", template.tags.join(", "));
    }
    Ok(())
}
