use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use conductor_client::{
    Budget, ConductorClientError, Run, RunLogEvents, RunStatus, SseEvent, StartRunRequest, Stats,
    StatusCode,
};
use conductor_core::{
    ConductorApi, ConductorError, DisconnectReason, LogStreamState, RunSupervisor, StreamNotice,
    WatchOutcome,
};
use futures::StreamExt;
use serde_json::json;
use tokio::time::timeout;

type Frames = Vec<Result<SseEvent, String>>;

#[derive(Default)]
struct FakeApi {
    runs: Mutex<Vec<Run>>,
    fail_list: AtomicBool,
    fail_create: AtomicBool,
    fail_stop: AtomicBool,
    scripts: Mutex<HashMap<String, (Frames, bool)>>,
    opened: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    created: Mutex<Vec<StartRunRequest>>,
}

impl FakeApi {
    fn set_runs(&self, runs: Vec<Run>) {
        *self.runs.lock().expect("runs lock") = runs;
    }

    /// `hold_open` keeps the stream pending after the scripted frames.
    fn script(&self, run_id: &str, frames: Frames, hold_open: bool) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(run_id.to_string(), (frames, hold_open));
    }

    fn opened(&self) -> Vec<String> {
        self.opened.lock().expect("opened lock").clone()
    }
}

fn request_failed(message: &str) -> ConductorClientError {
    ConductorClientError::Request {
        message: message.to_string(),
    }
}

#[async_trait]
impl ConductorApi for FakeApi {
    async fn list_runs(&self) -> Result<Vec<Run>, ConductorClientError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(request_failed("connection refused"));
        }
        Ok(self.runs.lock().expect("runs lock").clone())
    }

    async fn create_run(&self, request: &StartRunRequest) -> Result<Run, ConductorClientError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ConductorClientError::Http {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                body: "template not installed".to_string(),
            });
        }
        self.created.lock().expect("created lock").push(request.clone());
        let mut created = run("run_new", RunStatus::Running);
        created.template_id = request.template.clone();
        created.budget = request.budget.clone();
        Ok(created)
    }

    async fn stop_run(&self, run_id: &str) -> Result<(), ConductorClientError> {
        self.stopped.lock().expect("stopped lock").push(run_id.to_string());
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(request_failed("timed out"));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Stats, ConductorClientError> {
        Ok(Stats::default())
    }

    async fn open_run_logs(&self, run_id: &str) -> Result<RunLogEvents, ConductorClientError> {
        self.opened.lock().expect("opened lock").push(run_id.to_string());
        let Some((frames, hold_open)) = self.scripts.lock().expect("scripts lock").get(run_id).cloned()
        else {
            return Err(ConductorClientError::Http {
                status: StatusCode::NOT_FOUND,
                body: "unknown run".to_string(),
            });
        };
        let frames = futures::stream::iter(
            frames
                .into_iter()
                .map(|frame| frame.map_err(|message| ConductorClientError::Read { message })),
        );
        if hold_open {
            Ok(frames.chain(futures::stream::pending()).boxed())
        } else {
            Ok(frames.boxed())
        }
    }
}

fn run(id: &str, status: RunStatus) -> Run {
    Run {
        id: id.to_string(),
        template_id: "t1".to_string(),
        template_name: Some("Researcher".to_string()),
        status,
        started_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
        config: json!({}),
        budget: None,
    }
}

fn record(message: &str, cost: Option<f64>) -> Result<SseEvent, String> {
    let mut payload = json!({
        "timestamp": "2026-03-01T10:00:01Z",
        "event": "log",
        "level": "info",
        "message": message,
    });
    if let Some(cost) = cost {
        payload["cost"] = json!(cost);
    }
    Ok(SseEvent::message(payload.to_string()))
}

fn connected() -> Result<SseEvent, String> {
    Ok(SseEvent::message(r#"{"connected":true}"#))
}

fn completed() -> Result<SseEvent, String> {
    Ok(SseEvent::named("completed", "{}"))
}

/// Apply signals until the stream finishes one way or another.
async fn drive_until_settled(supervisor: &mut RunSupervisor<FakeApi>) -> Result<Vec<StreamNotice>> {
    let mut notices = Vec::new();
    loop {
        let signal = timeout(Duration::from_secs(2), supervisor.next_signal())
            .await
            .context("timed out waiting for stream signal")?
            .context("signal channel closed")?;
        if let Some(notice) = supervisor.handle_signal(signal) {
            let settled = matches!(
                notice,
                StreamNotice::Completed { .. } | StreamNotice::ConnectionLost { .. }
            );
            notices.push(notice);
            if settled {
                return Ok(notices);
            }
        }
    }
}

/// Apply whatever is already queued without waiting for more.
async fn drain_pending(supervisor: &mut RunSupervisor<FakeApi>) -> Vec<StreamNotice> {
    let mut notices = Vec::new();
    while let Ok(Some(signal)) = timeout(Duration::from_millis(50), supervisor.next_signal()).await {
        notices.extend(supervisor.handle_signal(signal));
    }
    notices
}

async fn drive_until_connected(supervisor: &mut RunSupervisor<FakeApi>) -> Result<()> {
    loop {
        let signal = timeout(Duration::from_secs(2), supervisor.next_signal())
            .await
            .context("timed out waiting for stream signal")?
            .context("signal channel closed")?;
        match supervisor.handle_signal(signal) {
            Some(StreamNotice::Connected { .. }) => return Ok(()),
            Some(other) => bail!("unexpected notice before connect: {other:?}"),
            None => {}
        }
    }
}

#[tokio::test]
async fn started_run_streams_visible_records_until_completed() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.script(
        "run_new",
        vec![
            connected(),
            record("step1", Some(0.01)),
            record("step2", None),
            completed(),
            record("after completion", Some(1.0)),
        ],
        false,
    );
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));

    let request = StartRunRequest::new("t1", json!({})).with_budget(Some(Budget {
        max_usd: Some(5.0),
        max_tokens: None,
    }));
    let started = supervisor.start(request).await?;
    assert_eq!(started.id, "run_new");
    assert_eq!(supervisor.run("run_new")?.status, RunStatus::Running);
    assert_eq!(
        api.created.lock().expect("created lock")[0].budget,
        Some(Budget {
            max_usd: Some(5.0),
            max_tokens: None
        })
    );

    assert_eq!(supervisor.watch("run_new"), WatchOutcome::Opened);
    let notices = drive_until_settled(&mut supervisor).await?;
    assert_eq!(
        notices,
        vec![
            StreamNotice::Connected {
                run_id: "run_new".to_string()
            },
            StreamNotice::Appended {
                run_id: "run_new".to_string(),
                index: 0
            },
            StreamNotice::Appended {
                run_id: "run_new".to_string(),
                index: 1
            },
            StreamNotice::Completed {
                run_id: "run_new".to_string()
            },
        ]
    );
    assert!(drain_pending(&mut supervisor).await.is_empty());

    let logs = supervisor.logs("run_new").context("logs for run")?;
    assert_eq!(logs.records.len(), 2);
    assert_eq!(logs.records[0].message, "step1");
    assert_eq!(logs.records[1].message, "step2");
    assert!((logs.cumulative_cost - 0.01).abs() < 1e-9);
    assert_eq!(supervisor.stream_state("run_new"), Some(LogStreamState::Closed));
    Ok(())
}

#[tokio::test]
async fn stop_closes_stream_and_rewatch_opens_nothing() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running)]);
    api.script("run_a", vec![connected(), record("working", None)], true);
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);

    assert_eq!(supervisor.watch("run_a"), WatchOutcome::Opened);
    drive_until_connected(&mut supervisor).await?;
    assert_eq!(supervisor.watch("run_a"), WatchOutcome::AlreadyWatching);

    supervisor.stop("run_a").await?;
    assert_eq!(supervisor.run("run_a")?.status, RunStatus::Stopped);
    assert_eq!(supervisor.stream_state("run_a"), Some(LogStreamState::Closed));
    assert!(drain_pending(&mut supervisor).await.is_empty());
    assert!(supervisor.logs("run_a").is_some_and(|logs| logs.records.is_empty()));

    assert_eq!(
        supervisor.watch("run_a"),
        WatchOutcome::RunTerminal(RunStatus::Stopped)
    );
    assert_eq!(api.opened(), vec!["run_a".to_string()]);
    assert_eq!(
        *api.stopped.lock().expect("stopped lock"),
        vec!["run_a".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn failed_refresh_leaves_registry_unchanged() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running), run("run_b", RunStatus::Completed)]);
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);
    let before = supervisor.runs().to_vec();

    api.fail_list.store(true, Ordering::SeqCst);
    assert!(!supervisor.refresh().await);

    assert_eq!(supervisor.runs(), before.as_slice());
    assert_eq!(
        supervisor.registry().last_refresh_error(),
        Some("connection refused")
    );
    Ok(())
}

#[tokio::test]
async fn stale_poll_after_stop_keeps_run_stopped() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running)]);
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);

    supervisor.stop("run_a").await?;
    // The server has not caught up yet.
    assert!(supervisor.refresh().await);
    assert_eq!(supervisor.run("run_a")?.status, RunStatus::Stopped);

    api.set_runs(vec![run("run_a", RunStatus::Stopped)]);
    assert!(supervisor.refresh().await);
    assert!(!supervisor.registry().has_pending_stop("run_a"));
    Ok(())
}

#[tokio::test]
async fn stop_failure_is_reported_but_local_stop_stands() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running)]);
    api.fail_stop.store(true, Ordering::SeqCst);
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);

    let error = supervisor
        .stop("run_a")
        .await
        .err()
        .context("expected stop failure")?;
    assert_eq!(
        error,
        ConductorError::StopFailed {
            run_id: "run_a".to_string(),
            message: "timed out".to_string(),
        }
    );
    assert_eq!(supervisor.run("run_a")?.status, RunStatus::Stopped);
    Ok(())
}

#[tokio::test]
async fn rejected_start_leaves_registry_unchanged() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.fail_create.store(true, Ordering::SeqCst);
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));

    let error = supervisor
        .start(StartRunRequest::new("missing", json!({})))
        .await
        .err()
        .context("expected start failure")?;
    let (template_id, message) = match error {
        ConductorError::StartFailed {
            template_id,
            message,
        } => (template_id, message),
        other => bail!("unexpected error: {other:?}"),
    };
    assert_eq!(template_id, "missing");
    assert!(message.contains("template not installed"));
    assert!(supervisor.runs().is_empty());
    Ok(())
}

#[tokio::test]
async fn transport_error_does_not_reconnect_until_rewatched() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running)]);
    api.script(
        "run_a",
        vec![connected(), record("before drop", None), Err("connection reset by peer".to_string())],
        false,
    );
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);

    assert_eq!(supervisor.watch("run_a"), WatchOutcome::Opened);
    let notices = drive_until_settled(&mut supervisor).await?;
    let Some(StreamNotice::ConnectionLost { reason, error, .. }) = notices.last() else {
        bail!("expected connection loss, got {notices:?}");
    };
    assert_eq!(*reason, DisconnectReason::Network);
    assert!(matches!(error, ConductorError::Transport { .. }));
    assert_eq!(supervisor.stream_state("run_a"), Some(LogStreamState::Errored));
    assert_eq!(supervisor.logs("run_a").map(|logs| logs.records.len()), Some(1));

    drain_pending(&mut supervisor).await;
    assert_eq!(api.opened().len(), 1);

    assert_eq!(supervisor.watch("run_a"), WatchOutcome::Opened);
    assert_eq!(supervisor.logs("run_a").map(|logs| logs.records.len()), Some(0));
    drive_until_settled(&mut supervisor).await?;
    assert_eq!(api.opened().len(), 2);
    Ok(())
}

#[tokio::test]
async fn malformed_frames_are_skipped_without_closing_the_stream() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running)]);
    api.script(
        "run_a",
        vec![
            connected(),
            Ok(SseEvent::message("{not json")),
            Ok(SseEvent::message(r#"{"level":"info"}"#)),
            record("still here", None),
            completed(),
        ],
        false,
    );
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);

    supervisor.watch("run_a");
    let notices = drive_until_settled(&mut supervisor).await?;
    assert!(matches!(notices.last(), Some(StreamNotice::Completed { .. })));

    let logs = supervisor.logs("run_a").context("logs")?;
    assert_eq!(logs.records.len(), 1);
    assert_eq!(logs.records[0].message, "still here");
    let stream = supervisor.stream_snapshot("run_a").context("stream snapshot")?;
    assert_eq!(stream.frames_dropped, 2);
    Ok(())
}

#[tokio::test]
async fn stream_ending_without_completion_is_a_connection_loss() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running)]);
    api.script("run_a", vec![connected(), record("partial", None)], false);
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);

    supervisor.watch("run_a");
    let notices = drive_until_settled(&mut supervisor).await?;
    assert!(matches!(
        notices.last(),
        Some(StreamNotice::ConnectionLost {
            reason: DisconnectReason::StreamEnded,
            ..
        })
    ));
    assert_eq!(supervisor.stream_state("run_a"), Some(LogStreamState::Errored));
    Ok(())
}

#[tokio::test]
async fn unwatch_is_idempotent_and_discards_logs() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running)]);
    api.script("run_a", vec![connected(), record("one", None)], true);
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);

    supervisor.watch("run_a");
    drive_until_connected(&mut supervisor).await?;

    assert!(supervisor.unwatch("run_a"));
    assert!(!supervisor.unwatch("run_a"));
    assert_eq!(supervisor.stream_state("run_a"), None);
    assert!(!supervisor.is_watching("run_a"));
    assert!(supervisor.logs("run_a").is_none());
    assert!(drain_pending(&mut supervisor).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn terminal_poll_closes_live_stream() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.set_runs(vec![run("run_a", RunStatus::Running)]);
    api.script("run_a", vec![connected()], true);
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));
    assert!(supervisor.refresh().await);

    supervisor.watch("run_a");
    drive_until_connected(&mut supervisor).await?;
    assert!(supervisor.is_watching("run_a"));

    api.set_runs(vec![run("run_a", RunStatus::Failed)]);
    assert!(supervisor.refresh().await);
    assert!(!supervisor.is_watching("run_a"));
    assert_eq!(supervisor.stream_state("run_a"), Some(LogStreamState::Closed));
    Ok(())
}

#[tokio::test]
async fn unknown_run_stream_reports_not_found() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    let mut supervisor = RunSupervisor::new(Arc::clone(&api));

    assert!(matches!(
        supervisor.run("ghost"),
        Err(ConductorError::NotFound { .. })
    ));
    assert_eq!(supervisor.watch("ghost"), WatchOutcome::Opened);
    let notices = drive_until_settled(&mut supervisor).await?;
    assert!(matches!(
        notices.last(),
        Some(StreamNotice::ConnectionLost {
            reason: DisconnectReason::NotFound,
            ..
        })
    ));
    Ok(())
}
