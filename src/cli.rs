use crate::api::{HttpRunsClient, RunsApi};
use crate::config::{self, ConfigOverrides};
use crate::model::{ControllerEvent, ManualCheckOutcome};
use crate::orchestrator::{self, RunLifecycleHandle, SessionSnapshot};
use crate::safety;
use crate::text_summary;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

/// A failure whose details the command has already printed, so only the
/// exit status is left to report.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ReportedFailure(String);

/// The single JSON error document for `--json` mode, unless the command
/// already printed its own structured output.
pub fn json_error_document(err: &anyhow::Error) -> Option<String> {
    if err.downcast_ref::<ReportedFailure>().is_some() {
        return None;
    }
    Some(serde_json::json!({ "error": format!("{err:#}") }).to_string())
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "scholar-runs",
    version,
    about = "Start, watch and throttle scholar-tracker scrape runs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Base URL of the scholar tracker
    #[arg(long, global = true, env = "SCHOLAR_RUNS_BASE_URL")]
    pub base_url: Option<String>,

    /// Raw Cookie header carrying an authenticated session
    #[arg(long, global = true, env = "SCHOLAR_RUNS_COOKIE", hide_env_values = true)]
    pub cookie: Option<String>,

    /// Path to a JSON config file (defaults to <config dir>/scholar-runs/config.json)
    #[arg(long, global = true)]
    pub config: Option<std::path::PathBuf>,

    /// How often to poll the latest run while one is active
    #[arg(long, global = true)]
    pub poll_interval: Option<humantime::Duration>,

    /// How long a submission may stay unresolved before it is shown as starting
    #[arg(long, global = true)]
    pub starting_phase: Option<humantime::Duration>,

    /// HTTP request timeout
    #[arg(long, global = true)]
    pub timeout: Option<humantime::Duration>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Show the latest run and the safety cooldown state
    Status,
    /// Start a manual check
    Start {
        /// Follow the run until it finishes. Use --wait false to return right away
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        wait: bool,
    },
    /// Follow the active run until it finishes
    Watch,
    /// List recent runs
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config.clone(),
            base_url: self.base_url.clone(),
            cookie: self.cookie.clone(),
            timeout: self.timeout.as_deref().copied(),
            poll_interval: self.poll_interval.as_deref().copied(),
            starting_phase: self.starting_phase.as_deref().copied(),
        }
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let settings = config::resolve(&args.overrides())?;
    let client = Arc::new(HttpRunsClient::new(&settings.client)?);
    let (out_tx, out_handle) = spawn_output_writer();

    let res = match args.command {
        Command::Runs { limit } => list_runs(&args, client.as_ref(), limit, &out_tx).await,
        Command::Status | Command::Start { .. } | Command::Watch => {
            let (evt_tx, evt_rx) = mpsc::unbounded_channel::<ControllerEvent>();
            let (handle, task) =
                orchestrator::spawn_controller(client, settings.controller, evt_tx);
            let res = match args.command {
                Command::Start { wait } => run_start(&args, &handle, evt_rx, wait, &out_tx).await,
                Command::Watch => run_watch(&args, &handle, evt_rx, &out_tx).await,
                _ => {
                    // Status never follows, so nobody reads controller events.
                    drop(evt_rx);
                    run_status(&args, &handle, &out_tx).await
                }
            };
            handle.reset().await;
            drop(handle);
            let _ = task.await;
            res
        }
    };

    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn list_runs(
    args: &Cli,
    client: &HttpRunsClient,
    limit: usize,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let listing = client.list_runs(limit).await.context("failed to list runs")?;
    let safety = safety::normalize(&listing.safety_state);

    if args.json {
        let out = serde_json::to_string_pretty(&serde_json::json!({
            "runs": listing.runs,
            "safety_state": safety,
        }))?;
        let _ = out_tx.send(OutputLine::Stdout(out));
        return Ok(());
    }

    if listing.runs.is_empty() {
        let _ = out_tx.send(OutputLine::Stdout("No runs yet.".into()));
    }
    for run in &listing.runs {
        let _ = out_tx.send(OutputLine::Stdout(text_summary::run_line(run)));
    }
    let remaining = safety.remaining_seconds_at(OffsetDateTime::now_utc());
    for line in text_summary::safety_lines(&safety, remaining) {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    Ok(())
}

async fn run_status(
    args: &Cli,
    handle: &RunLifecycleHandle,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    handle.bootstrap().await;
    let snap = handle.snapshot();
    print_snapshot(args, &snap, out_tx)?;
    snapshot_result(&snap)
}

async fn run_start(
    args: &Cli,
    handle: &RunLifecycleHandle,
    mut evt_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    wait: bool,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    let outcome = handle.start_manual_check().await;
    if args.json {
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&outcome)?));
    } else {
        let _ = out_tx.send(OutputLine::Stderr(text_summary::outcome_line(&outcome)));
    }

    if let ManualCheckOutcome::Error { message, .. } = &outcome {
        if !args.json {
            drain_events(&mut evt_rx, out_tx);
            print_snapshot(args, &handle.snapshot(), out_tx)?;
        }
        return Err(ReportedFailure(format!("manual check failed: {message}")).into());
    }

    if wait {
        follow(args, handle, &mut evt_rx, out_tx).await;
        if !args.json {
            print_snapshot(args, &handle.snapshot(), out_tx)?;
        }
    }
    Ok(())
}

async fn run_watch(
    args: &Cli,
    handle: &RunLifecycleHandle,
    mut evt_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    handle.bootstrap().await;
    follow(args, handle, &mut evt_rx, out_tx).await;
    let snap = handle.snapshot();
    print_snapshot(args, &snap, out_tx)?;
    snapshot_result(&snap)
}

/// Print controller events until polling stops or the user hits Ctrl-C.
async fn follow(
    args: &Cli,
    handle: &RunLifecycleHandle,
    evt_rx: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) {
    let mut state = handle.subscribe();
    let mut polling = state.borrow_and_update().is_polling;

    while polling {
        tokio::select! {
            Some(ev) = evt_rx.recv() => {
                if !args.json {
                    if let Some(line) = event_line(&ev) {
                        let _ = out_tx.send(OutputLine::Stderr(line));
                    }
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                polling = state.borrow_and_update().is_polling;
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = out_tx.send(OutputLine::Stderr("Interrupted; stopping…".into()));
                handle.reset().await;
                break;
            }
        }
    }
    if !args.json {
        drain_events(evt_rx, out_tx);
    }
}

fn drain_events(
    evt_rx: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) {
    while let Ok(ev) = evt_rx.try_recv() {
        if let Some(line) = event_line(&ev) {
            let _ = out_tx.send(OutputLine::Stderr(line));
        }
    }
}

fn event_line(ev: &ControllerEvent) -> Option<String> {
    match ev {
        ControllerEvent::RunUpdated { run } => Some(text_summary::run_line(run)),
        ControllerEvent::RunCompleted { run } => {
            Some(format!("Run #{} finished: {}", run.id, run.status.as_str()))
        }
        ControllerEvent::PollingStarted => Some("Watching for updates…".into()),
        ControllerEvent::PollingStopped => None,
        ControllerEvent::CooldownBlocked { safety } => Some(format!(
            "Safety cooldown active; next start possible in {}",
            safety.countdown_label()
        )),
        ControllerEvent::Info(info) => Some(info.to_message()),
    }
}

fn print_snapshot(
    args: &Cli,
    snap: &SessionSnapshot,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    if args.json {
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(snap)?));
        return Ok(());
    }
    let remaining = snap
        .safety_state
        .remaining_seconds_at(OffsetDateTime::now_utc());
    for line in text_summary::build_session_summary(snap, remaining).lines {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    Ok(())
}

fn snapshot_result(snap: &SessionSnapshot) -> Result<()> {
    match snap.last_error_message.as_deref() {
        Some(err) => Err(ReportedFailure(format!("could not fetch run status: {err}")).into()),
        None => Ok(()),
    }
}
