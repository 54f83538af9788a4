//! Run lifecycle controller.
//!
//! A single task owns the [`ControllerSession`] and serializes every state
//! change: commands from handles, resolved network calls, poll ticks and the
//! starting-phase deadline. Snapshots go out on a watch channel, discrete
//! happenings on the event channel.

use super::scheduler::{Deadline, PollScheduler};
use super::session::{ControllerSession, RunChange, SessionSnapshot};
use crate::api::{ApiError, RunsApi};
use crate::model::{
    ControllerConfig, ControllerEvent, InfoEvent, ManualCheckOutcome, ManualRunResult, RunListing,
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Only the newest run matters to the controller.
const LATEST_RUN_LIMIT: usize = 1;

enum Command {
    Bootstrap(oneshot::Sender<()>),
    StartManualCheck(oneshot::Sender<ManualCheckOutcome>),
    SyncLatest(oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
}

/// A network call resolved. `epoch` identifies the session it was issued for.
enum Completion {
    Listed {
        epoch: u64,
        seq: u64,
        result: Result<RunListing, ApiError>,
    },
    Triggered {
        epoch: u64,
        result: Result<ManualRunResult, ApiError>,
        reply: oneshot::Sender<ManualCheckOutcome>,
    },
}

/// Someone waiting on a list fetch to resolve.
enum ListWaiter {
    Sync(oneshot::Sender<()>),
    Conflict {
        run_id: Option<u64>,
        request_id: Option<String>,
        reply: oneshot::Sender<ManualCheckOutcome>,
    },
}

/// List-fetch bookkeeping: at most one request in flight, plus one queued follow-up.
#[derive(Default)]
struct ListRequests {
    in_flight: bool,
    // Sequence number of the most recently issued request. Never reset.
    issued: u64,
    current: Vec<ListWaiter>,
    follow_up: Vec<ListWaiter>,
}

/// Cloneable handle used by CLI layers to drive the controller.
#[derive(Clone)]
pub(crate) struct RunLifecycleHandle {
    cmd_tx: UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionSnapshot>,
}

impl RunLifecycleHandle {
    /// Fetch the most recent run and start polling if it is still active.
    /// Transport failures land in `last_error_message`.
    pub async fn bootstrap(&self) {
        self.call(Command::Bootstrap).await;
    }

    /// One-shot fetch-and-reconcile of the latest run and safety state.
    pub async fn sync_latest(&self) {
        self.call(Command::SyncLatest).await;
    }

    /// Cancel polling and restore every field to its default.
    pub async fn reset(&self) {
        self.call(Command::Reset).await;
    }

    pub async fn start_manual_check(&self) -> ManualCheckOutcome {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StartManualCheck(tx)).is_err() {
            return ManualCheckOutcome::local_error("Run controller is not running.");
        }
        rx.await.unwrap_or_else(|_| {
            ManualCheckOutcome::local_error("Run controller stopped before answering.")
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    async fn call(&self, make: fn(oneshot::Sender<()>) -> Command) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(make(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the controller task. It runs until every handle is dropped.
pub(crate) fn spawn_controller<C: RunsApi>(
    client: Arc<C>,
    config: ControllerConfig,
    event_tx: UnboundedSender<ControllerEvent>,
) -> (RunLifecycleHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let session = ControllerSession::default();
    let (state_tx, state_rx) = watch::channel(session.snapshot());

    let controller = Controller {
        client,
        config,
        session,
        epoch: 0,
        poll: PollScheduler::new(config.poll_interval),
        starting: Deadline::default(),
        list: ListRequests::default(),
        completion_tx,
        state_tx,
        event_tx,
    };
    let handle = tokio::spawn(controller.run(cmd_rx, completion_rx));
    (RunLifecycleHandle { cmd_tx, state_rx }, handle)
}

struct Controller<C> {
    client: Arc<C>,
    config: ControllerConfig,
    session: ControllerSession,
    // Bumped by reset; completions from older epochs are discarded.
    epoch: u64,
    poll: PollScheduler,
    starting: Deadline,
    list: ListRequests,
    completion_tx: UnboundedSender<Completion>,
    state_tx: watch::Sender<SessionSnapshot>,
    event_tx: UnboundedSender<ControllerEvent>,
}

impl<C: RunsApi> Controller<C> {
    async fn run(
        mut self,
        mut cmd_rx: UnboundedReceiver<Command>,
        mut completion_rx: UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
                Some(done) = completion_rx.recv() => self.handle_completion(done),
                _ = self.poll.tick() => self.on_poll_tick(),
                _ = self.starting.elapsed() => self.on_starting_phase_elapsed(),
            }
        }
        debug!("run controller stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Bootstrap(reply) => {
                debug!("bootstrapping run status");
                self.request_list(ListWaiter::Sync(reply));
            }
            Command::SyncLatest(reply) => self.request_list(ListWaiter::Sync(reply)),
            Command::StartManualCheck(reply) => self.start_manual_check(reply),
            Command::Reset(reply) => {
                self.reset();
                let _ = reply.send(());
            }
        }
    }

    fn start_manual_check(&mut self, reply: oneshot::Sender<ManualCheckOutcome>) {
        if self.session.is_submitting() {
            debug!("manual check ignored; submission already in flight");
            let _ = reply.send(ManualCheckOutcome::local_error(
                "A manual check is already being submitted.",
            ));
            return;
        }

        self.session.begin_submission();
        self.starting.set(self.config.starting_phase);
        self.publish();

        let epoch = self.epoch;
        let client = Arc::clone(&self.client);
        let tx = self.completion_tx.clone();
        info!(epoch, "submitting manual run");
        tokio::spawn(async move {
            let result = client.trigger_manual_run().await;
            let _ = tx.send(Completion::Triggered {
                epoch,
                result,
                reply,
            });
        });
    }

    /// Explicit fetches never join a request issued before they were made.
    fn request_list(&mut self, waiter: ListWaiter) {
        if self.list.in_flight {
            debug!("list fetch queued behind in-flight request");
            self.list.follow_up.push(waiter);
        } else {
            self.list.current.push(waiter);
            self.spawn_list();
        }
    }

    fn on_poll_tick(&mut self) {
        if self.list.in_flight {
            debug!("poll tick dropped; previous fetch still outstanding");
            return;
        }
        debug!("poll tick");
        self.spawn_list();
    }

    fn spawn_list(&mut self) {
        self.list.in_flight = true;
        self.list.issued += 1;
        let seq = self.list.issued;
        let epoch = self.epoch;
        let client = Arc::clone(&self.client);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = client.list_runs(LATEST_RUN_LIMIT).await;
            let _ = tx.send(Completion::Listed { epoch, seq, result });
        });
    }

    fn on_starting_phase_elapsed(&mut self) {
        if self.session.mark_likely_running() {
            debug!("trigger still unresolved; run is likely starting");
            self.emit(ControllerEvent::Info(InfoEvent::LikelyRunning));
            self.publish();
        }
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Listed { epoch, seq, result } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "discarding stale list response");
                    return;
                }
                self.on_listed(seq, result);
            }
            Completion::Triggered {
                epoch,
                result,
                reply,
            } => {
                if epoch != self.epoch {
                    debug!(epoch, current = self.epoch, "discarding stale trigger response");
                    let _ = reply.send(ManualCheckOutcome::local_error(
                        "Run status was reset before the server responded.",
                    ));
                    return;
                }
                self.on_triggered(result, reply);
            }
        }
    }

    fn on_listed(&mut self, seq: u64, result: Result<RunListing, ApiError>) {
        self.list.in_flight = false;
        let waiters = std::mem::take(&mut self.list.current);

        match result {
            Ok(listing) => {
                let change = self.session.apply_listing(listing, seq);
                self.emit_run_change(change);
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch latest run");
                self.session.record_failure(e.message());
                self.emit(ControllerEvent::Info(InfoEvent::RequestFailed {
                    message: e.message().to_string(),
                }));
            }
        }
        self.update_polling();
        self.publish();

        for waiter in waiters {
            match waiter {
                ListWaiter::Sync(reply) => {
                    let _ = reply.send(());
                }
                ListWaiter::Conflict {
                    run_id,
                    request_id,
                    reply,
                } => {
                    let run_id = run_id.or(self.session.latest_run().map(|r| r.id));
                    let _ = reply.send(ManualCheckOutcome::AlreadyRunning { run_id, request_id });
                }
            }
        }

        if !self.list.follow_up.is_empty() {
            self.list.current = std::mem::take(&mut self.list.follow_up);
            self.spawn_list();
        }
    }

    fn on_triggered(
        &mut self,
        result: Result<ManualRunResult, ApiError>,
        reply: oneshot::Sender<ManualCheckOutcome>,
    ) {
        self.starting.clear();
        self.session.end_submission();

        let err = match result {
            Ok(started) => {
                info!(
                    run_id = started.run_id,
                    status = started.status.as_str(),
                    reused = started.reused_existing_run,
                    "manual run started"
                );
                let change = self.session.apply_trigger_success(&started);
                self.emit_run_change(change);
                self.update_polling();
                self.publish();
                let _ = reply.send(ManualCheckOutcome::Started {
                    run_id: started.run_id,
                    reused_existing_run: started.reused_existing_run,
                });
                return;
            }
            Err(err) => err,
        };

        match err {
            ApiError::Conflict {
                run_id, request_id, ..
            } => {
                info!(run_id, request_id = request_id.as_deref(), "run already in progress");
                self.session.mark_conflict(self.list.issued);
                self.emit(ControllerEvent::Info(InfoEvent::Message(
                    "A run is already in progress; following it.".to_string(),
                )));
                self.update_polling();
                self.publish();
                // Reconcile with a fetch issued after the conflict was observed.
                self.request_list(ListWaiter::Conflict {
                    run_id,
                    request_id,
                    reply,
                });
            }
            ApiError::Cooldown {
                ref safety_state,
                ref message,
                ..
            } => {
                warn!(request_id = err.request_id(), "manual run blocked by safety cooldown");
                self.session.apply_cooldown(safety_state, message);
                let safety = self.session.snapshot().safety_state;
                self.emit(ControllerEvent::CooldownBlocked {
                    safety: Box::new(safety),
                });
                self.publish();
                let _ = reply.send(error_outcome(&err));
            }
            _ => {
                warn!(error = %err, request_id = err.request_id(), "manual run request failed");
                self.session.record_failure(err.message());
                self.emit(ControllerEvent::Info(InfoEvent::RequestFailed {
                    message: err.message().to_string(),
                }));
                self.publish();
                let _ = reply.send(error_outcome(&err));
            }
        }
    }

    /// Arm or disarm polling to match whether a run is active.
    fn update_polling(&mut self) {
        let active = self.session.is_run_active();
        if active && self.poll.arm() {
            info!(interval = ?self.config.poll_interval, "polling started");
            self.session.set_polling(true);
            self.emit(ControllerEvent::PollingStarted);
        } else if !active && self.poll.disarm() {
            info!("polling stopped");
            self.session.set_polling(false);
            self.emit(ControllerEvent::PollingStopped);
        }
    }

    fn reset(&mut self) {
        self.epoch += 1;
        info!(epoch = self.epoch, "resetting run controller");
        self.poll.disarm();
        self.starting.clear();

        let issued = self.list.issued;
        let list = std::mem::replace(
            &mut self.list,
            ListRequests {
                issued,
                ..ListRequests::default()
            },
        );
        for waiter in list.current.into_iter().chain(list.follow_up) {
            match waiter {
                ListWaiter::Sync(reply) => {
                    let _ = reply.send(());
                }
                ListWaiter::Conflict { reply, .. } => {
                    let _ = reply.send(ManualCheckOutcome::local_error(
                        "Run status was reset before the server responded.",
                    ));
                }
            }
        }

        self.session = ControllerSession::default();
        self.emit(ControllerEvent::Info(InfoEvent::Reset));
        self.publish();
    }

    fn emit_run_change(&mut self, change: RunChange) {
        let Some(run) = self.session.latest_run().cloned() else {
            return;
        };
        match change {
            RunChange::Updated => {
                debug!(run_id = run.id, status = run.status.as_str(), "run updated");
                self.emit(ControllerEvent::RunUpdated { run });
            }
            RunChange::Completed => {
                info!(run_id = run.id, status = run.status.as_str(), "run completed");
                self.emit(ControllerEvent::RunUpdated { run: run.clone() });
                self.emit(ControllerEvent::RunCompleted { run });
            }
            RunChange::Stale => {
                debug!(held = run.id, "ignoring run older than the one held");
            }
            RunChange::Unchanged => {}
        }
    }

    fn emit(&self, event: ControllerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.session.snapshot());
    }
}

fn error_outcome(err: &ApiError) -> ManualCheckOutcome {
    ManualCheckOutcome::Error {
        message: err.message().to_string(),
        status: err.status(),
        code: err.code().map(str::to_string),
        request_id: err.request_id().map(str::to_string),
    }
}
