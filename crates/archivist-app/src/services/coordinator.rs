//! Debounced, single-flight coordinator for all-corpus builds.
//!
//! One actor task owns the build slot. Every event gets a sequence number and
//! is held for `final_event_check`; it passes only if it is still the newest
//! event when the timer fires.
//! While the factory is preparing a row the slot is busy and admissions wait
//! `building_check` between retries; a running pipeline is preempted instead.

use std::sync::Arc;
use std::time::Duration;

use archivist_server::Archive;
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BuildConfig;
use crate::pipeline::format_instant;
use crate::services::builder::BuildLauncher;
use crate::services::events::EventStream;
use crate::services::requests::BuildPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub final_event_check: Duration,
    pub building_check: Duration,
    /// Build immediately on spawn, bypassing the debounce.
    pub build_on_startup: bool,
}

impl CoordinatorOptions {
    pub fn from_config(cfg: &BuildConfig) -> Self {
        Self {
            final_event_check: Duration::from_secs(cfg.final_event_check_secs),
            building_check: Duration::from_secs(cfg.bundle_building_check_secs),
            build_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CoordinatorPhase {
    Idle,
    Preparing,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub last_event: Option<DateTime<Utc>>,
    pub phase: CoordinatorPhase,
    pub building_since: Option<DateTime<Utc>>,
    pub running_archive: Option<Uuid>,
    pub finished_runs: u64,
}

impl CoordinatorStatus {
    /// How long the slot has been busy beyond `max_building`, if at all.
    pub fn overdue(&self, now: DateTime<Utc>, max_building: Duration) -> Option<Duration> {
        let since = self.building_since?;
        let busy = now.signed_duration_since(since).to_std().ok()?;
        busy.checked_sub(max_building).filter(|over| !over.is_zero())
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator is not running")]
    Closed,
}

/// An admitted-or-pending event: arrival order plus the cutoff it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    seq: u64,
    instant: DateTime<Utc>,
}

enum Command {
    Event(DateTime<Utc>),
    Settled(Ticket),
    Recheck(Ticket),
    Prepared {
        ticket: Ticket,
        plan: Result<BuildPlan, String>,
    },
    Finished {
        run_id: u64,
        archive: Option<Archive>,
    },
    Status(Sender<CoordinatorStatus>),
    Stop(Sender<()>),
}

/// Cloneable sender side used by the HTTP layer.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: Sender<Command>,
}

impl CoordinatorHandle {
    /// Post a corpus-changed event; it goes through the debounce like any other.
    pub async fn trigger(&self, instant: DateTime<Utc>) -> Result<(), CoordinatorError> {
        self.tx
            .send_async(Command::Event(instant))
            .await
            .map_err(|_| CoordinatorError::Closed)
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.tx
            .send_async(Command::Status(reply_tx))
            .await
            .map_err(|_| CoordinatorError::Closed)?;
        reply_rx
            .recv_async()
            .await
            .map_err(|_| CoordinatorError::Closed)
    }
}

pub struct AllCorpusCoordinator {
    handle: CoordinatorHandle,
    actor: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl AllCorpusCoordinator {
    pub fn spawn(
        launcher: Arc<dyn BuildLauncher>,
        options: CoordinatorOptions,
        events: EventStream,
    ) -> Self {
        // Unbounded so timers and supervisors never block on a busy actor.
        let (tx, rx) = flume::unbounded::<Command>();
        let actor = Actor {
            launcher,
            options,
            tx: tx.clone(),
            last_event: None,
            event_seq: 0,
            slot: Slot::Idle,
            next_run_id: 0,
            finished_runs: 0,
            pending_stop: None,
        };
        let actor = tokio::spawn(actor.run(rx));

        let forward_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                if forward_tx.send(Command::Event(event.instant)).is_err() {
                    break;
                }
            }
        });

        Self {
            handle: CoordinatorHandle { tx },
            actor: Some(actor),
            forwarder: Some(forwarder),
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Cancel any running build, wait for its bookkeeping, then stop.
    pub async fn shutdown(mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        let (reply_tx, reply_rx) = flume::bounded(1);
        if self.handle.tx.send_async(Command::Stop(reply_tx)).await.is_ok() {
            let _ = reply_rx.recv_async().await;
        }
        if let Some(actor) = self.actor.take() {
            if let Err(err) = actor.await {
                error!(error = %err, "coordinator task ended abnormally");
            }
        }
    }
}

impl Drop for AllCorpusCoordinator {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if self.actor.is_some() {
            let (reply_tx, _reply_rx) = flume::bounded(1);
            let _ = self.handle.tx.send(Command::Stop(reply_tx));
        }
    }
}

struct ActiveRun {
    id: u64,
    instant: DateTime<Utc>,
    since: DateTime<Utc>,
    archive_id: Uuid,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

enum Slot {
    Idle,
    Preparing {
        ticket: Ticket,
        since: DateTime<Utc>,
    },
    Running(ActiveRun),
}

struct Actor {
    launcher: Arc<dyn BuildLauncher>,
    options: CoordinatorOptions,
    tx: Sender<Command>,
    last_event: Option<DateTime<Utc>>,
    event_seq: u64,
    slot: Slot,
    next_run_id: u64,
    finished_runs: u64,
    pending_stop: Option<Sender<()>>,
}

impl Actor {
    async fn run(mut self, rx: Receiver<Command>) {
        if self.options.build_on_startup {
            let now = Utc::now();
            info!(instant = %format_instant(now), "startup build requested");
            let ticket = self.record_event(now);
            self.admit(ticket).await;
        }

        while let Ok(command) = rx.recv_async().await {
            match command {
                Command::Event(instant) => self.on_event(instant),
                Command::Settled(ticket) => self.on_settled(ticket).await,
                Command::Recheck(ticket) => self.on_recheck(ticket).await,
                Command::Prepared { ticket, plan } => {
                    self.on_prepared(ticket, plan).await;
                    if self.stop_if_pending() {
                        break;
                    }
                }
                Command::Finished { run_id, archive } => self.on_finished(run_id, archive),
                Command::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                Command::Stop(reply) => {
                    self.pending_stop = Some(reply);
                    if matches!(self.slot, Slot::Preparing { .. }) {
                        debug!("stop deferred until preparation finishes");
                        continue;
                    }
                    self.cancel_running().await;
                    self.stop_if_pending();
                    break;
                }
            }
        }
        debug!("coordinator stopped");
    }

    fn stopping(&self) -> bool {
        self.pending_stop.is_some()
    }

    fn stop_if_pending(&mut self) -> bool {
        match self.pending_stop.take() {
            Some(reply) => {
                let _ = reply.send(());
                true
            }
            None => false,
        }
    }

    fn record_event(&mut self, instant: DateTime<Utc>) -> Ticket {
        self.event_seq += 1;
        self.last_event = Some(instant);
        Ticket {
            seq: self.event_seq,
            instant,
        }
    }

    fn is_latest(&self, ticket: Ticket) -> bool {
        ticket.seq == self.event_seq
    }

    fn on_event(&mut self, instant: DateTime<Utc>) {
        if self.stopping() {
            return;
        }
        let ticket = self.record_event(instant);
        debug!(seq = ticket.seq, instant = %format_instant(instant), "event received");
        self.schedule(self.options.final_event_check, Command::Settled(ticket));
    }

    async fn on_settled(&mut self, ticket: Ticket) {
        if self.stopping() {
            return;
        }
        if !self.is_latest(ticket) {
            debug!(seq = ticket.seq, instant = %format_instant(ticket.instant), "event superseded during debounce");
            return;
        }
        self.admit(ticket).await;
    }

    async fn on_recheck(&mut self, ticket: Ticket) {
        if self.stopping() {
            return;
        }
        if !self.is_latest(ticket) {
            debug!(seq = ticket.seq, instant = %format_instant(ticket.instant), "event abandoned while waiting for the building guard");
            return;
        }
        self.admit(ticket).await;
    }

    async fn admit(&mut self, ticket: Ticket) {
        let instant = ticket.instant;
        if let Slot::Preparing { ticket: busy, .. } = &self.slot {
            debug!(
                instant = %format_instant(instant),
                preparing = %format_instant(busy.instant),
                wait_secs = self.options.building_check.as_secs(),
                "archive row being prepared; rechecking later"
            );
            self.schedule(self.options.building_check, Command::Recheck(ticket));
            return;
        }

        self.cancel_running().await;
        self.slot = Slot::Preparing {
            ticket,
            since: Utc::now(),
        };
        info!(seq = ticket.seq, instant = %format_instant(instant), "preparing all-corpus build");

        let launcher = self.launcher.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let prepared =
                tokio::spawn(async move { launcher.prepare_all(instant).await }).await;
            let plan = match prepared {
                Ok(Ok(plan)) => Ok(plan),
                Ok(Err(err)) => Err(err.to_string()),
                Err(join) => Err(format!("preparation task panicked: {join}")),
            };
            let _ = tx.send(Command::Prepared { ticket, plan });
        });
    }

    async fn on_prepared(&mut self, ticket: Ticket, plan: Result<BuildPlan, String>) {
        let instant = ticket.instant;
        if !matches!(self.slot, Slot::Preparing { ticket: current, .. } if current == ticket) {
            warn!(seq = ticket.seq, instant = %format_instant(instant), "unexpected preparation result ignored");
            return;
        }
        self.slot = Slot::Idle;

        let request = match plan {
            Ok(BuildPlan::Build(request)) => request,
            Ok(BuildPlan::Reuse(archive)) => {
                info!(
                    archive_id = %archive.id,
                    hash_info = %archive.hash_info,
                    "corpus snapshot already archived"
                );
                return;
            }
            Err(err) => {
                warn!(instant = %format_instant(instant), error = %err, "all-corpus build not started");
                return;
            }
        };

        let cancel = CancellationToken::new();
        if self.stopping() {
            // Still drive the row to CANCELLED.
            cancel.cancel();
            let archive = self.launcher.run(request, cancel).await;
            debug!(archive_id = %archive.id, status = %archive.status, "prepared build cancelled by shutdown");
            return;
        }

        self.next_run_id += 1;
        let run_id = self.next_run_id;
        let archive_id = request.archive.id;
        let launcher = self.launcher.clone();
        let tx = self.tx.clone();
        let token = cancel.clone();
        let supervisor = tokio::spawn(async move {
            let outcome = tokio::spawn(async move { launcher.run(request, token).await }).await;
            let archive = match outcome {
                Ok(archive) => Some(archive),
                Err(err) => {
                    error!(run_id, error = %err, "build task panicked");
                    None
                }
            };
            let _ = tx.send(Command::Finished { run_id, archive });
        });

        info!(run_id, archive_id = %archive_id, instant = %format_instant(instant), "all-corpus build running");
        self.slot = Slot::Running(ActiveRun {
            id: run_id,
            instant,
            since: Utc::now(),
            archive_id,
            cancel,
            supervisor,
        });
    }

    fn on_finished(&mut self, run_id: u64, archive: Option<Archive>) {
        self.finished_runs += 1;
        let current = matches!(&self.slot, Slot::Running(run) if run.id == run_id);
        if let Some(archive) = &archive {
            info!(run_id, archive_id = %archive.id, status = %archive.status, "all-corpus build finished");
        }
        if current {
            self.slot = Slot::Idle;
        }
    }

    /// Cancel the running build and wait until its terminal bookkeeping is done.
    async fn cancel_running(&mut self) {
        let Slot::Running(run) = std::mem::replace(&mut self.slot, Slot::Idle) else {
            return;
        };
        info!(
            run_id = run.id,
            archive_id = %run.archive_id,
            instant = %format_instant(run.instant),
            "preempting running build"
        );
        run.cancel.cancel();
        if let Err(err) = run.supervisor.await {
            error!(run_id = run.id, error = %err, "build supervisor ended abnormally");
        }
    }

    fn status(&self) -> CoordinatorStatus {
        let (phase, building_since, running_archive) = match &self.slot {
            Slot::Idle => (CoordinatorPhase::Idle, None, None),
            Slot::Preparing { since, .. } => (CoordinatorPhase::Preparing, Some(*since), None),
            Slot::Running(run) => (CoordinatorPhase::Running, Some(run.since), Some(run.archive_id)),
        };
        CoordinatorStatus {
            last_event: self.last_event,
            phase,
            building_since,
            running_archive,
            finished_runs: self.finished_runs,
        }
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(command);
        });
    }
}
