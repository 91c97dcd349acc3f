//! Keeps the node connected to every peer tagged [`KEEP_ALIVE`](crate::peer::KEEP_ALIVE).
//!
//! A [`ReconnectQueue`] reacts to two inputs:
//!
//! - on start it sweeps the peer directory once and schedules a dial to every
//!   keep-alive peer;
//! - while running it listens for [`NodeEvent::PeerDisconnected`] and, when the
//!   peer's *current* record still carries the tag, schedules a dial to it.
//!
//! Dials are executed by a fixed pool of workers. Each peer has at most one
//! pending entry, failed dials are retried with exponential backoff and,
//! when an attempt cap is configured, given up on with a
//! [`NodeEvent::ReconnectFailed`] notification.
//!
//! ```text
//!  directory ──sweep──┐
//!                     ├─▶ scheduler (one entry per peer) ─▶ workers ─▶ dialer
//!  event bus ─disconnect┘        ▲                              │
//!                                └──────── backoff on failure ──┘
//! ```

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ConfigError, ReconnectConfig},
    dialer::Dialer,
    directory::{DirectoryError, PeerDirectory},
    events::{EventBus, NodeEvent, Subscription, SubscriptionError},
    peer::PeerId,
};

mod scheduler;
mod stats;
mod worker;

pub use scheduler::{PendingEntry, ResubmitPolicy, Submission};
pub use stats::ReconnectStats;

use scheduler::Scheduler;
use stats::QueueCounters;
use worker::WorkerContext;

#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    #[error("no tokio runtime available to run the reconnection queue")]
    NoRuntime,
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Work belonging to one start/stop cycle.
struct Session {
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ReconnectQueue<P, D> {
    config: ReconnectConfig,
    directory: Arc<P>,
    dialer: Arc<D>,
    events: EventBus,
    state: parking_lot::Mutex<QueueState>,
    session: tokio::sync::Mutex<Option<Session>>,
    /// Scheduler of the running session, readable without the session lock.
    scheduler: ArcSwapOption<Scheduler>,
    counters: ArcSwapOption<QueueCounters>,
}

impl<P, D> ReconnectQueue<P, D>
where
    P: PeerDirectory,
    D: Dialer,
{
    pub fn new(
        config: ReconnectConfig,
        directory: Arc<P>,
        dialer: Arc<D>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            directory,
            dialer,
            events,
            state: parking_lot::Mutex::new(QueueState::Stopped),
            session: tokio::sync::Mutex::new(None),
            scheduler: ArcSwapOption::empty(),
            counters: ArcSwapOption::empty(),
        }
    }

    /// Subscribes to disconnects, issues the startup sweep and spawns the dial
    /// workers. Does nothing when already running.
    pub async fn start(&self) -> Result<(), ReconnectError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            tracing::debug!("Reconnection queue already running");
            return Ok(());
        }
        self.config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ReconnectError::NoRuntime)?;
        self.set_state(QueueState::Starting);

        let scheduler = Arc::new(Scheduler::new(
            self.config.backoff(),
            self.config.max_attempts,
            self.resubmit_policy(),
        ));
        let counters = Arc::new(QueueCounters::default());
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.config.max_parallel_reconnects + 2);

        // subscribe before sweeping so a disconnect between the two is not lost
        let subscription = self.events.subscribe();
        tasks.push(runtime.spawn(listen_for_disconnects(
            subscription,
            self.directory.clone(),
            scheduler.clone(),
            counters.clone(),
            cancel.clone(),
        )));
        tasks.push(runtime.spawn({
            let directory = self.directory.clone();
            let scheduler = scheduler.clone();
            let counters = counters.clone();
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sweep_keep_alive_peers(&*directory, &scheduler, &counters) => {}
                }
            }
        }));

        let ctx = Arc::new(WorkerContext {
            scheduler: scheduler.clone(),
            dialer: self.dialer.clone(),
            events: self.events.clone(),
            counters: counters.clone(),
            dial_timeout: self.config.dial_timeout(),
        });
        for id in 0..self.config.max_parallel_reconnects {
            tasks.push(runtime.spawn(worker::dial_worker(id, ctx.clone(), cancel.clone())));
        }

        self.scheduler.store(Some(scheduler.clone()));
        self.counters.store(Some(counters));
        *session = Some(Session {
            scheduler,
            cancel,
            tasks,
        });
        self.set_state(QueueState::Running);
        tracing::info!(
            workers = self.config.max_parallel_reconnects,
            max_attempts = ?self.config.max_attempts,
            "Reconnection queue started"
        );
        Ok(())
    }

    /// Unsubscribes, drops every scheduled entry and winds the workers down.
    /// Dials still running are cancelled and left behind, so stop normally
    /// returns without waiting on the dialer. Tasks still alive after the
    /// shutdown grace period are aborted. Does nothing when already stopped.
    pub async fn stop(&self) -> Result<(), ReconnectError> {
        let mut session = self.session.lock().await;
        let Some(Session {
            scheduler,
            cancel,
            mut tasks,
        }) = session.take()
        else {
            return Ok(());
        };
        self.set_state(QueueState::Stopping);

        self.scheduler.store(None);
        cancel.cancel();
        let discarded = scheduler.close();
        if let Some(counters) = self.counters.load_full() {
            counters.discarded_on_stop(discarded);
        }

        let grace = self.config.shutdown_grace();
        let all = futures::future::join_all(tasks.iter_mut());
        if tokio::time::timeout(grace, all).await.is_err() {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Reconnection workers did not stop in time, aborting them"
            );
            for task in &tasks {
                task.abort();
            }
        }

        self.set_state(QueueState::Stopped);
        tracing::info!(discarded, "Reconnection queue stopped");
        Ok(())
    }

    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == QueueState::Running
    }

    /// Peers waiting for or undergoing a dial.
    pub fn pending_peers(&self) -> Vec<PeerId> {
        self.scheduler
            .load_full()
            .map(|s| s.peers())
            .unwrap_or_default()
    }

    pub fn pending_entry(&self, peer: &PeerId) -> Option<PendingEntry> {
        self.scheduler.load_full().and_then(|s| s.entry(peer))
    }

    /// Counters of the current run, or of the last one once stopped.
    pub fn stats(&self) -> ReconnectStats {
        let pending = self.scheduler.load_full().map_or(0, |s| s.len());
        self.counters
            .load_full()
            .map(|c| c.snapshot(pending))
            .unwrap_or_default()
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn resubmit_policy(&self) -> ResubmitPolicy {
        if self.config.reset_backoff_on_resubmit {
            ResubmitPolicy::ResetBackoff
        } else {
            ResubmitPolicy::KeepSchedule
        }
    }

    fn set_state(&self, state: QueueState) {
        *self.state.lock() = state;
    }
}

impl<P, D> Drop for ReconnectQueue<P, D> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
            session.scheduler.close();
        }
    }
}

fn submit_keep_alive(scheduler: &Scheduler, counters: &QueueCounters, peer: PeerId) {
    match scheduler.submit(peer) {
        Submission::Enqueued => {
            counters.submitted();
            tracing::debug!(%peer, "Scheduled reconnection to keep-alive peer");
        }
        Submission::AlreadyPending => {
            counters.deduplicated();
            tracing::trace!(%peer, "Reconnection already pending");
        }
        Submission::Rescheduled => {
            counters.deduplicated();
            tracing::debug!(%peer, "Pending reconnection pulled forward");
        }
        Submission::Closed => {}
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn sweep_keep_alive_peers<P: PeerDirectory>(
    directory: &P,
    scheduler: &Scheduler,
    counters: &QueueCounters,
) {
    let records = match directory.list_all().await {
        Ok(records) => records,
        Err(error) => {
            counters.directory_error();
            tracing::warn!(%error, "Could not list peers, skipping keep-alive sweep");
            return;
        }
    };
    let mut keep_alive = 0;
    for record in records.iter().filter(|r| r.is_keep_alive()) {
        submit_keep_alive(scheduler, counters, record.id);
        keep_alive += 1;
    }
    tracing::debug!(known = records.len(), keep_alive, "Keep-alive sweep finished");
}

#[tracing::instrument(level = "debug", skip(directory, scheduler, counters))]
async fn handle_disconnect<P: PeerDirectory>(
    peer: PeerId,
    directory: &P,
    scheduler: &Scheduler,
    counters: &QueueCounters,
) {
    match directory.get(&peer).await {
        Ok(record) if record.is_keep_alive() => submit_keep_alive(scheduler, counters, peer),
        Ok(_) => tracing::trace!("Disconnected peer is not keep-alive"),
        Err(DirectoryError::NotFound(_)) => tracing::trace!("Disconnected peer is unknown"),
        Err(error) => {
            counters.directory_error();
            tracing::warn!(%error, "Could not look up disconnected peer");
        }
    }
}

async fn handle_event<P: PeerDirectory>(
    event: Result<NodeEvent, SubscriptionError>,
    directory: &P,
    scheduler: &Scheduler,
    counters: &QueueCounters,
) {
    match event {
        Ok(NodeEvent::PeerDisconnected(peer)) => {
            handle_disconnect(peer, directory, scheduler, counters).await
        }
        Ok(_) => {}
        Err(SubscriptionError::Lagged(missed)) => {
            tracing::warn!(missed, "Missed disconnect notifications, sweeping directory");
            sweep_keep_alive_peers(directory, scheduler, counters).await
        }
        Err(SubscriptionError::Closed) => {
            tracing::debug!("Event bus closed, no more disconnect notifications");
        }
    }
}

async fn listen_for_disconnects<P: PeerDirectory>(
    mut subscription: Subscription,
    directory: Arc<P>,
    scheduler: Arc<Scheduler>,
    counters: Arc<QueueCounters>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = subscription.recv() => event,
        };
        let closed = matches!(event, Err(SubscriptionError::Closed));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = handle_event(event, &*directory, &scheduler, &counters) => {}
        }
        if closed {
            break;
        }
    }
    subscription.unsubscribe();
}
