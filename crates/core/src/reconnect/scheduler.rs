//! The pending set: one entry per peer waiting for, or undergoing, a dial.
//!
//! Workers claim the entry with the earliest eligibility time. A claimed entry
//! stays in the set while it is being dialed, so a peer that disconnects again
//! in the meantime is coalesced instead of dialed twice.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{peer::PeerId, util::backoff::ExponentialBackoff};

/// What happens when a peer that is already pending is submitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResubmitPolicy {
    /// The existing schedule is left untouched.
    #[default]
    KeepSchedule,
    /// A backed-off entry becomes eligible immediately. Its attempt count is kept.
    ResetBackoff,
}

/// Scheduling record of a single peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub peer: PeerId,
    pub enqueued_at: Instant,
    /// Failed dials so far.
    pub attempts: u32,
    pub next_eligible: Instant,
    pub in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Enqueued,
    /// Coalesced into the existing entry.
    AlreadyPending,
    /// Coalesced, and the entry's backoff was cut short.
    Rescheduled,
    /// The queue is shut down.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claim {
    pub peer: PeerId,
    /// 1-based number of this attempt.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    Retry { attempts: u32, delay: Duration },
    Exhausted { attempts: u32 },
    /// The entry is gone, the queue was stopped while dialing.
    Discarded,
}

enum Next {
    Ready(Claim),
    Wait(Option<Instant>),
}

pub(crate) struct Scheduler {
    pending: Mutex<HashMap<PeerId, PendingEntry>>,
    changed: Notify,
    closed: AtomicBool,
    backoff: ExponentialBackoff,
    max_attempts: Option<u32>,
    resubmit: ResubmitPolicy,
}

impl Scheduler {
    pub fn new(
        backoff: ExponentialBackoff,
        max_attempts: Option<u32>,
        resubmit: ResubmitPolicy,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            closed: AtomicBool::new(false),
            backoff,
            max_attempts,
            resubmit,
        }
    }

    pub fn submit(&self, peer: PeerId) -> Submission {
        let now = Instant::now();
        let submission = {
            let mut pending = self.pending.lock();
            // checked under the lock so nothing lands after `close` cleared the set
            if self.is_closed() {
                return Submission::Closed;
            }
            match pending.get_mut(&peer) {
                Some(entry)
                    if self.resubmit == ResubmitPolicy::ResetBackoff
                        && !entry.in_flight
                        && entry.next_eligible > now =>
                {
                    entry.next_eligible = now;
                    Submission::Rescheduled
                }
                Some(_) => Submission::AlreadyPending,
                None => {
                    pending.insert(
                        peer,
                        PendingEntry {
                            peer,
                            enqueued_at: now,
                            attempts: 0,
                            next_eligible: now,
                            in_flight: false,
                        },
                    );
                    Submission::Enqueued
                }
            }
        };
        if submission != Submission::AlreadyPending {
            self.changed.notify_waiters();
        }
        submission
    }

    /// Waits for an eligible entry and marks it in flight. Returns `None` once
    /// `cancel` fires or the scheduler is closed.
    pub async fn claim(&self, cancel: &CancellationToken) -> Option<Claim> {
        loop {
            if cancel.is_cancelled() || self.is_closed() {
                return None;
            }
            // registered before inspecting the set so no change is missed
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next(Instant::now()) {
                Next::Ready(claim) => return Some(claim),
                Next::Wait(Some(deadline)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Next::Wait(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    fn next(&self, now: Instant) -> Next {
        let mut pending = self.pending.lock();
        let earliest = pending
            .values_mut()
            .filter(|entry| !entry.in_flight)
            .min_by_key(|entry| entry.next_eligible);
        match earliest {
            Some(entry) if entry.next_eligible <= now => {
                entry.in_flight = true;
                Next::Ready(Claim {
                    peer: entry.peer,
                    attempt: entry.attempts + 1,
                })
            }
            Some(entry) => Next::Wait(Some(entry.next_eligible)),
            None => Next::Wait(None),
        }
    }

    /// Drops the entry after a successful dial. Returns whether it was still pending.
    pub fn record_success(&self, peer: &PeerId) -> bool {
        self.pending.lock().remove(peer).is_some()
    }

    pub fn record_failure(&self, peer: &PeerId) -> FailureOutcome {
        let outcome = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(peer) else {
                return FailureOutcome::Discarded;
            };
            entry.attempts = entry.attempts.saturating_add(1);
            entry.in_flight = false;
            let attempts = entry.attempts;

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                pending.remove(peer);
                FailureOutcome::Exhausted { attempts }
            } else {
                let delay = self
                    .backoff
                    .jittered_delay_for_failures(attempts, &mut rand::rng());
                entry.next_eligible = Instant::now() + delay;
                FailureOutcome::Retry { attempts, delay }
            }
        };
        self.changed.notify_waiters();
        outcome
    }

    /// Rejects further submissions and drops every entry. Returns how many
    /// entries were dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::SeqCst);
            let dropped = pending.len();
            pending.clear();
            dropped
        };
        self.changed.notify_waiters();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn entry(&self, peer: &PeerId) -> Option<PendingEntry> {
        self.pending.lock().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.pending.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}
