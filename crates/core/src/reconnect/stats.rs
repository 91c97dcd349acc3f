use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Point-in-time counters of a reconnection queue run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectStats {
    /// Peers accepted into the pending set.
    pub submitted: u64,
    /// Submissions coalesced into an entry that was already pending.
    pub deduplicated: u64,
    pub dials_started: u64,
    pub dials_succeeded: u64,
    pub dials_failed: u64,
    /// Peers dropped after reaching the attempt cap.
    pub attempts_exhausted: u64,
    /// Pending entries thrown away by `stop`.
    pub discarded_on_stop: u64,
    pub directory_errors: u64,
    /// Dials running right now.
    pub in_flight: usize,
    /// Entries waiting or dialing right now.
    pub pending: usize,
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    dials_started: AtomicU64,
    dials_succeeded: AtomicU64,
    dials_failed: AtomicU64,
    attempts_exhausted: AtomicU64,
    discarded_on_stop: AtomicU64,
    directory_errors: AtomicU64,
    in_flight: AtomicUsize,
}

impl QueueCounters {
    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dial_succeeded(&self) {
        self.dials_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dial_failed(&self) {
        self.dials_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attempts_exhausted(&self) {
        self.attempts_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn discarded_on_stop(&self, count: usize) {
        self.discarded_on_stop
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn directory_error(&self) {
        self.directory_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a dial as started and in flight until the guard drops.
    pub(crate) fn dial_started(&self) -> InFlightGuard<'_> {
        self.dials_started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { counters: self }
    }

    pub(crate) fn snapshot(&self, pending: usize) -> ReconnectStats {
        ReconnectStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            dials_started: self.dials_started.load(Ordering::Relaxed),
            dials_succeeded: self.dials_succeeded.load(Ordering::Relaxed),
            dials_failed: self.dials_failed.load(Ordering::Relaxed),
            attempts_exhausted: self.attempts_exhausted.load(Ordering::Relaxed),
            discarded_on_stop: self.discarded_on_stop.load(Ordering::Relaxed),
            directory_errors: self.directory_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            pending,
        }
    }
}

pub(crate) struct InFlightGuard<'a> {
    counters: &'a QueueCounters,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
