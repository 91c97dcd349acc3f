//! Test doubles and helpers shared by the integration tests.
#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    },
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use peer_keepalive::{
    dialer::{DialError, DialResult, Dialer},
    directory::MemoryPeerDirectory,
    events::{EventBus, NodeEvent, Subscription, SubscriptionError},
    PeerId, PeerRecord, ReconnectConfig, ReconnectQueue, Tag, KEEP_ALIVE,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Dialer whose outcome per peer is scripted by the test. Records every call
/// along with concurrency high-water marks.
#[derive(Default)]
pub struct ScriptedDialer {
    calls: Mutex<Vec<(PeerId, Instant)>>,
    remaining_failures: DashMap<PeerId, u32>,
    always_fail: DashSet<PeerId>,
    latency: Mutex<Duration>,
    hang: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    per_peer: DashMap<PeerId, usize>,
    max_per_peer: AtomicUsize,
}

impl ScriptedDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        let dialer = Self::default();
        *dialer.latency.lock() = latency;
        dialer
    }

    /// The next `n` dials to `peer` fail.
    pub fn fail_next(&self, peer: PeerId, n: u32) {
        self.remaining_failures.insert(peer, n);
    }

    pub fn fail_always(&self, peer: PeerId) {
        self.always_fail.insert(peer);
    }

    pub fn succeed(&self, peer: &PeerId) {
        self.always_fail.remove(peer);
        self.remaining_failures.remove(peer);
    }

    /// Dials never resolve and ignore cancellation.
    pub fn hang(&self) {
        self.hang.store(true, SeqCst);
    }

    pub fn calls(&self) -> Vec<(PeerId, Instant)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_to(&self, peer: &PeerId) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(SeqCst)
    }

    pub fn max_in_flight_per_peer(&self) -> usize {
        self.max_per_peer.load(SeqCst)
    }

    fn should_fail(&self, peer: &PeerId) -> bool {
        if self.always_fail.contains(peer) {
            return true;
        }
        match self.remaining_failures.get_mut(peer) {
            Some(mut left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

struct CallGuard<'a> {
    dialer: &'a ScriptedDialer,
    peer: PeerId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.dialer.in_flight.fetch_sub(1, SeqCst);
        if let Some(mut count) = self.dialer.per_peer.get_mut(&self.peer) {
            *count -= 1;
        }
    }
}

impl Dialer for ScriptedDialer {
    type Connection = ();

    async fn open_connection(&self, peer: &PeerId, cancel: CancellationToken) -> DialResult<()> {
        let peer = *peer;
        self.calls.lock().push((peer, Instant::now()));
        let now = self.in_flight.fetch_add(1, SeqCst) + 1;
        self.max_in_flight.fetch_max(now, SeqCst);
        let for_peer = {
            let mut count = self.per_peer.entry(peer).or_insert(0);
            *count += 1;
            *count
        };
        self.max_per_peer.fetch_max(for_peer, SeqCst);
        let _guard = CallGuard { dialer: self, peer };

        if self.hang.load(SeqCst) {
            std::future::pending::<()>().await;
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DialError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        if self.should_fail(&peer) {
            Err(DialError::Refused)
        } else {
            Ok(())
        }
    }
}

/// Settings with deterministic backoff: 1s doubling up to 60s, no jitter.
pub fn test_config() -> ReconnectConfig {
    ReconnectConfig {
        max_parallel_reconnects: 5,
        max_attempts: None,
        retry_interval_ms: 1_000,
        backoff_factor: 2.0,
        max_backoff_ms: 60_000,
        jitter: 0.0,
        dial_timeout_ms: 30_000,
        shutdown_grace_ms: 5_000,
        ..Default::default()
    }
}

pub struct Harness {
    pub directory: Arc<MemoryPeerDirectory>,
    pub dialer: Arc<ScriptedDialer>,
    pub events: EventBus,
    pub queue: ReconnectQueue<MemoryPeerDirectory, ScriptedDialer>,
}

impl Harness {
    pub fn new(config: ReconnectConfig) -> Self {
        Self::with_parts(config, ScriptedDialer::new(), EventBus::default())
    }

    pub fn with_parts(config: ReconnectConfig, dialer: ScriptedDialer, events: EventBus) -> Self {
        let directory = Arc::new(MemoryPeerDirectory::new());
        let dialer = Arc::new(dialer);
        let queue =
            ReconnectQueue::new(config, directory.clone(), dialer.clone(), events.clone());
        Self {
            directory,
            dialer,
            events,
            queue,
        }
    }

    pub fn add_keep_alive_peer(&self) -> PeerId {
        let peer = PeerId::random();
        self.directory
            .insert(PeerRecord::new(peer).with_tag(KEEP_ALIVE, Tag::new(1)));
        peer
    }

    pub fn add_plain_peer(&self) -> PeerId {
        let peer = PeerId::random();
        self.directory.insert(PeerRecord::new(peer));
        peer
    }

    pub fn tag_keep_alive(&self, peer: PeerId) {
        self.directory.tag_peer(peer, KEEP_ALIVE, Tag::new(1));
    }

    pub fn disconnect(&self, peer: PeerId) {
        self.events.publish(NodeEvent::PeerDisconnected(peer));
    }
}

/// Lets spawned tasks run until they are all idle. Under paused time this
/// advances the clock by `d`.
pub async fn run_for(d: Duration) {
    tokio::time::sleep(d).await;
}

/// Next reconnect outcome on `subscription`, skipping disconnects.
pub async fn next_outcome(subscription: &mut Subscription, within: Duration) -> Option<NodeEvent> {
    tokio::time::timeout(within, async {
        loop {
            match subscription.recv().await {
                Ok(NodeEvent::PeerDisconnected(_)) | Err(SubscriptionError::Lagged(_)) => continue,
                Ok(event) => return Some(event),
                Err(SubscriptionError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
