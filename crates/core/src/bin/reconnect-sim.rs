//! Runs the reconnection queue against an in-memory directory and a dialer
//! that fails at random, then prints the queue counters as JSON.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use peer_keepalive::{
    dialer::{DialError, DialResult, Dialer},
    directory::MemoryPeerDirectory,
    events::{EventBus, NodeEvent, Subscription, SubscriptionError},
    tracing::init_tracer,
    ConfigArgs, PeerId, PeerRecord, ReconnectConfig, ReconnectQueue, ReconnectStats, Tag,
    KEEP_ALIVE,
};
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct SimArgs {
    /// Number of peers in the directory.
    #[arg(long, default_value_t = 20)]
    peers: usize,

    /// Share of peers tagged keep-alive.
    #[arg(long, default_value_t = 0.5)]
    keep_alive_ratio: f64,

    /// Probability that a dial fails.
    #[arg(long, default_value_t = 0.3)]
    failure_rate: f64,

    /// Time a dial takes before it resolves, in milliseconds.
    #[arg(long, default_value_t = 50)]
    dial_latency_ms: u64,

    /// Interval between simulated disconnects, in milliseconds.
    #[arg(long, default_value_t = 500)]
    disconnect_every_ms: u64,

    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    #[command(flatten)]
    config: ConfigArgs,
}

struct FlakyDialer {
    failure_rate: f64,
    latency: Duration,
    dials: AtomicU64,
}

impl Dialer for FlakyDialer {
    type Connection = ();

    async fn open_connection(&self, _peer: &PeerId, cancel: CancellationToken) -> DialResult<()> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            _ = tokio::time::sleep(self.latency) => {}
        }
        if rand::rng().random_bool(self.failure_rate) {
            Err(DialError::Refused)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct SimReport {
    peers: usize,
    keep_alive_peers: usize,
    disconnects: u64,
    dials: u64,
    reconnected_events: u64,
    failed_events: u64,
    queue: ReconnectStats,
}

/// Counts reconnect outcomes until the bus closes. Returns `(reconnected, failed)`.
async fn tally_outcomes(mut subscription: Subscription) -> (u64, u64) {
    let (mut reconnected, mut failed) = (0, 0);
    loop {
        match subscription.recv().await {
            Ok(NodeEvent::PeerReconnected(_)) => reconnected += 1,
            Ok(NodeEvent::ReconnectFailed(_)) => failed += 1,
            Ok(NodeEvent::PeerDisconnected(_)) => {}
            Err(SubscriptionError::Lagged(missed)) => {
                tracing::debug!(missed, "Report subscriber lagged behind");
            }
            Err(SubscriptionError::Closed) => break,
        }
    }
    (reconnected, failed)
}

async fn run(args: SimArgs, config: ReconnectConfig) -> anyhow::Result<SimReport> {
    let directory = Arc::new(MemoryPeerDirectory::new());
    let mut peers = Vec::with_capacity(args.peers);
    let mut keep_alive_peers = 0;
    for _ in 0..args.peers {
        let mut record = PeerRecord::new(PeerId::random());
        if rand::rng().random_bool(args.keep_alive_ratio.clamp(0.0, 1.0)) {
            record = record.with_tag(KEEP_ALIVE, Tag::new(1));
            keep_alive_peers += 1;
        }
        peers.push(record.id);
        directory.insert(record);
    }

    let dialer = Arc::new(FlakyDialer {
        failure_rate: args.failure_rate.clamp(0.0, 1.0),
        latency: Duration::from_millis(args.dial_latency_ms),
        dials: AtomicU64::new(0),
    });
    let events = EventBus::default();
    let queue = ReconnectQueue::new(config, directory, dialer.clone(), events.clone());

    let outcomes = tokio::spawn(tally_outcomes(events.subscribe()));

    queue.start().await?;
    tracing::info!(peers = args.peers, keep_alive_peers, "Simulation running");

    let mut disconnects = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration_secs);
    let mut tick = tokio::time::interval(Duration::from_millis(args.disconnect_every_ms.max(1)));
    while tokio::time::Instant::now() < deadline && !peers.is_empty() {
        tick.tick().await;
        let peer = peers[rand::rng().random_range(0..peers.len())];
        events.publish(NodeEvent::PeerDisconnected(peer));
        disconnects += 1;
    }

    queue.stop().await?;
    let queue_stats = queue.stats();
    drop(queue);
    drop(events);
    let (reconnected_events, failed_events) = outcomes.await?;

    Ok(SimReport {
        peers: args.peers,
        keep_alive_peers,
        disconnects,
        dials: dialer.dials.load(Ordering::Relaxed),
        reconnected_events,
        failed_events,
        queue: queue_stats,
    })
}

fn main() -> anyhow::Result<()> {
    let args = SimArgs::parse();
    // file values included, so `log-level` from config.toml is honoured
    let config = args.config.clone().build()?;
    init_tracer(Some(config.log_level))?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?;
    let report = rt.block_on(run(args, config))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
