use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::{
    scheduler::{FailureOutcome, Scheduler},
    stats::QueueCounters,
};
use crate::{
    dialer::{DialError, Dialer},
    events::{EventBus, NodeEvent},
};

/// Everything a dial worker shares with the rest of its queue run.
pub(super) struct WorkerContext<D> {
    pub scheduler: Arc<Scheduler>,
    pub dialer: Arc<D>,
    pub events: EventBus,
    pub counters: Arc<QueueCounters>,
    pub dial_timeout: Duration,
}

pub(super) async fn dial_worker<D: Dialer>(
    worker: usize,
    ctx: Arc<WorkerContext<D>>,
    cancel: CancellationToken,
) {
    tracing::trace!(worker, "Dial worker started");
    while let Some(claim) = ctx.scheduler.claim(&cancel).await {
        let peer = claim.peer;
        tracing::debug!(%peer, attempt = claim.attempt, worker, "Dialing keep-alive peer");

        let dial_cancel = cancel.child_token();
        let result = {
            let _in_flight = ctx.counters.dial_started();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = tokio::time::timeout(
                    ctx.dial_timeout,
                    ctx.dialer.open_connection(&peer, dial_cancel.clone()),
                ) => Some(res.unwrap_or(Err(DialError::Timeout))),
            }
        };
        // tells the dialer to drop anything still running for this attempt
        dial_cancel.cancel();

        let Some(result) = result else {
            tracing::debug!(%peer, "Abandoned dial, reconnection queue stopping");
            break;
        };
        if cancel.is_cancelled() {
            tracing::debug!(%peer, "Discarding dial result, reconnection queue stopping");
            break;
        }

        match result {
            Ok(_connection) => {
                if ctx.scheduler.record_success(&peer) {
                    ctx.counters.dial_succeeded();
                    tracing::info!(%peer, attempt = claim.attempt, "Reconnected to keep-alive peer");
                    ctx.events.publish(NodeEvent::PeerReconnected(peer));
                }
            }
            Err(error) => {
                ctx.counters.dial_failed();
                match ctx.scheduler.record_failure(&peer) {
                    FailureOutcome::Retry { attempts, delay } => {
                        tracing::debug!(
                            %peer,
                            %error,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Reconnection attempt failed, backing off"
                        );
                    }
                    FailureOutcome::Exhausted { attempts } => {
                        ctx.counters.attempts_exhausted();
                        tracing::warn!(
                            %peer,
                            %error,
                            attempts,
                            "Giving up on keep-alive peer after repeated failures"
                        );
                        ctx.events.publish(NodeEvent::ReconnectFailed(peer));
                    }
                    FailureOutcome::Discarded => {}
                }
            }
        }
    }
    tracing::trace!(worker, "Dial worker exiting");
}
