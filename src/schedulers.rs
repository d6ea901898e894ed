//! Periodic reconnect and queue-flush tasks.
//!
//! Two independent loops owned by the supervisor. They are the safety
//! net under the event-driven paths: even if every transition callback
//! misfires, the reconnect task re-establishes the session within its
//! period and the queue-flush task applies retention and drains
//! whatever accumulated. Periods carry random jitter so a fleet of
//! devices does not wake in lockstep.

use crate::config::defaults::{
    CONNECT_GRACE, QUEUE_FLUSH_PERIOD, RECONNECT_PERIOD, SCHEDULER_BACKOFF_START,
    SCHEDULER_JITTER_SECS, SCHEDULER_MAX_BACKOFF_EXPONENT,
};
use crate::mqtt::{MqttSession, Publisher};
use crate::pipeline::{DrainOrchestrator, DrainOutcome, EventPublisher};
use crate::storage::OutboundQueue;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exponential backoff step: `base * 2^(attempt-1)`, capped at
/// [`SCHEDULER_MAX_BACKOFF_EXPONENT`].
fn backoff_delay(failed_attempts: u32) -> Duration {
    let exponent = failed_attempts
        .saturating_sub(1)
        .min(SCHEDULER_MAX_BACKOFF_EXPONENT);
    SCHEDULER_BACKOFF_START * 2u32.pow(exponent)
}

fn jittered(period: Duration) -> Duration {
    let jitter = if SCHEDULER_JITTER_SECS > 0 {
        rand::thread_rng().gen_range(0..SCHEDULER_JITTER_SECS)
    } else {
        0
    };
    period + Duration::from_secs(jitter)
}

/// Sleep that returns `true` when cancelled.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Reconnect task (~5 min cadence).
///
/// During healthy windows it emits a qos-0 heartbeat and goes back to
/// sleep. When the link is down it probes name resolution, issues a
/// connect, and — once the session comes back — kicks off a drain
/// immediately instead of waiting for the flush task. Failed attempts
/// back off exponentially from 30 s.
pub async fn run_reconnect_task(
    session: Arc<MqttSession>,
    drain: Arc<DrainOrchestrator>,
    events: Arc<EventPublisher>,
    cancel: CancellationToken,
) {
    info!(period_secs = RECONNECT_PERIOD.as_secs(), "Reconnect task started");
    let mut failed_attempts: u32 = 0;

    loop {
        let period = if failed_attempts == 0 {
            jittered(RECONNECT_PERIOD)
        } else {
            backoff_delay(failed_attempts)
        };
        if sleep_or_cancel(period, &cancel).await {
            return;
        }

        if session.is_connected() {
            failed_attempts = 0;
            events.emit_heartbeat().await;
            debug!("Link healthy, heartbeat sent");
            continue;
        }

        // Cheap connectivity check before burning a connect attempt:
        // if the broker host does not resolve, the network is not there.
        let Some(endpoint) = session.endpoint() else {
            warn!("No endpoint configured, cannot reconnect");
            failed_attempts = failed_attempts.saturating_add(1);
            continue;
        };
        if let Err(e) = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port)).await {
            warn!(host = %endpoint.host, error = %e, "Broker host not resolvable, backing off");
            failed_attempts = failed_attempts.saturating_add(1);
            continue;
        }

        if let Err(e) = session.connect().await {
            warn!(error = %e, "Connect attempt failed to issue");
            failed_attempts = failed_attempts.saturating_add(1);
            continue;
        }

        if sleep_or_cancel(CONNECT_GRACE, &cancel).await {
            return;
        }

        if session.is_connected() {
            info!("Reconnected to broker");
            failed_attempts = 0;
            drain.try_drain().await;
        } else {
            failed_attempts = failed_attempts.saturating_add(1);
            warn!(
                failed_attempts,
                next_retry_secs = backoff_delay(failed_attempts).as_secs(),
                "Reconnect attempt did not come up, backing off"
            );
        }
    }
}

/// Queue-flush task (~15 min cadence).
///
/// Applies retention maintenance every cycle, then drains if there is
/// anything to send. A cycle that moved at least one frame counts as
/// success even if some entries failed; a cycle that could not connect
/// or moved nothing simply retries at the next period.
pub async fn run_queue_flush_task(
    session: Arc<MqttSession>,
    queue: Arc<OutboundQueue>,
    drain: Arc<DrainOrchestrator>,
    cancel: CancellationToken,
) {
    info!(period_secs = QUEUE_FLUSH_PERIOD.as_secs(), "Queue-flush task started");

    loop {
        if sleep_or_cancel(jittered(QUEUE_FLUSH_PERIOD), &cancel).await {
            return;
        }

        if let Err(e) = queue.apply_maintenance() {
            warn!(error = %e, "Queue maintenance failed");
        }

        if queue.count() == 0 {
            debug!("Queue empty, nothing to flush");
            continue;
        }

        if !session.is_connected() {
            if session.connect().await.is_err() {
                debug!("Flush skipped: connect could not be issued, will retry");
                continue;
            }
            if sleep_or_cancel(CONNECT_GRACE, &cancel).await {
                return;
            }
            if !session.is_connected() {
                debug!("Flush skipped: link still down, will retry");
                continue;
            }
        }

        match drain.try_drain().await {
            DrainOutcome::Completed(report) if report.sent > 0 || report.remaining == 0 => {
                debug!(sent = report.sent, remaining = report.remaining, "Flush cycle succeeded");
            }
            DrainOutcome::Completed(report) => {
                warn!(
                    failed = report.failed,
                    remaining = report.remaining,
                    "Flush cycle moved nothing, will retry"
                );
            }
            DrainOutcome::AlreadyRunning | DrainOutcome::LinkDown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_starts_at_base_and_doubles() {
        assert_eq!(backoff_delay(1), SCHEDULER_BACKOFF_START);
        assert_eq!(backoff_delay(2), SCHEDULER_BACKOFF_START * 2);
        assert_eq!(backoff_delay(3), SCHEDULER_BACKOFF_START * 4);
    }

    #[test]
    fn test_backoff_is_capped() {
        let capped = SCHEDULER_BACKOFF_START * 2u32.pow(SCHEDULER_MAX_BACKOFF_EXPONENT);
        assert_eq!(backoff_delay(SCHEDULER_MAX_BACKOFF_EXPONENT + 1), capped);
        assert_eq!(backoff_delay(100), capped);
    }

    #[test]
    fn test_jitter_stays_in_window() {
        for _ in 0..32 {
            let period = jittered(Duration::from_secs(60));
            assert!(period >= Duration::from_secs(60));
            assert!(period < Duration::from_secs(60 + SCHEDULER_JITTER_SECS));
        }
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(sleep_or_cancel(Duration::from_secs(3600), &cancel).await);
    }
}
