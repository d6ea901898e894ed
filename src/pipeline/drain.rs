//! Drain orchestrator.
//!
//! Flushes the outbound queue through the session in FIFO batches. All
//! flushing on the device goes through one try-acquire gate — the
//! periodic scheduler, the connection-transition callback, and operator
//! actions can race to start a drain, but only one ever runs.

use super::events::EventPublisher;
use crate::config::defaults::{
    BATCH_SIZE, INFLIGHT_COOLDOWN, INTER_BATCH_DELAY, MAX_MESSAGES_PER_EXECUTION, RETRY_CEILING,
};
use crate::mqtt::{PublishError, Publisher};
use crate::storage::queue::QueueFill;
use crate::storage::OutboundQueue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one drain execution accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: u64,
    pub failed: u64,
    pub remaining: u64,
}

/// Result of asking for a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A drain ran (possibly partially) and reported its counters.
    Completed(DrainReport),
    /// Another drain holds the gate; nothing was done.
    AlreadyRunning,
    /// The link was down at entry; nothing was done.
    LinkDown,
}

/// Why the batch loop stopped.
enum StopReason {
    QueueEmpty,
    LinkLost,
    BackPressure,
    WholeBatchFailed,
    ExecutionCap,
    Cancelled,
    Storage,
}

pub struct DrainOrchestrator {
    queue: Arc<OutboundQueue>,
    publisher: Arc<dyn Publisher>,
    events: Arc<EventPublisher>,
    gate: Mutex<()>,
    cancel: CancellationToken,
}

impl DrainOrchestrator {
    pub fn new(
        queue: Arc<OutboundQueue>,
        publisher: Arc<dyn Publisher>,
        events: Arc<EventPublisher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            publisher,
            events,
            gate: Mutex::new(()),
            cancel,
        }
    }

    /// Try to run a drain. Returns immediately without blocking when
    /// the gate is held or the link is down.
    pub async fn try_drain(&self) -> DrainOutcome {
        let Ok(_gate) = self.gate.try_lock() else {
            debug!("Drain already in progress, skipping");
            return DrainOutcome::AlreadyRunning;
        };

        if !self.publisher.is_connected() {
            debug!("Link down, drain deferred to reconnect");
            return DrainOutcome::LinkDown;
        }

        self.report_fill_level().await;

        let mut report = DrainReport::default();
        let mut processed: usize = 0;

        let stop = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if !self.publisher.is_connected() {
                break StopReason::LinkLost;
            }

            let batch = match self.queue.oldest(BATCH_SIZE) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "Could not read queue batch");
                    break StopReason::Storage;
                }
            };
            if batch.is_empty() {
                break StopReason::QueueEmpty;
            }

            let mut to_delete: Vec<u64> = Vec::with_capacity(batch.len());
            let mut back_pressure = false;

            for entry in &batch {
                if processed >= MAX_MESSAGES_PER_EXECUTION {
                    break;
                }
                processed += 1;

                match self
                    .publisher
                    .publish_with_result(&entry.topic, entry.payload.as_bytes(), entry.qos)
                    .await
                {
                    Ok(()) => {
                        to_delete.push(entry.seq);
                        report.sent += 1;
                    }
                    Err(PublishError::MaxInFlight(_)) => {
                        // The broker is pushing back; do not hammer the
                        // rest of the batch.
                        report.failed += 1;
                        self.bump_retry(entry.seq);
                        back_pressure = true;
                        break;
                    }
                    Err(e) => {
                        debug!(seq = entry.seq, error = %e, "Publish failed, will retry");
                        report.failed += 1;
                        self.bump_retry(entry.seq);
                    }
                }
            }

            let batch_all_failed = to_delete.is_empty();

            if let Err(e) = self.queue.delete_by_ids(&to_delete) {
                error!(error = %e, "Could not delete published entries");
                break StopReason::Storage;
            }
            if let Err(e) = self.queue.delete_failed(RETRY_CEILING) {
                error!(error = %e, "Retry sweep failed");
            }

            if back_pressure {
                tokio::time::sleep(INFLIGHT_COOLDOWN).await;
                break StopReason::BackPressure;
            }
            if batch_all_failed {
                break StopReason::WholeBatchFailed;
            }
            if processed >= MAX_MESSAGES_PER_EXECUTION {
                break StopReason::ExecutionCap;
            }
            if self.queue.count() == 0 {
                break StopReason::QueueEmpty;
            }

            tokio::time::sleep(INTER_BATCH_DELAY).await;
        };

        report.remaining = self.queue.count();

        match stop {
            StopReason::QueueEmpty => {
                info!(sent = report.sent, failed = report.failed, "Drain complete, queue empty");
            }
            StopReason::LinkLost => {
                info!(sent = report.sent, remaining = report.remaining, "Link lost mid-drain, stopping");
            }
            StopReason::BackPressure => {
                info!(sent = report.sent, remaining = report.remaining, "Broker back-pressure, drain paused");
            }
            StopReason::WholeBatchFailed => {
                warn!(failed = report.failed, remaining = report.remaining, "Entire batch failed, backing off");
            }
            StopReason::ExecutionCap => {
                info!(sent = report.sent, remaining = report.remaining, "Per-execution cap reached");
            }
            StopReason::Cancelled => {
                info!(sent = report.sent, remaining = report.remaining, "Drain cancelled");
            }
            StopReason::Storage => {
                error!(sent = report.sent, remaining = report.remaining, "Drain aborted on storage error");
            }
        }

        DrainOutcome::Completed(report)
    }

    fn bump_retry(&self, seq: u64) {
        if let Err(e) = self.queue.increment_retry(seq) {
            error!(seq, error = %e, "Could not bump retry counter");
        }
    }

    /// Emit telemetry about the queue itself when it is filling up.
    async fn report_fill_level(&self) {
        let count = self.queue.count();
        let mut data = BTreeMap::new();
        data.insert("count".to_string(), count.to_string());

        match self.queue.fill_level() {
            QueueFill::Normal => {}
            QueueFill::Warning => {
                warn!(count, "Outbound queue above warning threshold");
                self.events.emit("queue_warning", data).await;
            }
            QueueFill::Critical => {
                error!(count, "Outbound queue above critical threshold");
                self.events.emit("queue_critical", data).await;
            }
        }
    }
}
