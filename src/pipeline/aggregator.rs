//! Aggregator loop.
//!
//! Drives the pipeline at a fixed 1 Hz regardless of how fast the
//! sensors themselves publish. Scheduling is self-correcting on the
//! monotonic clock: wall-clock jumps (NTP, sleep/wake) never cause
//! back-to-back catch-up ticks, and a slipped loop resets its schedule
//! instead of bursting.

use super::minter::{FrameMinter, MintError, MintedFrame};
use super::PipelineStats;
use crate::config::defaults::TICK_PERIOD;
use crate::mqtt::Publisher;
use crate::storage::OutboundQueue;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// QoS for telemetry frames: at-least-once, deduplicated server-side
/// by frame id.
const FRAME_QOS: u8 = 1;

struct TickTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Aggregator {
    minter: Arc<FrameMinter>,
    publisher: Arc<dyn Publisher>,
    queue: Arc<OutboundQueue>,
    stats: Arc<PipelineStats>,
    task: StdMutex<Option<TickTask>>,
}

impl Aggregator {
    pub fn new(
        minter: Arc<FrameMinter>,
        publisher: Arc<dyn Publisher>,
        queue: Arc<OutboundQueue>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            minter,
            publisher,
            queue,
            stats,
            task: StdMutex::new(None),
        }
    }

    /// Start the tick loop. Idempotent: a running loop is left alone;
    /// a finished-but-not-cleared one is cancelled and replaced.
    pub fn start(&self) {
        let mut task = self.lock_task();

        if let Some(current) = task.as_ref() {
            if !current.handle.is_finished() {
                debug!("Aggregator already running");
                return;
            }
        }
        if let Some(leftover) = task.take() {
            leftover.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_tick_loop(
            Arc::clone(&self.minter),
            Arc::clone(&self.publisher),
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
            cancel.clone(),
        ));

        info!(period_ms = TICK_PERIOD.as_millis() as u64, "Aggregator started");
        *task = Some(TickTask { cancel, handle });
    }

    /// Cancel the tick loop. The task exits at its next suspension
    /// point.
    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.cancel.cancel();
            info!("Aggregator stopped");
        }
    }

    /// Cancel the tick loop and wait for the task to finish. Used at
    /// supervisor teardown so nothing still holds the storage handles.
    pub async fn shutdown(&self) {
        let task = self.lock_task().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
            info!("Aggregator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<TickTask>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_tick_loop(
    minter: Arc<FrameMinter>,
    publisher: Arc<dyn Publisher>,
    queue: Arc<OutboundQueue>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    let mut tick_due = Instant::now() + TICK_PERIOD;

    loop {
        let now = Instant::now();
        if tick_due > now {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(tick_due) => {}
            }
        } else {
            // The loop slipped (CPU throttled, long publish). Reset the
            // schedule rather than firing catch-up ticks.
            tick_due = now;
        }
        tick_due += TICK_PERIOD;

        if cancel.is_cancelled() {
            return;
        }

        stats.ticks.fetch_add(1, Ordering::Relaxed);
        run_tick(&minter, &publisher, &queue, &stats).await;
    }
}

/// Mint one frame and dispatch it: publish when the link is up, fall
/// back to the durable queue on any failure or when offline.
async fn run_tick(
    minter: &FrameMinter,
    publisher: &Arc<dyn Publisher>,
    queue: &OutboundQueue,
    stats: &PipelineStats,
) {
    let link_up = publisher.is_connected();

    let frame = match minter.mint(link_up) {
        Ok(frame) => frame,
        Err(MintError::NoFix) => {
            debug!("No GPS fix yet, tick skipped");
            stats.no_fix_skips.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Err(e) => {
            error!(error = %e, "Mint failed, tick skipped");
            return;
        }
    };

    stats
        .last_mint_ms
        .store(chrono::Utc::now().timestamp_millis() as u64, Ordering::Relaxed);

    if link_up {
        match publisher
            .publish_with_result(&frame.topic, frame.payload.as_bytes(), FRAME_QOS)
            .await
        {
            Ok(()) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                debug!(frame_id = %frame.frame_id, error = %e, "Live publish failed, enqueueing");
            }
        }
    }

    enqueue_frame(&frame, queue, stats);
}

fn enqueue_frame(frame: &MintedFrame, queue: &OutboundQueue, stats: &PipelineStats) {
    let payload = match frame.queued_payload() {
        Ok(payload) => payload,
        Err(e) => {
            error!(frame_id = %frame.frame_id, error = %e, "Could not re-tag frame for the queue");
            return;
        }
    };

    match queue.append(frame.frame_id, &frame.topic, payload, FRAME_QOS) {
        Ok(_) => {
            stats.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            // The frame is lost, but the pipeline stays alive.
            warn!(frame_id = %frame.frame_id, error = %e, "Enqueue failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::minter::OperatorRegistry;
    use crate::pipeline::test_support::MockPublisher;
    use crate::sensors::SensorHub;
    use crate::types::GpsSection;
    use std::time::Duration;

    struct Rig {
        _db: sled::Db,
        _tmp: tempfile::TempDir,
        hub: Arc<SensorHub>,
        publisher: Arc<MockPublisher>,
        queue: Arc<OutboundQueue>,
        stats: Arc<PipelineStats>,
        aggregator: Aggregator,
    }

    fn rig() -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let db = sled::open(tmp.path().join("q.db")).unwrap();
        let queue = Arc::new(OutboundQueue::open(&db).unwrap());
        let hub = Arc::new(SensorHub::new());
        let publisher = Arc::new(MockPublisher::connected());
        let stats = Arc::new(PipelineStats::default());
        let minter = Arc::new(FrameMinter::new(
            "TRK-101",
            "aura/tracking/TRK-101/telemetry".to_string(),
            Arc::clone(&hub),
            Arc::new(OperatorRegistry::default()),
        ));
        let aggregator = Aggregator::new(
            minter,
            publisher.clone() as Arc<dyn crate::mqtt::Publisher>,
            Arc::clone(&queue),
            Arc::clone(&stats),
        );
        Rig {
            _db: db,
            _tmp: tmp,
            hub,
            publisher,
            queue,
            stats,
            aggregator,
        }
    }

    fn fix() -> GpsSection {
        GpsSection {
            lat: -11.5632,
            lon: -47.1704,
            alt: 285.5,
            speed: 10.0,
            bearing: 90.0,
            accuracy: 4.0,
            satellites: None,
            h_acc: None,
            v_acc: None,
            s_acc: None,
            hdop: None,
            vdop: None,
            pdop: None,
            gps_timestamp: None,
            sampled_at: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_five_frames_online() {
        let rig = rig();
        rig.hub.publish_gps(fix());

        rig.aggregator.start();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        rig.aggregator.stop();

        let published = rig.publisher.published();
        assert_eq!(published.len(), 5);
        assert_eq!(rig.queue.count(), 0);

        let mut seen_ids = std::collections::HashSet::new();
        let mut last_ts = 0u64;
        for (topic, payload, qos) in &published {
            assert_eq!(topic, "aura/tracking/TRK-101/telemetry");
            assert_eq!(*qos, 1);
            let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
            assert_eq!(value["transmissionMode"], "online");
            assert!(seen_ids.insert(value["messageId"].as_str().unwrap().to_string()));
            let ts = value["timestamp"].as_u64().unwrap();
            assert!(ts >= last_ts);
            last_ts = ts;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_without_fix_publishes_nothing() {
        let rig = rig();

        rig.aggregator.start();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        rig.aggregator.stop();

        assert!(rig.publisher.published().is_empty());
        assert_eq!(rig.queue.count(), 0);
        assert!(rig.stats.snapshot().no_fix_skips >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_window_enqueues_queued_frames() {
        let rig = rig();
        rig.hub.publish_gps(fix());
        rig.publisher.set_connected(false);

        rig.aggregator.start();
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        rig.aggregator.stop();

        assert_eq!(rig.queue.count(), 10);
        assert_eq!(rig.publisher.attempt_count(), 0);

        for entry in rig.queue.oldest(20).unwrap() {
            let value: serde_json::Value = serde_json::from_str(&entry.payload).unwrap();
            assert_eq!(value["transmissionMode"], "queued");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_live_publish_falls_back_to_queue() {
        let rig = rig();
        rig.hub.publish_gps(fix());
        rig.publisher.script(vec![Err(
            crate::mqtt::PublishError::Other("broken pipe".to_string()),
        )]);

        rig.aggregator.start();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        rig.aggregator.stop();

        let snapshot = rig.stats.snapshot();
        assert_eq!(snapshot.enqueued, 1);
        assert_eq!(snapshot.published, 1);
        assert_eq!(rig.queue.count(), 1);

        // The queued copy is re-tagged but keeps its identity
        let entry = &rig.queue.oldest(1).unwrap()[0];
        let value: serde_json::Value = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(value["transmissionMode"], "queued");
        assert_eq!(value["messageId"], entry.frame_id.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let rig = rig();
        rig.hub.publish_gps(fix());

        rig.aggregator.start();
        rig.aggregator.start();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        rig.aggregator.stop();

        // A doubled loop would publish twice per tick
        assert_eq!(rig.publisher.published().len(), 2);
        assert!(!rig.aggregator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_in_flight_routes_to_queue() {
        let rig = rig();
        rig.hub.publish_gps(fix());
        rig.publisher
            .script(vec![Err(crate::mqtt::PublishError::MaxInFlight(20))]);

        rig.aggregator.start();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        rig.aggregator.stop();

        assert_eq!(rig.queue.count(), 1);
    }
}
