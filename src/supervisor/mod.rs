//! Supervision layer.
//!
//! Owns the lifecycle of everything else: the MQTT session, the
//! aggregator, the drain orchestrator, and the periodic schedulers.
//! `start`/`stop` are idempotent and persist the tracking flag so the
//! boot hook can resurrect the pipeline after process death or a
//! device reboot.
//!
//! Recovery is signal-driven: the crash hook (installed once) logs an
//! uncaught fault and raises the restart signal, and a health monitor
//! raises the same signal when any pipeline task dies. A watcher owned
//! by the supervisor turns the signal into a teardown plus a fresh run
//! of the same `start` path; a restart-in-progress guard keeps
//! duplicate requests from racing the bring-up.

mod wake;

pub use wake::WakeGuard;

use crate::config::defaults::{ENDPOINT_POLL, ENDPOINT_QUIESCE, PIPELINE_HEALTH_INTERVAL};
use crate::config::AgentConfig;
use crate::mqtt::{Endpoint, MqttSession, Publisher};
use crate::pipeline::{
    Aggregator, DrainOrchestrator, EventPublisher, FrameMinter, OperatorRegistry, PipelineStats,
    StatsSnapshot,
};
use crate::sensors::SensorHub;
use crate::storage::{SettingsStore, Storage};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A named pipeline task, so the health monitor can say what died.
struct PipelineTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Everything that only exists while the pipeline is up.
struct RunningPipeline {
    cancel: CancellationToken,
    aggregator: Arc<Aggregator>,
    tasks: Vec<PipelineTask>,
    _wake: WakeGuard,
}

/// Point-in-time view of the pipeline for the status surface.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorStatus {
    pub running: bool,
    pub connected: bool,
    pub queue_count: u64,
    pub in_flight: usize,
    pub stats: StatsSnapshot,
}

pub struct Supervisor {
    config: AgentConfig,
    storage: Storage,
    session: Arc<MqttSession>,
    hub: Arc<SensorHub>,
    operator: Arc<OperatorRegistry>,
    minter: Arc<FrameMinter>,
    events: Arc<EventPublisher>,
    stats: Arc<PipelineStats>,
    transitions: broadcast::Sender<bool>,
    running: Mutex<Option<RunningPipeline>>,
    /// Back-reference for tasks that must reach the supervisor.
    self_ref: OnceLock<Weak<Supervisor>>,
    /// Guard against concurrent restart storms.
    restarting: AtomicBool,
}

/// The process-wide restart request. Raised by the crash hook and the
/// health monitor, consumed by the supervisor's restart watcher.
fn restart_signal() -> &'static Notify {
    static SIGNAL: OnceLock<Notify> = OnceLock::new();
    SIGNAL.get_or_init(Notify::new)
}

impl Supervisor {
    pub fn new(config: AgentConfig, storage: Storage) -> Arc<Self> {
        let session = Arc::new(MqttSession::new(&config.device_tag));
        let hub = Arc::new(SensorHub::new());
        let operator = Arc::new(OperatorRegistry::new(storage.settings.operator()));

        let minter = Arc::new(FrameMinter::new(
            &config.device_tag,
            config.telemetry_topic(),
            Arc::clone(&hub),
            Arc::clone(&operator),
        ));
        let events = Arc::new(EventPublisher::new(
            &config.device_tag,
            config.events_topic(),
            Arc::clone(&operator),
            Arc::clone(&session) as Arc<dyn Publisher>,
        ));

        // Bridge the session's sync transition callbacks into a channel
        // the async listener can consume. Registered once; survives
        // start/stop cycles.
        let (transitions, _) = broadcast::channel(16);
        let tx = transitions.clone();
        session.on_transition(Box::new(move |up| {
            let _ = tx.send(up);
        }));

        let supervisor = Arc::new(Self {
            config,
            storage,
            session,
            hub,
            operator,
            minter,
            events,
            stats: Arc::new(PipelineStats::default()),
            transitions,
            running: Mutex::new(None),
            self_ref: OnceLock::new(),
            restarting: AtomicBool::new(false),
        });
        let _ = supervisor.self_ref.set(Arc::downgrade(&supervisor));

        // Lives as long as the supervisor; exits once the last strong
        // reference is gone.
        tokio::spawn(run_restart_watcher(Arc::downgrade(&supervisor)));

        supervisor
    }

    fn weak(&self) -> Weak<Supervisor> {
        self.self_ref.get().cloned().unwrap_or_else(Weak::new)
    }

    /// The register bank the sensor adapters write into.
    pub fn sensor_hub(&self) -> Arc<SensorHub> {
        Arc::clone(&self.hub)
    }

    /// Boot-time contract: resurrect the pipeline iff the persisted
    /// flag says tracking was on when the process last died.
    pub async fn start_if_enabled(&self) -> Result<()> {
        if self.storage.settings.tracking_enabled() {
            info!("Tracking was enabled at last shutdown, resuming");
            self.start().await
        } else {
            info!("Tracking disabled, waiting for start command");
            Ok(())
        }
    }

    /// Bring the pipeline up. Idempotent: a second call while running
    /// is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Supervisor already running");
            return Ok(());
        }

        install_crash_hook();

        self.storage
            .settings
            .set_tracking_enabled(true)
            .context("could not persist the tracking flag")?;

        let wake = WakeGuard::acquire();

        // Endpoint: persisted value wins, static config seeds first boot.
        self.storage
            .settings
            .seed_endpoint_if_missing(Endpoint::new(
                self.config.mqtt_host.clone(),
                self.config.mqtt_port,
            ))
            .context("could not seed the broker endpoint")?;
        if let Some(endpoint) = self.storage.settings.endpoint()? {
            self.session.configure(endpoint).await;
        }
        if let Err(e) = self.session.connect().await {
            // The reconnect scheduler will keep trying; frames queue
            // in the meantime.
            warn!(error = %e, "Initial connect not issued");
        }

        let cancel = CancellationToken::new();

        let drain = Arc::new(DrainOrchestrator::new(
            Arc::clone(&self.storage.queue),
            Arc::clone(&self.session) as Arc<dyn Publisher>,
            Arc::clone(&self.events),
            cancel.child_token(),
        ));

        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&self.minter),
            Arc::clone(&self.session) as Arc<dyn Publisher>,
            Arc::clone(&self.storage.queue),
            Arc::clone(&self.stats),
        ));
        aggregator.start();

        let tasks = vec![
            PipelineTask {
                name: "reconnect",
                handle: tokio::spawn(crate::schedulers::run_reconnect_task(
                    Arc::clone(&self.session),
                    Arc::clone(&drain),
                    Arc::clone(&self.events),
                    cancel.child_token(),
                )),
            },
            PipelineTask {
                name: "queue-flush",
                handle: tokio::spawn(crate::schedulers::run_queue_flush_task(
                    Arc::clone(&self.session),
                    Arc::clone(&self.storage.queue),
                    Arc::clone(&drain),
                    cancel.child_token(),
                )),
            },
            PipelineTask {
                name: "endpoint-watcher",
                handle: tokio::spawn(run_endpoint_watcher(
                    Arc::clone(&self.session),
                    Arc::clone(&self.storage.settings),
                    cancel.child_token(),
                )),
            },
            PipelineTask {
                name: "transition-listener",
                handle: tokio::spawn(run_transition_listener(
                    self.transitions.subscribe(),
                    Arc::clone(&self.storage.queue),
                    Arc::clone(&drain),
                    cancel.child_token(),
                )),
            },
            PipelineTask {
                name: "health-monitor",
                handle: tokio::spawn(run_health_monitor(self.weak(), cancel.child_token())),
            },
        ];

        // The foreground presence: a persistent, user-visible signal
        // that tracking is active. On this build that is the status
        // surface plus the log line.
        info!(device = %self.config.device_tag, "Tracking active");
        self.events
            .emit("status_change", status_data("tracking_started"))
            .await;

        *running = Some(RunningPipeline {
            cancel,
            aggregator,
            tasks,
            _wake: wake,
        });
        Ok(())
    }

    /// Tear the pipeline down. Idempotent; persists `enabled = false`
    /// so the boot hook stays quiet.
    pub async fn stop(&self) -> Result<()> {
        let pipeline = { self.running.lock().await.take() };
        let Some(pipeline) = pipeline else {
            debug!("Supervisor already stopped");
            return Ok(());
        };

        self.storage
            .settings
            .set_tracking_enabled(false)
            .context("could not persist the tracking flag")?;

        self.events
            .emit("status_change", status_data("tracking_stopped"))
            .await;

        self.teardown(pipeline).await;
        info!("Tracking stopped");
        Ok(())
    }

    /// Recovery entry point: tear down whatever is left of the
    /// pipeline and run the same `start` path again. Does not touch
    /// the tracking flag — a crash is not a user stop — and does
    /// nothing when tracking is disabled. Concurrent requests collapse
    /// into one.
    pub async fn restart(&self) {
        if self.restarting.swap(true, Ordering::SeqCst) {
            debug!("Restart already in progress");
            return;
        }

        let pipeline = { self.running.lock().await.take() };
        if let Some(pipeline) = pipeline {
            warn!("Restarting the pipeline");
            self.teardown(pipeline).await;
        }

        if self.storage.settings.tracking_enabled() {
            if let Err(e) = self.start().await {
                error!(error = %e, "Pipeline restart failed");
            }
        } else {
            debug!("Tracking disabled, restart request ignored");
        }

        self.restarting.store(false, Ordering::SeqCst);
    }

    /// Stop every task and close the session. The wake guard is
    /// released when `pipeline` drops at the end.
    async fn teardown(&self, pipeline: RunningPipeline) {
        pipeline.aggregator.shutdown().await;
        pipeline.cancel.cancel();
        for task in pipeline.tasks {
            // Cooperative: each task observes the cancel at its next
            // suspension point.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task.handle).await;
        }
        self.session.disconnect().await;

        if let Err(e) = self.storage.flush() {
            warn!(error = %e, "Final storage flush failed");
        }
    }

    /// Operator control: point the session at a new broker. Persists
    /// immediately; the endpoint watcher performs the
    /// disconnect → reconfigure → connect cycle when running.
    pub async fn update_endpoint(&self, host: &str, port: u16) -> Result<()> {
        self.storage
            .settings
            .set_endpoint(Endpoint::new(host, port))
            .context("could not persist the endpoint")?;
        Ok(())
    }

    /// Operator login/logout. Frames minted from now on carry the new
    /// registration; a discrete event records the change.
    pub async fn set_operator(&self, registration: Option<&str>) -> Result<()> {
        self.storage
            .settings
            .set_operator(registration)
            .context("could not persist the operator")?;
        self.operator.set(registration.map(str::to_string));

        match registration {
            Some(registration) => {
                let mut data = BTreeMap::new();
                data.insert("registration".to_string(), registration.to_string());
                self.events.emit("operator_login", data).await;
            }
            None => {
                self.events.emit("operator_logout", BTreeMap::new()).await;
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            running: self.running.lock().await.is_some(),
            connected: self.session.is_connected(),
            queue_count: self.storage.queue.count(),
            in_flight: self.session.in_flight(),
            stats: self.stats.snapshot(),
        }
    }

    /// Name of the first dead pipeline component, if any.
    async fn dead_component(&self) -> Option<&'static str> {
        let running = self.running.lock().await;
        let pipeline = running.as_ref()?;

        if !pipeline.aggregator.is_running() {
            return Some("aggregator");
        }
        pipeline
            .tasks
            .iter()
            .find(|task| task.handle.is_finished())
            .map(|task| task.name)
    }
}

fn status_data(state: &str) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    data.insert("state".to_string(), state.to_string());
    data
}

/// Install the process-wide crash hook exactly once (the first-run
/// guard against duplicate bring-up). An uncaught fault is logged
/// through tracing, then the restart signal asks the supervisor to
/// come back up through the same start path.
fn install_crash_hook() {
    static CRASH_HOOK: OnceLock<()> = OnceLock::new();
    CRASH_HOOK.get_or_init(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            error!(panic = %panic_info, "Uncaught fault, requesting pipeline restart");
            restart_signal().notify_one();
            default_hook(panic_info);
        }));
    });
}

/// Turn restart requests into an actual teardown + `start()` cycle.
/// Spawned once per supervisor; exits when the supervisor is dropped.
async fn run_restart_watcher(supervisor: Weak<Supervisor>) {
    loop {
        restart_signal().notified().await;
        let Some(supervisor) = supervisor.upgrade() else {
            return;
        };
        supervisor.restart().await;
    }
}

/// Watch every pipeline component — the aggregator and all supervisor
/// tasks (schedulers, watchers, listeners) — and raise the restart
/// signal when one dies. The whole pipeline then cycles through the
/// start path; restarting a single orphaned task would leave the rest
/// of the wiring in an unknown state.
async fn run_health_monitor(supervisor: Weak<Supervisor>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(PIPELINE_HEALTH_INTERVAL) => {}
        }

        let Some(supervisor) = supervisor.upgrade() else {
            return;
        };
        if let Some(component) = supervisor.dead_component().await {
            error!(component, "Pipeline component died, requesting restart");
            restart_signal().notify_one();
        }
    }
}

/// React to endpoint changes: watch notification first, polling
/// fallback second. On a change: disconnect, give the old session a
/// quiescent second to close, reconfigure, reconnect.
async fn run_endpoint_watcher(
    session: Arc<MqttSession>,
    settings: Arc<SettingsStore>,
    cancel: CancellationToken,
) {
    let mut rx = settings.watch_endpoint();
    // The value present at subscription is bootstrap state, already
    // applied by start(); only subsequent changes matter.
    let mut applied: Option<Endpoint> = rx.borrow().clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep(ENDPOINT_POLL) => {}
        }

        let current = match settings.endpoint() {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Could not re-read endpoint");
                continue;
            }
        };
        if applied.as_ref() == Some(&current) {
            continue;
        }

        info!(endpoint = %current, "Endpoint changed, cycling session");
        session.disconnect().await;
        tokio::time::sleep(ENDPOINT_QUIESCE).await;
        session.configure(current.clone()).await;
        if let Err(e) = session.connect().await {
            warn!(error = %e, "Reconnect after endpoint change not issued");
        }
        applied = Some(current);
    }
}

/// Drain as soon as the link comes back, without waiting for the next
/// scheduler period. The gate makes a race with a scheduled drain
/// harmless.
async fn run_transition_listener(
    mut transitions: broadcast::Receiver<bool>,
    queue: Arc<crate::storage::OutboundQueue>,
    drain: Arc<DrainOrchestrator>,
    cancel: CancellationToken,
) {
    loop {
        let up = tokio::select! {
            _ = cancel.cancelled() => return,
            received = transitions.recv() => match received {
                Ok(up) => up,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        };

        if up && queue.count() > 0 {
            info!(pending = queue.count(), "Link restored, draining backlog");
            drain.try_drain().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(tmp: &std::path::Path) -> Arc<Supervisor> {
        let config = AgentConfig {
            device_tag: "TRK-101".to_string(),
            data_dir: tmp.display().to_string(),
            mqtt_host: "127.0.0.1".to_string(),
            // Nothing listens here; the pipeline must run regardless
            mqtt_port: 1,
        };
        let storage = Storage::open(tmp).unwrap();
        Supervisor::new(config, storage)
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_persists_the_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = supervisor(tmp.path());

        supervisor.start().await.unwrap();
        supervisor.start().await.unwrap();

        let status = supervisor.status().await;
        assert!(status.running);
        assert!(supervisor.storage.settings.tracking_enabled());

        supervisor.stop().await.unwrap();
        let status = supervisor.status().await;
        assert!(!status.running);
        assert!(!supervisor.storage.settings.tracking_enabled());

        // Stop again: no-op
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_boot_recovery_follows_the_flag() {
        let tmp = tempfile::tempdir().unwrap();

        {
            let supervisor = supervisor(tmp.path());
            supervisor.start().await.unwrap();
            // Simulated process death: tear the tasks down, then put
            // the flag back the way a crash would have left it
            supervisor.stop().await.unwrap();
            supervisor
                .storage
                .settings
                .set_tracking_enabled(true)
                .unwrap();
        }

        {
            let supervisor = supervisor(tmp.path());
            supervisor.start_if_enabled().await.unwrap();
            assert!(supervisor.status().await.running);
            supervisor.stop().await.unwrap();
        }

        {
            let supervisor = supervisor(tmp.path());
            supervisor.start_if_enabled().await.unwrap();
            assert!(!supervisor.status().await.running);
        }
    }

    #[tokio::test]
    async fn test_restart_recovers_a_dead_component() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = supervisor(tmp.path());
        supervisor.start().await.unwrap();

        // Kill the tick loop the way a fault would
        {
            let running = supervisor.running.lock().await;
            running.as_ref().unwrap().aggregator.stop();
        }
        assert_eq!(supervisor.dead_component().await, Some("aggregator"));

        supervisor.restart().await;

        assert!(supervisor.status().await.running);
        assert_eq!(supervisor.dead_component().await, None);
        // A crash restart never flips the user's intent
        assert!(supervisor.storage.settings.tracking_enabled());

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_respects_a_stopped_pipeline() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = supervisor(tmp.path());

        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();

        // A stray restart request after a user stop stays down
        supervisor.restart().await;
        assert!(!supervisor.status().await.running);
        assert!(!supervisor.storage.settings.tracking_enabled());
    }

    #[tokio::test]
    async fn test_update_endpoint_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = supervisor(tmp.path());

        supervisor.update_endpoint("broker-b.example", 8883).await.unwrap();
        let endpoint = supervisor.storage.settings.endpoint().unwrap().unwrap();
        assert_eq!(endpoint.host, "broker-b.example");
        assert_eq!(endpoint.port, 8883);
    }

    #[tokio::test]
    async fn test_set_operator_reaches_the_minter() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = supervisor(tmp.path());

        assert_eq!(
            supervisor.operator.current(),
            crate::config::defaults::OPERATOR_UNREGISTERED
        );

        supervisor.set_operator(Some("4471")).await.unwrap();
        assert_eq!(supervisor.operator.current(), "4471");
        assert_eq!(supervisor.storage.settings.operator().as_deref(), Some("4471"));

        supervisor.set_operator(None).await.unwrap();
        assert_eq!(
            supervisor.operator.current(),
            crate::config::defaults::OPERATOR_UNREGISTERED
        );
    }
}
