//! AURA Tracker: vehicle telemetry agent
//!
//! Samples the device's sensors into snapshot registers, assembles one
//! telemetry frame per second, and publishes frames to an MQTT broker.
//! When the broker is unreachable, frames are buffered in a durable
//! on-disk queue for up to 30 days and drained FIFO on reconnect;
//! every frame carries a UUID so the server deduplicates replays.
//!
//! ## Architecture
//!
//! - **Sensors**: lock-free last-writer-wins snapshot registers
//! - **Pipeline**: frame minter, 1 Hz aggregator loop, drain orchestrator
//! - **MQTT**: single managed session with publish-with-result and an
//!   in-flight cap
//! - **Storage**: sled-backed outbound queue + persistent settings
//! - **Supervisor**: lifecycle, boot recovery, crash hook, schedulers

pub mod config;
pub mod mqtt;
pub mod pipeline;
pub mod schedulers;
pub mod sensors;
pub mod storage;
pub mod supervisor;
pub mod types;

// Re-export the agent's operational surface
pub use config::AgentConfig;
pub use mqtt::{Endpoint, MqttSession, PublishError, Publisher};
pub use pipeline::{
    Aggregator, DrainOrchestrator, DrainOutcome, DrainReport, EventPublisher, FrameMinter,
    MintError, MintedFrame, OperatorRegistry, PipelineStats, StatsSnapshot,
};
pub use sensors::SensorHub;
pub use storage::{
    LockError, OutboundQueue, ProcessLock, QueueEntry, SettingsStore, Storage, StorageError,
};
pub use supervisor::{Supervisor, SupervisorStatus};
pub use types::{TelemetryEvent, TelemetryFrame, TransmissionMode};
