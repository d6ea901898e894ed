//! System-wide default constants.
//!
//! Centralises the telemetry pipeline's policy knobs in one place.
//! Grouped by subsystem for easy discovery. None of these are runtime
//! tunable; changing them requires a restart.

use std::time::Duration;

// ============================================================================
// Topics
// ============================================================================

/// Root of every topic the agent publishes under.
pub const BASE_TOPIC: &str = "aura/tracking";

/// Operator registration used on frames when nobody is logged in.
pub const OPERATOR_UNREGISTERED: &str = "unregistered";

// ============================================================================
// Aggregator
// ============================================================================

/// Telemetry frame cadence (frames per second).
pub const PUBLISH_HZ: u64 = 1;

/// Interval between aggregator ticks, derived from [`PUBLISH_HZ`].
pub const TICK_PERIOD: Duration = Duration::from_millis(1_000 / PUBLISH_HZ);

// ============================================================================
// MQTT Session
// ============================================================================

/// Maximum unacknowledged QoS>0 publishes before new ones fail fast
/// with `MaxInFlight`.
pub const MAX_IN_FLIGHT: usize = 20;

/// How long a publish waits for its broker acknowledgment.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// MQTT keep-alive interval.
pub const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Capacity of the rumqttc request channel.
pub const MQTT_CHANNEL_CAPACITY: usize = 64;

/// Wait after issuing `connect()` before checking `is_connected`.
pub const CONNECT_GRACE: Duration = Duration::from_secs(3);

// ============================================================================
// Outbound Queue
// ============================================================================

/// Entries older than this are dropped by maintenance.
///
/// 30 days covers the longest offline window the agent must survive.
pub const QUEUE_TTL: Duration = Duration::from_secs(30 * 24 * 3_600);

/// Hard row cap.
///
/// 3 million rows ≈ 34 days of frames at 1 Hz, so the cap only bites
/// after the TTL has already had its chance.
pub const QUEUE_MAX_ROWS: u64 = 3_000_000;

/// Fill level at which the drain starts warning (~60 % of the cap).
pub const QUEUE_WARNING_ROWS: u64 = QUEUE_MAX_ROWS / 10 * 6;

/// Fill level treated as critical (~85 % of the cap).
pub const QUEUE_CRITICAL_ROWS: u64 = QUEUE_MAX_ROWS / 100 * 85;

/// Entries whose retry count exceeds this are shed by `delete_failed`.
pub const RETRY_CEILING: u32 = 10;

// ============================================================================
// Drain Orchestrator
// ============================================================================

/// Entries fetched per batch during a drain.
pub const BATCH_SIZE: usize = 50;

/// Upper bound on publishes in a single drain execution.
///
/// 2 000 frames ≈ 40 batches, well inside any background-work deadline
/// the host platform imposes.
pub const MAX_MESSAGES_PER_EXECUTION: usize = 2_000;

/// Pause between drain batches to yield CPU to the rest of the device.
pub const INTER_BATCH_DELAY: Duration = Duration::from_millis(50);

/// Cool-down after the broker signals back-pressure (`MaxInFlight`).
pub const INFLIGHT_COOLDOWN: Duration = Duration::from_millis(250);

// ============================================================================
// Schedulers
// ============================================================================

/// Reconnect task period.
pub const RECONNECT_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Queue-flush task period.
pub const QUEUE_FLUSH_PERIOD: Duration = Duration::from_secs(15 * 60);

/// First backoff step after a failed reconnect attempt.
pub const SCHEDULER_BACKOFF_START: Duration = Duration::from_secs(30);

/// Maximum backoff multiplier exponent for scheduler retries.
///
/// `2^4 = 16× base`, capping the reconnect backoff at 8 minutes.
pub const SCHEDULER_MAX_BACKOFF_EXPONENT: u32 = 4;

/// Random jitter added to scheduler periods so a fleet of devices does
/// not wake in lockstep (seconds).
pub const SCHEDULER_JITTER_SECS: u64 = 15;

// ============================================================================
// Supervisor
// ============================================================================

/// Quiescent interval between disconnect and reconnect on an endpoint
/// change, letting the old session close.
pub const ENDPOINT_QUIESCE: Duration = Duration::from_secs(1);

/// Polling fallback interval for endpoint changes in case the watch
/// notification misfires.
pub const ENDPOINT_POLL: Duration = Duration::from_secs(5);

/// How often the supervisor checks that the aggregator task is alive.
pub const PIPELINE_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
