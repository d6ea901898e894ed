//! MQTT session management.
//!
//! A single outbound session to the configured broker, owned by the
//! supervisor. The pipeline talks to it through the [`Publisher`] trait
//! so the aggregator and drain orchestrator can be exercised against a
//! scripted broker in tests.
//!
//! ## Design
//!
//! - One `rumqttc::AsyncClient` plus an owned I/O loop task per active
//!   session. The I/O loop keeps the `connected` flag truthful and
//!   correlates broker acknowledgments back to waiting publishers.
//! - `publish_with_result` is synchronous from the caller's viewpoint:
//!   it resolves on PubAck, on timeout, or on connection loss.
//! - An in-flight cap bounds unacknowledged publishes; callers above
//!   the cap fail fast with [`PublishError::MaxInFlight`] and fall back
//!   to the outbound queue instead of stalling the tick.

mod session;

pub use session::MqttSession;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Broker address. Persisted in the settings store and swappable at
/// runtime through `Supervisor::update_endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why a publish did not complete. Nothing in this module panics across
/// the component boundary — every failure becomes one of these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// The link is down; the caller should enqueue instead.
    #[error("not connected to the broker")]
    NotConnected,

    /// Too many unacknowledged publishes; broker-side back-pressure.
    #[error("publish window full ({0} in flight)")]
    MaxInFlight(usize),

    /// No acknowledgment arrived inside the publish timeout.
    #[error("broker did not acknowledge in time")]
    Timeout,

    /// Anything else: request channel closed, connection dropped
    /// mid-flight, malformed topic.
    #[error("publish failed: {0}")]
    Other(String),
}

/// The session surface the pipeline depends on.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish and wait for the broker's acknowledgment (or a terminal
    /// failure). `qos` is the MQTT level, 0-2; the pipeline uses 1.
    async fn publish_with_result(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
    ) -> Result<(), PublishError>;

    /// Fire-and-forget publish for low-rate idempotent events.
    /// Failures are logged, never surfaced.
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8);

    /// Current link state; the source of truth for "can I publish now".
    fn is_connected(&self) -> bool;
}
