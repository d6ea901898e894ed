//! Discrete event publishing.
//!
//! Low-rate, idempotent events (operator login, tracking status, queue
//! threshold crossings, heartbeats) go out fire-and-forget on the
//! events topic. They share the frame envelope but are never queued —
//! a lost event is acceptable, a stalled pipeline is not.

use super::minter::OperatorRegistry;
use crate::mqtt::Publisher;
use crate::types::TelemetryEvent;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default QoS for events.
const EVENT_QOS: u8 = 1;

/// Heartbeats are best-effort and unkeyed; qos 0, throwaway id.
const HEARTBEAT_QOS: u8 = 0;

pub struct EventPublisher {
    device_id: String,
    topic: String,
    operator: Arc<OperatorRegistry>,
    publisher: Arc<dyn Publisher>,
}

impl EventPublisher {
    pub fn new(
        device_id: &str,
        events_topic: String,
        operator: Arc<OperatorRegistry>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            topic: events_topic,
            operator,
            publisher,
        }
    }

    /// Emit a discrete event. Failures are logged by the session and
    /// otherwise ignored.
    pub async fn emit(&self, event_type: &str, data: BTreeMap<String, String>) {
        let event = TelemetryEvent::new(
            &self.device_id,
            &self.operator.current(),
            event_type,
            data,
        );
        self.send(&event, EVENT_QOS).await;
    }

    /// Emit a heartbeat during healthy windows.
    pub async fn emit_heartbeat(&self) {
        let event = TelemetryEvent::new(
            &self.device_id,
            &self.operator.current(),
            "heartbeat",
            BTreeMap::new(),
        );
        self.send(&event, HEARTBEAT_QOS).await;
    }

    async fn send(&self, event: &TelemetryEvent, qos: u8) {
        match serde_json::to_vec(event) {
            Ok(payload) => self.publisher.publish(&self.topic, &payload, qos).await,
            Err(e) => tracing::error!(error = %e, "Event serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::MockPublisher;

    #[tokio::test]
    async fn test_event_goes_to_events_topic() {
        let publisher = Arc::new(MockPublisher::connected());
        let events = EventPublisher::new(
            "TRK-101",
            "aura/tracking/TRK-101/events".to_string(),
            Arc::new(OperatorRegistry::default()),
            publisher.clone(),
        );

        let mut data = BTreeMap::new();
        data.insert("registration".to_string(), "4471".to_string());
        events.emit("operator_login", data).await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "aura/tracking/TRK-101/events");
        assert_eq!(published[0].2, 1);

        let value: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(value["eventType"], "operator_login");
    }

    #[tokio::test]
    async fn test_heartbeat_is_qos0() {
        let publisher = Arc::new(MockPublisher::connected());
        let events = EventPublisher::new(
            "TRK-101",
            "aura/tracking/TRK-101/events".to_string(),
            Arc::new(OperatorRegistry::default()),
            publisher.clone(),
        );

        events.emit_heartbeat().await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].2, 0);
    }
}
