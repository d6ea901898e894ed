//! Frame minter.
//!
//! Assembles one immutable telemetry frame on demand from whatever the
//! snapshot registers currently hold. Every mint allocates a fresh
//! frame id; the id never changes afterwards, no matter how often the
//! frame is retried, which is what makes broker-side deduplication
//! deterministic.

use crate::config::defaults::OPERATOR_UNREGISTERED;
use crate::sensors::SensorHub;
use crate::types::{SystemSection, TelemetryFrame, TransmissionMode};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use uuid::Uuid;

/// Why a mint produced no frame.
#[derive(Debug, thiserror::Error)]
pub enum MintError {
    /// The GPS register is unset. The caller must skip the tick —
    /// frames are never synthesised without a fix.
    #[error("no GPS fix yet")]
    NoFix,

    #[error("frame serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The operator currently assigned to the unit. Swapped atomically on
/// login/logout; read by the minter on every tick.
#[derive(Default)]
pub struct OperatorRegistry {
    registration: ArcSwapOption<String>,
}

impl OperatorRegistry {
    pub fn new(initial: Option<String>) -> Self {
        let registry = Self::default();
        registry.set(initial);
        registry
    }

    pub fn set(&self, registration: Option<String>) {
        self.registration.store(registration.map(Arc::new));
    }

    /// The registration to stamp on frames, falling back to the
    /// sentinel when nobody is logged in.
    pub fn current(&self) -> String {
        self.registration
            .load_full()
            .map(|r| r.as_ref().clone())
            .unwrap_or_else(|| OPERATOR_UNREGISTERED.to_string())
    }
}

/// A frame ready for the wire: id, destination topic, the serialized
/// payload, and the mode it was minted under.
#[derive(Debug, Clone)]
pub struct MintedFrame {
    pub frame_id: Uuid,
    pub topic: String,
    pub mode: TransmissionMode,
    /// Canonical UTF-8 JSON, serialized once at mint.
    pub payload: String,
    frame: TelemetryFrame,
}

impl MintedFrame {
    /// The payload to persist when this frame falls back to the queue.
    ///
    /// A frame minted offline is already tagged `queued`; a frame
    /// minted online whose publish attempt failed is re-tagged before
    /// it enters the queue. Either way the frame id and every other
    /// byte stay identical, and the queued payload never changes again.
    pub fn queued_payload(&self) -> Result<String, serde_json::Error> {
        if self.mode == TransmissionMode::Queued {
            return Ok(self.payload.clone());
        }
        let mut frame = self.frame.clone();
        frame.transmission_mode = TransmissionMode::Queued;
        serde_json::to_string(&frame)
    }
}

pub struct FrameMinter {
    device_id: String,
    topic: String,
    hub: Arc<SensorHub>,
    operator: Arc<OperatorRegistry>,
}

impl FrameMinter {
    pub fn new(
        device_id: &str,
        telemetry_topic: String,
        hub: Arc<SensorHub>,
        operator: Arc<OperatorRegistry>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            topic: telemetry_topic,
            hub,
            operator,
        }
    }

    /// Produce a frame from the current snapshot set.
    ///
    /// `link_up` is the session's connected flag at the moment of the
    /// tick; it decides the embedded transmission mode.
    pub fn mint(&self, link_up: bool) -> Result<MintedFrame, MintError> {
        let gps = self.hub.gps().ok_or(MintError::NoFix)?;

        let battery = self.hub.battery().map(|b| b.as_ref().clone());
        let connectivity = self.hub.connectivity().map(|c| c.as_ref().clone());
        let system = if battery.is_some() || connectivity.is_some() {
            Some(SystemSection { battery, connectivity })
        } else {
            None
        };

        let mode = if link_up {
            TransmissionMode::Online
        } else {
            TransmissionMode::Queued
        };

        let frame = TelemetryFrame {
            message_id: Uuid::new_v4(),
            device_id: self.device_id.clone(),
            matricula: self.operator.current(),
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            transmission_mode: mode,
            gps: gps.as_ref().clone(),
            imu: self.hub.imu().map(|i| i.as_ref().clone()),
            orientation: self.hub.orientation().map(|o| o.as_ref().clone()),
            system,
        };

        let payload = serde_json::to_string(&frame)?;

        Ok(MintedFrame {
            frame_id: frame.message_id,
            topic: self.topic.clone(),
            mode,
            payload,
            frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GpsSection;

    fn hub_with_fix() -> Arc<SensorHub> {
        let hub = Arc::new(SensorHub::new());
        hub.publish_gps(GpsSection {
            lat: -11.5632,
            lon: -47.1704,
            alt: 285.5,
            speed: 10.0,
            bearing: 90.0,
            accuracy: 4.0,
            satellites: Some(8),
            h_acc: None,
            v_acc: None,
            s_acc: None,
            hdop: None,
            vdop: None,
            pdop: None,
            gps_timestamp: None,
            sampled_at: 0,
        });
        hub
    }

    fn minter(hub: Arc<SensorHub>) -> FrameMinter {
        FrameMinter::new(
            "TRK-101",
            "aura/tracking/TRK-101/telemetry".to_string(),
            hub,
            Arc::new(OperatorRegistry::default()),
        )
    }

    #[test]
    fn test_no_fix_skips_the_tick() {
        let minter = minter(Arc::new(SensorHub::new()));
        assert!(matches!(minter.mint(true), Err(MintError::NoFix)));
    }

    #[test]
    fn test_mode_follows_link_state() {
        let minter = minter(hub_with_fix());

        assert_eq!(minter.mint(true).unwrap().mode, TransmissionMode::Online);
        assert_eq!(minter.mint(false).unwrap().mode, TransmissionMode::Queued);
    }

    #[test]
    fn test_frame_ids_are_distinct() {
        let minter = minter(hub_with_fix());
        let a = minter.mint(true).unwrap();
        let b = minter.mint(true).unwrap();
        assert_ne!(a.frame_id, b.frame_id);
    }

    #[test]
    fn test_operator_sentinel_and_login() {
        let hub = hub_with_fix();
        let operator = Arc::new(OperatorRegistry::default());
        let minter = FrameMinter::new(
            "TRK-101",
            "aura/tracking/TRK-101/telemetry".to_string(),
            hub,
            Arc::clone(&operator),
        );

        let anonymous = minter.mint(true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&anonymous.payload).unwrap();
        assert_eq!(value["matricula"], OPERATOR_UNREGISTERED);

        operator.set(Some("4471".to_string()));
        let tagged = minter.mint(true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&tagged.payload).unwrap();
        assert_eq!(value["matricula"], "4471");
    }

    #[test]
    fn test_queued_payload_keeps_identity() {
        let minter = minter(hub_with_fix());
        let frame = minter.mint(true).unwrap();

        let live: serde_json::Value = serde_json::from_str(&frame.payload).unwrap();
        let queued: serde_json::Value =
            serde_json::from_str(&frame.queued_payload().unwrap()).unwrap();

        assert_eq!(live["transmissionMode"], "online");
        assert_eq!(queued["transmissionMode"], "queued");
        // Same identity and content otherwise
        assert_eq!(live["messageId"], queued["messageId"]);
        assert_eq!(live["timestamp"], queued["timestamp"]);
        assert_eq!(live["gps"], queued["gps"]);
    }

    #[test]
    fn test_system_section_absent_without_sources() {
        let minter = minter(hub_with_fix());
        let frame = minter.mint(true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame.payload).unwrap();
        assert!(value["system"].is_null());
    }
}
