//! Sensor snapshot registers.
//!
//! One slot per sensor class, holding the most recent reading the
//! owning adapter published. Slots are lock-free last-writer-wins
//! cells: the writer swaps in a complete value, readers always see a
//! fully published reading, and absence (`None`) is distinct from any
//! zero value. No history is kept — the aggregator samples whatever is
//! current at each tick.

pub mod sim;

use crate::types::{
    BatterySection, ConnectivitySection, GpsSection, ImuSection, OrientationSection,
};
use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// The register bank. Shared between the sensor adapters (writers, one
/// per slot) and the frame minter (reader).
#[derive(Default)]
pub struct SensorHub {
    gps: ArcSwapOption<GpsSection>,
    imu: ArcSwapOption<ImuSection>,
    orientation: ArcSwapOption<OrientationSection>,
    battery: ArcSwapOption<BatterySection>,
    connectivity: ArcSwapOption<ConnectivitySection>,
}

impl SensorHub {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Writers — one dedicated adapter per slot
    // ------------------------------------------------------------------

    pub fn publish_gps(&self, reading: GpsSection) {
        self.gps.store(Some(Arc::new(reading)));
    }

    pub fn publish_imu(&self, reading: ImuSection) {
        self.imu.store(Some(Arc::new(reading)));
    }

    pub fn publish_orientation(&self, reading: OrientationSection) {
        self.orientation.store(Some(Arc::new(reading)));
    }

    pub fn publish_battery(&self, reading: BatterySection) {
        self.battery.store(Some(Arc::new(reading)));
    }

    pub fn publish_connectivity(&self, reading: ConnectivitySection) {
        self.connectivity.store(Some(Arc::new(reading)));
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    pub fn gps(&self) -> Option<Arc<GpsSection>> {
        self.gps.load_full()
    }

    pub fn imu(&self) -> Option<Arc<ImuSection>> {
        self.imu.load_full()
    }

    pub fn orientation(&self) -> Option<Arc<OrientationSection>> {
        self.orientation.load_full()
    }

    pub fn battery(&self) -> Option<Arc<BatterySection>> {
        self.battery.load_full()
    }

    pub fn connectivity(&self) -> Option<Arc<ConnectivitySection>> {
        self.connectivity.load_full()
    }

    /// Clear every slot. Used by tests and by the simulated source when
    /// it replays a cold start.
    pub fn clear(&self) {
        self.gps.store(None);
        self.imu.store(None);
        self.orientation.store(None);
        self.battery.store(None);
        self.connectivity.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(lat: f64) -> GpsSection {
        GpsSection {
            lat,
            lon: -47.17,
            alt: 280.0,
            speed: 0.0,
            bearing: 0.0,
            accuracy: 5.0,
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

    #[test]
    fn test_unset_is_distinct_from_zero() {
        let hub = SensorHub::new();
        assert!(hub.gps().is_none());

        hub.publish_gps(fix(0.0));
        assert!(hub.gps().is_some());
    }

    #[test]
    fn test_last_writer_wins() {
        let hub = SensorHub::new();
        hub.publish_gps(fix(-11.0));
        hub.publish_gps(fix(-12.0));

        let current = hub.gps().unwrap();
        assert!((current.lat - -12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reader_keeps_old_value_across_overwrite() {
        let hub = SensorHub::new();
        hub.publish_gps(fix(-11.0));

        let held = hub.gps().unwrap();
        hub.publish_gps(fix(-12.0));

        // The snapshot taken before the overwrite is still intact
        assert!((held.lat - -11.0).abs() < f64::EPSILON);
        assert!((hub.gps().unwrap().lat - -12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clear_resets_all_slots() {
        let hub = SensorHub::new();
        hub.publish_gps(fix(-11.0));
        hub.publish_imu(ImuSection::default());
        hub.clear();
        assert!(hub.gps().is_none());
        assert!(hub.imu().is_none());
    }
}
