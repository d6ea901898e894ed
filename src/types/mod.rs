//! Core data types for the telemetry pipeline.

pub mod telemetry;

pub use telemetry::{
    BatterySection, CellInfo, CellularSection, ConnectivitySection, GpsSection, ImuSection,
    OrientationSection, SignalStrength, SystemSection, TelemetryEvent, TelemetryFrame,
    TransmissionMode, WifiSection,
};
