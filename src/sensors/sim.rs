//! Simulated sensor source for bench runs.
//!
//! Drives the snapshot registers with a plausible vehicle track so the
//! full pipeline can be exercised without hardware: a GNSS fix crawling
//! along a heading with speed noise, a jittery IMU, and a slowly
//! draining battery. Selected with `--simulate` on the binary.

use super::SensorHub;
use crate::types::{BatterySection, GpsSection, ImuSection, OrientationSection};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Interval between simulated readings. Faster than the 1 Hz frame
/// cadence so the aggregator always sees fresh data.
const SAMPLE_PERIOD: Duration = Duration::from_millis(500);

/// Delay before the first fix appears, imitating a GNSS cold start.
const FIX_ACQUISITION_DELAY: Duration = Duration::from_secs(2);

/// Degrees of latitude travelled per sample at the nominal speed.
const LAT_STEP_PER_SAMPLE: f64 = 0.000_05;

/// Run the simulated source until cancelled.
pub async fn run_simulated_source(hub: Arc<SensorHub>, cancel: CancellationToken) {
    info!(sample_period_ms = SAMPLE_PERIOD.as_millis() as u64, "Simulated sensor source started");

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(FIX_ACQUISITION_DELAY) => {}
    }
    debug!("Simulated GNSS acquired a fix");

    let mut lat = -11.5632;
    let lon = -47.1704;
    let mut battery_level = 87.0;
    let mut samples: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Simulated sensor source stopped");
                return;
            }
            _ = tokio::time::sleep(SAMPLE_PERIOD) => {}
        }

        samples += 1;
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let mut rng = rand::thread_rng();

        lat += LAT_STEP_PER_SAMPLE + rng.gen_range(-0.000_005..0.000_005);
        let speed = 12.0 + rng.gen_range(-1.5..1.5);

        hub.publish_gps(GpsSection {
            lat,
            lon,
            alt: 285.5 + rng.gen_range(-2.0..2.0),
            speed,
            bearing: 2.0 + rng.gen_range(-3.0..3.0),
            accuracy: rng.gen_range(2.0..6.0),
            satellites: Some(rng.gen_range(7..14)),
            h_acc: Some(rng.gen_range(2.0..6.0)),
            v_acc: Some(rng.gen_range(4.0..9.0)),
            s_acc: Some(rng.gen_range(0.2..0.8)),
            hdop: Some(rng.gen_range(0.7..1.4)),
            vdop: Some(rng.gen_range(1.0..1.9)),
            pdop: Some(rng.gen_range(1.2..2.2)),
            gps_timestamp: Some(now_ms),
            sampled_at: now_ms,
        });

        let (ax, ay, az) = (
            rng.gen_range(-0.4..0.4),
            rng.gen_range(-0.4..0.4),
            9.81 + rng.gen_range(-0.2..0.2),
        );
        let (gx, gy, gz) = (
            rng.gen_range(-0.05..0.05),
            rng.gen_range(-0.05..0.05),
            rng.gen_range(-0.05..0.05),
        );
        hub.publish_imu(ImuSection {
            accel_x: ax,
            accel_y: ay,
            accel_z: az,
            gyro_x: gx,
            gyro_y: gy,
            gyro_z: gz,
            accel_magnitude: ImuSection::magnitude(ax, ay, az),
            gyro_magnitude: ImuSection::magnitude(gx, gy, gz),
            sampled_at: now_ms,
            ..ImuSection::default()
        });

        hub.publish_orientation(OrientationSection {
            azimuth: 2.0 + rng.gen_range(-3.0..3.0),
            pitch: rng.gen_range(-1.5..1.5),
            roll: rng.gen_range(-1.5..1.5),
            rotation_matrix: None,
            sampled_at: now_ms,
        });

        // Battery updates are slow; once a minute is plenty.
        if samples % 120 == 1 {
            battery_level = (battery_level - 0.1f64).max(5.0);
            hub.publish_battery(BatterySection {
                level: battery_level,
                temperature: 31.0 + rng.gen_range(-1.0..1.0),
                status: "discharging".to_string(),
                voltage: 3.9,
                health: "good".to_string(),
                technology: "Li-ion".to_string(),
                charge_counter: None,
                full_capacity: None,
                sampled_at: now_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_source_populates_hub_after_fix_delay() {
        let hub = Arc::new(SensorHub::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_simulated_source(hub.clone(), cancel.clone()));

        // Before the acquisition delay there is no fix
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(hub.gps().is_none());

        // Well after it, all fast slots are live
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(hub.gps().is_some());
        assert!(hub.imu().is_some());
        assert!(hub.orientation().is_some());

        cancel.cancel();
        task.await.unwrap();
    }
}
