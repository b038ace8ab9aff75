use std::{sync::Arc, time::Duration};

use bus_tracker_lib::position::{LngLat, PositionSample};
use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    configuration::TrackerConfig,
    error::SensorError,
    sensor::LocationSensor,
    session::{ClientEvent, Generation},
};

/// Time/distance gate in front of the position reports.
///
/// The first sample only sets the baseline. After that a sample passes when it
/// is more than `min_distance_meters` away from, or more than
/// `min_time_interval` later than, the last sample that passed. A passing sample
/// becomes the new baseline.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_distance_meters: f64,
    min_time_interval: Duration,
    last: Option<(LngLat, DateTime<Utc>)>,
}

impl Throttle {
    pub fn new(min_distance_meters: f64, min_time_interval: Duration) -> Self {
        Self {
            min_distance_meters,
            min_time_interval,
            last: None,
        }
    }

    pub fn offer(&mut self, sample: &PositionSample) -> bool {
        let position = sample.position();

        let Some((last_position, last_time)) = self.last else {
            self.last = Some((position, sample.timestamp));
            tracing::debug!("Baseline sample at {:?}", position);
            return false;
        };

        let distance = last_position.distance_to(&position);
        let elapsed_ms = (sample.timestamp - last_time).num_milliseconds();
        let min_ms = i64::try_from(self.min_time_interval.as_millis()).unwrap_or(i64::MAX);

        let emit = distance > self.min_distance_meters || elapsed_ms > min_ms;
        tracing::debug!(
            "Sample {:.1} m / {} ms from last report: {}",
            distance,
            elapsed_ms,
            if emit { "report" } else { "skip" }
        );

        if emit {
            self.last = Some((position, sample.timestamp));
        }
        emit
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Watches the location sensor while reporting is on and forwards the samples
/// worth reporting to the session loop.
pub struct GeoSampler {
    sensor: Arc<dyn LocationSensor>,
    min_distance_meters: f64,
    min_time_interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl GeoSampler {
    pub fn new(sensor: Arc<dyn LocationSensor>, config: &TrackerConfig) -> Self {
        Self {
            sensor,
            min_distance_meters: config.min_distance_meters,
            min_time_interval: config.min_time_interval,
            task: None,
        }
    }

    /// Starts sampling with a fresh baseline. A running sampler is stopped first.
    pub fn start(&mut self, generation: Generation, events: mpsc::UnboundedSender<ClientEvent>) {
        self.stop();

        let sensor = self.sensor.clone();
        let throttle = Throttle::new(self.min_distance_meters, self.min_time_interval);
        self.task = Some(tokio::spawn(sample_loop(sensor, throttle, generation, events)));
        tracing::info!("Sampler started");
    }

    /// Releases the sensor subscription. Safe to call when already stopped.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Sampler stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for GeoSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sample_loop(
    sensor: Arc<dyn LocationSensor>,
    mut throttle: Throttle,
    generation: Generation,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let error = match sensor.subscribe().await {
        Ok(mut subscription) => loop {
            match subscription.next().await {
                Some(Ok(sample)) => {
                    if throttle.offer(&sample)
                        && events.send(ClientEvent::Sample { generation, sample }).is_err()
                    {
                        return;
                    }
                }
                Some(Err(error)) => break error,
                None => break SensorError::StreamEnded,
            }
        },
        Err(error) => error,
    };

    tracing::warn!("Sampling stopped: {}", error);
    let _ = events.send(ClientEvent::SensorFailed { generation, error });
}

#[cfg(test)]
mod tests {
    use bus_tracker_lib::position::offset_north;
    use chrono::TimeZone;

    use super::*;

    fn sample_at(origin: LngLat, meters_north: f64, ms: i64) -> PositionSample {
        let at = offset_north(origin, meters_north);
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        PositionSample::new(at.latitude, at.longitude, t0 + chrono::Duration::milliseconds(ms))
    }

    #[test]
    fn first_sample_is_only_a_baseline() {
        let origin = LngLat::new(-44.3, -23.0);
        let mut throttle = Throttle::new(50., Duration::from_millis(15_000));
        assert!(!throttle.offer(&sample_at(origin, 500., 0)));
        assert!(throttle.offer(&sample_at(origin, 0., 1_000)));
    }

    #[test]
    fn thresholds_are_strict() {
        let origin = LngLat::new(-44.3, -23.0);
        let mut throttle = Throttle::new(50., Duration::from_millis(15_000));
        throttle.offer(&sample_at(origin, 0., 0));

        // Exactly on the time threshold is not past it
        assert!(!throttle.offer(&sample_at(origin, 0., 15_000)));
        assert!(throttle.offer(&sample_at(origin, 0., 15_001)));
    }

    #[test]
    fn distance_is_measured_from_last_report() {
        let origin = LngLat::new(-44.3, -23.0);
        let mut throttle = Throttle::new(50., Duration::from_millis(15_000));
        throttle.offer(&sample_at(origin, 0., 0));

        assert!(!throttle.offer(&sample_at(origin, 30., 1_000)));
        // 60 m from the baseline even though only 30 m from the previous sample
        assert!(throttle.offer(&sample_at(origin, 60., 2_000)));
        assert!(!throttle.offer(&sample_at(origin, 100., 3_000)));
    }

    #[test]
    fn reset_restores_baseline_behaviour() {
        let origin = LngLat::new(-44.3, -23.0);
        let mut throttle = Throttle::new(50., Duration::from_millis(15_000));
        throttle.offer(&sample_at(origin, 0., 0));
        throttle.reset();
        assert!(!throttle.offer(&sample_at(origin, 1_000., 60_000)));
    }
}
