use std::{path::PathBuf, sync::Arc};

use bus_tracker_lib::position::PositionSample;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines},
    sync::{mpsc, Mutex, OwnedMutexGuard},
    task::JoinHandle,
};

use crate::error::SensorError;

pub type SensorReading = Result<PositionSample, SensorError>;

/// Device location capability.
#[async_trait::async_trait]
pub trait LocationSensor: Send + Sync {
    /// A single fix, used to seed a new trip.
    async fn current_position(&self) -> Result<PositionSample, SensorError>;

    /// Continuous readings until the subscription is dropped.
    async fn subscribe(&self) -> Result<SensorSubscription, SensorError>;
}

/// A live sensor watch. Dropping it releases the sensor.
pub struct SensorSubscription {
    readings: mpsc::Receiver<SensorReading>,
    reader: Option<JoinHandle<()>>,
}

impl SensorSubscription {
    pub fn new(readings: mpsc::Receiver<SensorReading>, reader: Option<JoinHandle<()>>) -> Self {
        Self { readings, reader }
    }

    pub async fn next(&mut self) -> Option<SensorReading> {
        self.readings.recv().await
    }
}

impl Drop for SensorSubscription {
    fn drop(&mut self) {
        self.readings.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Where NMEA sentences come from.
#[derive(Debug, Clone, PartialEq)]
pub enum NmeaSource {
    Stdin,
    /// A log file or a serial device node.
    Path(PathBuf),
}

impl From<&str> for NmeaSource {
    fn from(value: &str) -> Self {
        if value == "-" {
            NmeaSource::Stdin
        } else {
            NmeaSource::Path(value.into())
        }
    }
}

/// Reads `GGA` fixes from an NMEA-0183 stream.
///
/// The source is opened once and shared: `current_position` and later
/// subscriptions continue from wherever the previous reader stopped.
pub struct NmeaSensor {
    source: NmeaSource,
    reader: Arc<Mutex<Option<FixReader>>>,
}

impl NmeaSensor {
    pub fn new(source: NmeaSource) -> Self {
        Self {
            source,
            reader: Arc::new(Mutex::new(None)),
        }
    }

    /// Exclusive access to the stream, opening it on first use.
    async fn reader(&self) -> Result<OwnedMutexGuard<Option<FixReader>>, SensorError> {
        let mut guard = self.reader.clone().lock_owned().await;
        if guard.is_none() {
            *guard = Some(FixReader::new(self.open().await?));
        }
        Ok(guard)
    }

    async fn open(&self) -> Result<Box<dyn AsyncBufRead + Send + Unpin>, SensorError> {
        match &self.source {
            NmeaSource::Stdin => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
            NmeaSource::Path(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|err| match err.kind() {
                    std::io::ErrorKind::PermissionDenied => SensorError::PermissionDenied,
                    _ => SensorError::Unavailable(format!("{}: {err}", path.display())),
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
        }
    }
}

#[async_trait::async_trait]
impl LocationSensor for NmeaSensor {
    async fn current_position(&self) -> Result<PositionSample, SensorError> {
        let mut guard = self.reader().await?;
        match guard.as_mut() {
            Some(reader) => reader.next_fix().await,
            None => Err(SensorError::StreamEnded),
        }
    }

    async fn subscribe(&self) -> Result<SensorSubscription, SensorError> {
        let guard = self.reader().await?;
        let (tx, rx) = mpsc::channel(32);
        let handle = tokio::spawn(read_fixes(guard, tx));
        Ok(SensorSubscription::new(rx, Some(handle)))
    }
}

struct FixReader {
    lines: Lines<Box<dyn AsyncBufRead + Send + Unpin>>,
    clock: FixClock,
}

impl FixReader {
    fn new(reader: Box<dyn AsyncBufRead + Send + Unpin>) -> Self {
        Self {
            lines: reader.lines(),
            clock: FixClock::default(),
        }
    }

    async fn next_fix(&mut self) -> SensorReading {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(sample) = parse_fix(&line, &mut self.clock) {
                        return Ok(sample);
                    }
                }
                Ok(None) => return Err(SensorError::StreamEnded),
                Err(err) => return Err(SensorError::Unavailable(err.to_string())),
            }
        }
    }
}

// Holds the stream for as long as the subscription lives
async fn read_fixes(mut guard: OwnedMutexGuard<Option<FixReader>>, tx: mpsc::Sender<SensorReading>) {
    let Some(reader) = guard.as_mut() else {
        return;
    };
    loop {
        let reading = reader.next_fix().await;
        let done = reading.is_err();
        if tx.send(reading).await.is_err() || done {
            break;
        }
    }
}

/// Dates GGA fixes, which only carry the time of day.
///
/// Starts on the current UTC date and moves to the next day when the time of
/// day wraps around midnight.
#[derive(Debug, Clone)]
pub struct FixClock {
    date: NaiveDate,
    last: Option<NaiveTime>,
}

impl Default for FixClock {
    fn default() -> Self {
        Self::new(Utc::now().date_naive())
    }
}

impl FixClock {
    pub fn new(date: NaiveDate) -> Self {
        Self { date, last: None }
    }

    pub fn stamp(&mut self, time: NaiveTime) -> DateTime<Utc> {
        if let Some(last) = self.last {
            // A small step back is a repeated or reordered sentence, not a new day
            if last - time > chrono::Duration::hours(12) {
                self.date = self.date.succ_opt().unwrap_or(self.date);
            }
        }
        self.last = Some(time);
        self.date.and_time(time).and_utc()
    }
}

/// Turns one NMEA line into a sample. Anything that is not a usable GGA fix
/// yields `None`.
pub fn parse_fix(line: &str, clock: &mut FixClock) -> Option<PositionSample> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let gga = match nmea::parse_str(line) {
        Ok(nmea::ParseResult::GGA(gga)) => gga,
        Ok(_) => return None,
        Err(err) => {
            tracing::debug!("Skipping NMEA line {:?}: {:?}", line, err);
            return None;
        }
    };

    // No fix means empty coordinates
    let (Some(latitude), Some(longitude)) = (gga.latitude, gga.longitude) else {
        return None;
    };

    let timestamp = match gga.fix_time {
        Some(time) => clock.stamp(time),
        None => Utc::now(),
    };

    Some(PositionSample {
        latitude,
        longitude,
        timestamp,
        heading: None,
        accuracy: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIX: &str = "$GPGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*76";

    #[test]
    fn parses_gga_fix() {
        let sample = parse_fix(FIX, &mut FixClock::default()).unwrap();
        assert!((sample.latitude - 53.361336).abs() < 1e-5);
        assert!((sample.longitude + 6.50562).abs() < 1e-5);
        assert_eq!(sample.timestamp.time(), NaiveTime::from_hms_opt(9, 27, 50).unwrap());
    }

    #[test]
    fn skips_noise() {
        let mut clock = FixClock::default();
        assert!(parse_fix("", &mut clock).is_none());
        assert!(parse_fix("hello", &mut clock).is_none());
        // No fix yet: empty position fields
        assert!(parse_fix("$GPGGA,092750.000,,,,,0,0,,,M,,M,,*41", &mut clock).is_none());
    }

    #[tokio::test]
    async fn reads_fixes_from_file_until_the_end() {
        let path = std::env::temp_dir().join(format!("nmea-{}.log", std::process::id()));
        tokio::fs::write(&path, format!("garbage\n{FIX}\n{FIX}\n")).await.unwrap();

        let sensor = NmeaSensor::new(NmeaSource::Path(path.clone()));
        let mut subscription = sensor.subscribe().await.unwrap();
        assert!(subscription.next().await.unwrap().is_ok());
        assert!(subscription.next().await.unwrap().is_ok());
        assert_eq!(subscription.next().await.unwrap(), Err(SensorError::StreamEnded));

        tokio::fs::remove_file(path).await.unwrap();
    }

    #[test]
    fn fixes_past_midnight_move_to_the_next_day() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut clock = FixClock::new(day);
        let at = |h, m, s| NaiveTime::from_hms_opt(h, m, s).unwrap();

        let before = clock.stamp(at(23, 59, 50));
        let after = clock.stamp(at(0, 0, 5));
        assert_eq!(before.date_naive(), day);
        assert_eq!(after.date_naive(), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
        assert_eq!((after - before).num_seconds(), 15);

        // A repeated older sentence stays on the same day
        assert_eq!(clock.stamp(at(0, 0, 1)).date_naive(), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[tokio::test]
    async fn first_fix_is_not_replayed_to_the_subscription() {
        let path = std::env::temp_dir().join(format!("nmea-shared-{}.log", std::process::id()));
        let second = "$GPGGA,092751.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*77";
        tokio::fs::write(&path, format!("{FIX}\n{second}\n")).await.unwrap();

        let sensor = NmeaSensor::new(NmeaSource::Path(path.clone()));
        let first = sensor.current_position().await.unwrap();
        assert_eq!(first.timestamp.time(), NaiveTime::from_hms_opt(9, 27, 50).unwrap());

        let mut subscription = sensor.subscribe().await.unwrap();
        let next = subscription.next().await.unwrap().unwrap();
        assert_eq!(next.timestamp.time(), NaiveTime::from_hms_opt(9, 27, 51).unwrap());
        assert_eq!(subscription.next().await.unwrap(), Err(SensorError::StreamEnded));

        tokio::fs::remove_file(path).await.unwrap();
    }

    #[tokio::test]
    async fn missing_device_is_unavailable() {
        let sensor = NmeaSensor::new(NmeaSource::from("/nonexistent/ttyUSB9"));
        assert!(matches!(sensor.subscribe().await, Err(SensorError::Unavailable(_))));
    }
}
