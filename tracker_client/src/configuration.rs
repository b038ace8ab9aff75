use std::{path::PathBuf, str::FromStr, time::Duration};

use bus_tracker_lib::live_state::RegressionPolicy;

use crate::error::ConfigError;

/// Engine settings. Read from a `key = value` file, then overridden by the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub backend_url: String,
    pub push_url: String,
    pub auth_token: Option<String>,

    pub min_distance_meters: f64,
    pub min_time_interval: Duration,
    pub pause_on_report_failure: bool,

    pub distance_regression: RegressionPolicy,

    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,

    pub route_padding: f64,
    pub log_file: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:5001".into(),
            push_url: "ws://localhost:5001/ws".into(),
            auth_token: None,
            min_distance_meters: 50.,
            min_time_interval: Duration::from_millis(15_000),
            pause_on_report_failure: true,
            distance_regression: RegressionPolicy::Monotonic,
            reconnect_initial: Duration::from_millis(1_000),
            reconnect_max: Duration::from_millis(30_000),
            route_padding: 0.1,
            log_file: None,
        }
    }
}

impl TrackerConfig {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax { line: i + 1 });
            };
            config.set(key.trim(), value.trim())?;
        }

        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::parse(&text)
    }

    /// Applies a single setting. Unknown keys are logged and skipped.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "backend_url" => self.backend_url = value.trim_end_matches('/').into(),
            "push_url" => self.push_url = value.into(),
            "auth_token" => self.auth_token = (!value.is_empty()).then(|| value.into()),
            "min_distance_meters" => self.min_distance_meters = parse_value(key, value)?,
            "min_time_interval_ms" => self.min_time_interval = Duration::from_millis(parse_value(key, value)?),
            "pause_on_report_failure" => self.pause_on_report_failure = parse_value(key, value)?,
            "distance_regression" => self.distance_regression = parse_value(key, value)?,
            "reconnect_initial_ms" => self.reconnect_initial = Duration::from_millis(parse_value(key, value)?),
            "reconnect_max_ms" => self.reconnect_max = Duration::from_millis(parse_value(key, value)?),
            "route_padding" => self.route_padding = parse_value(key, value)?,
            "log_file" => self.log_file = (!value.is_empty()).then(|| PathBuf::from(value)),
            _ => {
                tracing::warn!("Unknown config key: {}", key);
            }
        }

        if self.min_distance_meters < 0. {
            return Err(ConfigError::Value {
                key: key.into(),
                reason: "distance threshold must not be negative".into(),
            });
        }
        if self.reconnect_max < self.reconnect_initial {
            self.reconnect_max = self.reconnect_initial;
        }

        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::Value {
        key: key.into(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_with_comments() {
        let text = "
            # driver tablet on line 7
            backend_url = https://buses.example.org/
            push_url = wss://buses.example.org/ws
            auth_token = abc123

            min_distance_meters = 30
            min_time_interval_ms = 10000
            distance_regression = trust
            pause_on_report_failure = false
            something_new = 1
        ";

        let config = TrackerConfig::parse(text).unwrap();
        assert_eq!(config.backend_url, "https://buses.example.org");
        assert_eq!(config.auth_token.as_deref(), Some("abc123"));
        assert_eq!(config.min_distance_meters, 30.);
        assert_eq!(config.min_time_interval, Duration::from_secs(10));
        assert_eq!(config.distance_regression, RegressionPolicy::Trust);
        assert!(!config.pause_on_report_failure);
        assert_eq!(config.route_padding, 0.1);
    }

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(TrackerConfig::parse("").unwrap(), TrackerConfig::default());
    }

    #[test]
    fn rejects_bad_lines_and_values() {
        assert_eq!(
            TrackerConfig::parse("backend_url\n").unwrap_err(),
            ConfigError::Syntax { line: 1 }
        );
        assert!(matches!(
            TrackerConfig::parse("min_time_interval_ms = soon"),
            Err(ConfigError::Value { key, .. }) if key == "min_time_interval_ms"
        ));
        assert!(TrackerConfig::parse("distance_regression = maybe").is_err());
        assert!(TrackerConfig::parse("min_distance_meters = -5").is_err());
    }

    #[test]
    fn reconnect_ceiling_never_below_start() {
        let config = TrackerConfig::parse("reconnect_initial_ms = 5000\nreconnect_max_ms = 100").unwrap();
        assert_eq!(config.reconnect_max, Duration::from_secs(5));
    }
}
