use anyhow::{Context, Result};
use chrono::{DateTime, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::RelabelError;
use crate::influx::client::DEFAULT_TIMEOUT_SECONDS;
use crate::models::{BucketRef, RelabelJob, VALUE_FIELD, Window};
use crate::writer::DEFAULT_BATCH_SIZE;

/// Local-time format accepted for `start` and `end`, besides RFC 3339
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Store endpoint and credentials
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub token: String,
}

/// Everything one invocation needs, as read from YAML and flags
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RelabelConfig {
    pub influxdb: InfluxConfig,
    pub bucket: String,
    pub source_measurement: String,
    pub field: String,
    /// Target measurement name
    pub measurement: String,
    pub value: f64,
    pub start: Option<String>,
    pub end: Option<String>,
    pub batch_size: usize,
    pub timeout_seconds: u64,
    pub create_bucket: bool,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            influxdb: InfluxConfig::default(),
            bucket: String::new(),
            source_measurement: String::new(),
            field: VALUE_FIELD.to_string(),
            measurement: String::new(),
            value: 0.0,
            start: None,
            end: None,
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            create_bucket: false,
        }
    }
}

/// Per-field overrides, typically from command-line flags
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bucket: Option<String>,
    pub source_measurement: Option<String>,
    pub field: Option<String>,
    pub measurement: Option<String>,
    pub value: Option<f64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub batch_size: Option<usize>,
    pub create_bucket: bool,
}

impl RelabelConfig {
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bucket) = overrides.bucket {
            self.bucket = bucket;
        }
        if let Some(source_measurement) = overrides.source_measurement {
            self.source_measurement = source_measurement;
        }
        if let Some(field) = overrides.field {
            self.field = field;
        }
        if let Some(measurement) = overrides.measurement {
            self.measurement = measurement;
        }
        if let Some(value) = overrides.value {
            self.value = value;
        }
        if let Some(start) = overrides.start {
            self.start = Some(start);
        }
        if let Some(end) = overrides.end {
            self.end = Some(end);
        }
        if let Some(batch_size) = overrides.batch_size {
            self.batch_size = batch_size;
        }
        self.create_bucket |= overrides.create_bucket;
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Validate and turn the configuration into a runnable job
    pub fn resolve(&self) -> Result<RelabelJob, RelabelError> {
        validate_config(self)?;

        let start = parse_instant("start", self.start.as_deref())?;
        let end = parse_instant("end", self.end.as_deref())?;
        let window = Window::new(start, end)?;

        Ok(RelabelJob {
            location: BucketRef {
                org: self.influxdb.org.clone(),
                bucket: self.bucket.clone(),
            },
            source_measurement: self.source_measurement.clone(),
            field: self.field.clone(),
            target_measurement: self.measurement.clone(),
            window,
            value: self.value,
        })
    }
}

/// Load configuration from a YAML file. Validation happens in [`RelabelConfig::resolve`],
/// after flag overrides are applied.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RelabelConfig> {
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let config: RelabelConfig =
        serde_yaml_ng::from_str(&content).with_context(|| "Failed to parse YAML configuration")?;
    Ok(config)
}

/// Write an example configuration file. Refuses to overwrite.
pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        anyhow::bail!("Configuration file already exists: {}", path.display());
    }

    let example = RelabelConfig {
        influxdb: InfluxConfig {
            url: "http://localhost:8086".to_string(),
            org: "my-org".to_string(),
            token: "my-token".to_string(),
        },
        bucket: "test".to_string(),
        source_measurement: "Vehicle speed".to_string(),
        measurement: "test".to_string(),
        start: Some("2006-01-02 15:04:05".to_string()),
        end: Some("2006-01-02 15:04:05".to_string()),
        ..Default::default()
    };
    let yaml = serde_yaml_ng::to_string(&example)
        .with_context(|| "Failed to serialize example configuration")?;
    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

pub(crate) fn validate_config(config: &RelabelConfig) -> Result<(), RelabelError> {
    let required = [
        ("influxdb.url", &config.influxdb.url),
        ("influxdb.org", &config.influxdb.org),
        ("influxdb.token", &config.influxdb.token),
        ("bucket", &config.bucket),
        ("source_measurement", &config.source_measurement),
        ("field", &config.field),
        ("measurement", &config.measurement),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(RelabelError::Configuration(format!("{name} cannot be empty")));
        }
    }

    if !config.value.is_finite() {
        return Err(RelabelError::Configuration(format!(
            "value must be a finite number, got {}",
            config.value
        )));
    }

    if config.batch_size == 0 {
        return Err(RelabelError::Configuration(
            "batch_size must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Parse RFC 3339, or `YYYY-MM-DD HH:MM:SS` in the local time zone
pub fn parse_instant(name: &str, value: Option<&str>) -> Result<DateTime<Utc>, RelabelError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RelabelError::Configuration(format!("{name} time is required")))?;

    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(value, LOCAL_TIME_FORMAT).map_err(|e| {
        RelabelError::Configuration(format!(
            "{name} time {value:?} is neither RFC 3339 nor \"YYYY-MM-DD HH:MM:SS\": {e}"
        ))
    })?;

    match Local.from_local_datetime(&naive) {
        LocalResult::Single(instant) => Ok(instant.with_timezone(&Utc)),
        LocalResult::Ambiguous(_, _) => Err(RelabelError::Configuration(format!(
            "{name} time {value:?} is ambiguous in the local time zone"
        ))),
        LocalResult::None => Err(RelabelError::Configuration(format!(
            "{name} time {value:?} does not exist in the local time zone"
        ))),
    }
}
