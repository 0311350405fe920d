use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RelabelError;

/// Field name carried by every replacement point
pub const VALUE_FIELD: &str = "value";

/// A raw reading returned by the store
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Closed time interval `[start, end]`.
///
/// The same window bounds both the source read and the supersession delete,
/// so a `Window` is never mutated once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WindowBounds", into = "WindowBounds")]
pub struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct WindowBounds {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Window {
    /// Build a window, rejecting `start > end`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, RelabelError> {
        if start > end {
            return Err(RelabelError::Configuration(format!(
                "window start {} is after window end {}",
                start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                end.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Inclusive on both edges
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

impl TryFrom<WindowBounds> for Window {
    type Error = RelabelError;

    fn try_from(bounds: WindowBounds) -> Result<Self, Self::Error> {
        Window::new(bounds.start, bounds.end)
    }
}

impl From<Window> for WindowBounds {
    fn from(window: Window) -> Self {
        WindowBounds {
            start: window.start,
            end: window.end,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.end.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )
    }
}

/// A synthetic point written for the target measurement
#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementPoint {
    pub measurement: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl ReplacementPoint {
    /// One point per clipped sample, at the sample's exact timestamp
    pub fn from_sample(measurement: &str, sample: &Sample, value: f64) -> Self {
        Self {
            measurement: measurement.to_string(),
            timestamp: sample.timestamp,
            value,
        }
    }
}

/// Organization and bucket a job reads from and writes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub org: String,
    pub bucket: String,
}

/// Fully resolved parameters for one relabeling run
#[derive(Debug, Clone, PartialEq)]
pub struct RelabelJob {
    pub location: BucketRef,
    pub source_measurement: String,
    pub field: String,
    pub target_measurement: String,
    pub window: Window,
    pub value: f64,
}

impl RelabelJob {
    /// Reject jobs the store could only fail on after the target window is cleared
    pub fn validate(&self) -> Result<(), RelabelError> {
        let names = [
            ("bucket", &self.location.bucket),
            ("source measurement", &self.source_measurement),
            ("field", &self.field),
            ("target measurement", &self.target_measurement),
        ];
        for (name, value) in names {
            if value.trim().is_empty() {
                return Err(RelabelError::Configuration(format!("{name} cannot be empty")));
            }
        }
        if !self.value.is_finite() {
            return Err(RelabelError::Configuration(format!(
                "value must be a finite number, got {}",
                self.value
            )));
        }
        Ok(())
    }
}

/// Counts reported after a successful run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelabelReport {
    /// Samples the store returned, including any over-fetch
    pub samples_read: usize,
    /// Samples discarded because they fell outside the window
    pub samples_clipped: usize,
    pub points_written: usize,
}
