//! In-memory [`TimeSeriesStore`] for tests and dry runs.
//!
//! Series are keyed by (bucket, measurement, field). Every call is recorded
//! in an operation log so callers can check the order in which the
//! pipeline queried, deleted and wrote. Failures and store-side quirks
//! (over-fetch, missing result sets, slow requests) can be injected.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::models::{BucketRef, ReplacementPoint, Sample, VALUE_FIELD, Window};
use crate::store::{SampleStream, TimeSeriesStore};

type SeriesKey = (String, String, String);

/// One recorded store call
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Query {
        measurement: String,
        field: String,
    },
    Delete {
        measurement: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Write {
        measurement: String,
        points: usize,
    },
}

#[derive(Default)]
struct MemoryState {
    series: BTreeMap<SeriesKey, BTreeMap<DateTime<Utc>, f64>>,
    ops: Vec<StoreOp>,
    writes_accepted: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    overfetch: Option<Duration>,
    latency: Option<std::time::Duration>,
    no_result: bool,
    delete_failure: Option<String>,
    write_failure: Option<(usize, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widen every query range by `margin` on both sides
    pub fn with_overfetch(mut self, margin: Duration) -> Self {
        self.overfetch = Some(margin);
        self
    }

    /// Hold every delete and write request for `latency` before applying it
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer queries with no result set at all
    pub fn without_result(mut self) -> Self {
        self.no_result = true;
        self
    }

    /// Reject every delete request
    pub fn fail_delete(mut self, message: &str) -> Self {
        self.delete_failure = Some(message.to_string());
        self
    }

    /// Accept `batches` write requests, then reject the rest
    pub fn fail_write_after(mut self, batches: usize, message: &str) -> Self {
        self.write_failure = Some((batches, message.to_string()));
        self
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(
        &self,
        bucket: &str,
        measurement: &str,
        field: &str,
        timestamp: DateTime<Utc>,
        value: f64,
    ) {
        self.lock()
            .series
            .entry((bucket.to_string(), measurement.to_string(), field.to_string()))
            .or_default()
            .insert(timestamp, value);
    }

    /// All points of one series, ordered by timestamp
    pub fn points(
        &self,
        bucket: &str,
        measurement: &str,
        field: &str,
    ) -> Vec<(DateTime<Utc>, f64)> {
        self.lock()
            .series
            .get(&(bucket.to_string(), measurement.to_string(), field.to_string()))
            .map(|series| series.iter().map(|(t, v)| (*t, *v)).collect())
            .unwrap_or_default()
    }

    /// Calls made so far, oldest first
    pub fn operations(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn query_window(
        &self,
        location: &BucketRef,
        measurement: &str,
        field: &str,
        window: &Window,
    ) -> Result<Option<SampleStream>, StoreError> {
        let mut state = self.lock();
        state.ops.push(StoreOp::Query {
            measurement: measurement.to_string(),
            field: field.to_string(),
        });
        if self.no_result {
            return Ok(None);
        }

        let margin = self.overfetch.unwrap_or_else(Duration::zero);
        let from = window.start() - margin;
        let to = window.end() + margin;
        let key = (location.bucket.clone(), measurement.to_string(), field.to_string());
        let samples: Vec<Result<Sample, StoreError>> = state
            .series
            .get(&key)
            .map(|series| {
                series
                    .range(from..=to)
                    .map(|(t, v)| Ok(Sample::new(*t, *v)))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(futures::stream::iter(samples).boxed()))
    }

    async fn delete_window(
        &self,
        location: &BucketRef,
        measurement: &str,
        window: &Window,
    ) -> Result<(), StoreError> {
        self.pause().await;
        let mut state = self.lock();
        state.ops.push(StoreOp::Delete {
            measurement: measurement.to_string(),
            start: window.start(),
            end: window.end(),
        });
        if let Some(message) = &self.delete_failure {
            return Err(StoreError::Rejected {
                status: 400,
                message: message.clone(),
            });
        }

        for ((bucket, name, _field), series) in state.series.iter_mut() {
            if *bucket == location.bucket && name == measurement {
                series.retain(|t, _| !window.contains(*t));
            }
        }
        Ok(())
    }

    async fn write_points(
        &self,
        location: &BucketRef,
        points: &[ReplacementPoint],
    ) -> Result<(), StoreError> {
        self.pause().await;
        let mut state = self.lock();
        let measurement = points
            .first()
            .map(|p| p.measurement.clone())
            .unwrap_or_default();
        state.ops.push(StoreOp::Write {
            measurement,
            points: points.len(),
        });
        if let Some((accepted, message)) = &self.write_failure {
            if state.writes_accepted >= *accepted {
                return Err(StoreError::Rejected {
                    status: 422,
                    message: message.clone(),
                });
            }
        }
        state.writes_accepted += 1;

        for point in points {
            state
                .series
                .entry((
                    location.bucket.clone(),
                    point.measurement.clone(),
                    VALUE_FIELD.to_string(),
                ))
                .or_default()
                .insert(point.timestamp, point.value);
        }
        Ok(())
    }
}
