use chrono::{DateTime, Utc};
use diagnostics::*;

use crate::error::{RelabelError, Stage};
use crate::models::{BucketRef, ReplacementPoint};
use crate::store::TimeSeriesStore;

/// Default number of points per write request
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Buffered writer for the replacement points of one window.
///
/// Points are submitted in batches of `batch_size`. [`WindowWriter::finish`]
/// must be called to submit the final partial batch; a writer dropped with
/// buffered points loses them and logs a warning.
pub struct WindowWriter<'a, S: TimeSeriesStore + ?Sized> {
    store: &'a S,
    location: &'a BucketRef,
    measurement: String,
    value: f64,
    batch_size: usize,
    buffer: Vec<ReplacementPoint>,
    written: usize,
}

impl<'a, S: TimeSeriesStore + ?Sized> WindowWriter<'a, S> {
    pub fn new(
        store: &'a S,
        location: &'a BucketRef,
        measurement: &str,
        value: f64,
        batch_size: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            location,
            measurement: measurement.to_string(),
            value,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            written: 0,
        }
    }

    /// Points acknowledged by the store so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Points buffered but not yet submitted
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Queue a replacement point at `timestamp`, submitting a batch when full
    pub async fn push(&mut self, timestamp: DateTime<Utc>) -> Result<(), RelabelError> {
        self.buffer.push(ReplacementPoint {
            measurement: self.measurement.clone(),
            timestamp,
            value: self.value,
        });
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Submit whatever is buffered
    pub async fn flush(&mut self) -> Result<(), RelabelError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let count = self.buffer.len();
        let measurement = self.measurement.as_str();
        debug!(
            "Submitting batch of {count} points for {measurement}",
            count: count,
            measurement: measurement
        );

        match self.store.write_points(self.location, &self.buffer).await {
            Ok(()) => {
                self.written += count;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                // The batch is not retried; discard it so Drop does not report it again.
                self.buffer.clear();
                Err(match RelabelError::from_store(Stage::Writing, e) {
                    RelabelError::Write { source, .. } => RelabelError::Write {
                        written: self.written,
                        source,
                    },
                    other => other,
                })
            }
        }
    }

    /// Final flush. Returns the total number of points written.
    pub async fn finish(mut self) -> Result<usize, RelabelError> {
        self.flush().await?;
        Ok(self.written)
    }
}

impl<S: TimeSeriesStore + ?Sized> Drop for WindowWriter<'_, S> {
    fn drop(&mut self) {
        let pending = self.buffer.len();
        if pending > 0 {
            let measurement = self.measurement.as_str();
            warn!(
                "Discarding {pending} unflushed points for {measurement}",
                pending: pending,
                measurement: measurement
            );
        }
    }
}
