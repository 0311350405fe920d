//! The read, clip, delete, write sequence for one window.
//!
//! The job is validated before anything reaches the store. Stages then run
//! strictly in order: `Init → Reading → Clipping → Deleting →
//! Writing → Done`. Any failure moves to `Failed` and aborts the run; there
//! are no retries and no rollback. The delete must be acknowledged before the
//! first write is submitted. The source read is fully consumed before the
//! delete is issued, so a target that equals the source is safe.

use chrono::{DateTime, Utc};
use diagnostics::*;
use futures::{StreamExt, TryStreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::clip::clip_window;
use crate::error::{RelabelError, Stage};
use crate::models::{RelabelJob, RelabelReport};
use crate::store::TimeSeriesStore;
use crate::writer::{DEFAULT_BATCH_SIZE, WindowWriter};

pub struct Relabeler<S> {
    store: S,
    batch_size: usize,
    cancel: CancellationToken,
}

impl<S: TimeSeriesStore> Relabeler<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Token that aborts the run at the next stage boundary or in-flight request
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the whole pipeline once
    pub async fn run(&self, job: &RelabelJob) -> Result<RelabelReport, RelabelError> {
        match self.run_stages(job).await {
            Ok(report) => {
                let stage = Stage::Done.to_string();
                debug!("Pipeline reached stage {stage}", stage: stage);
                Ok(report)
            }
            Err(e) => {
                let failed = Stage::Failed.to_string();
                let stage = e.stage().to_string();
                let kind = e.kind();
                let message = e.to_string();
                error!(
                    "Pipeline {failed} in stage {stage} ({kind}): {message}",
                    failed: failed,
                    stage: stage,
                    kind: kind,
                    message: message
                );
                Err(e)
            }
        }
    }

    async fn run_stages(&self, job: &RelabelJob) -> Result<RelabelReport, RelabelError> {
        job.validate()?;
        let window = job.window;
        let window_text = window.to_string();
        let source = job.source_measurement.as_str();
        let target_measurement = job.target_measurement.as_str();
        let bucket = job.location.bucket.as_str();
        info!(
            "Relabeling {source} as {target_measurement} in bucket {bucket} over {window}",
            source: source,
            target_measurement: target_measurement,
            bucket: bucket,
            window: window_text
        );

        // Reading and clipping
        let timestamps = self.read_clipped(job).await?;
        let samples_read = timestamps.read;
        let kept = timestamps.kept.len();
        let samples_clipped = samples_read - kept;
        info!(
            "Read {samples_read} samples of {source}, {samples_clipped} outside the window",
            samples_read: samples_read,
            source: source,
            samples_clipped: samples_clipped
        );

        // Supersession
        self.enter(Stage::Deleting)?;
        info!(
            "Deleting {target_measurement} points in bucket {bucket} over {window}",
            target_measurement: target_measurement,
            bucket: bucket,
            window: window_text
        );
        self.guarded(
            Stage::Deleting,
            self.store.delete_window(&job.location, target_measurement, &window),
        )
        .await?
        .map_err(|e| RelabelError::from_store(Stage::Deleting, e))?;

        // Rewrite
        self.enter(Stage::Writing)?;
        let value = job.value;
        info!(
            "Writing {kept} points of {target_measurement} with value {value}",
            kept: kept,
            target_measurement: target_measurement,
            value: value
        );
        let mut writer = WindowWriter::new(
            &self.store,
            &job.location,
            target_measurement,
            job.value,
            self.batch_size,
        );
        for timestamp in timestamps.kept {
            let pushed = self
                .guarded(Stage::Writing, writer.push(timestamp))
                .await
                .and_then(|result| result);
            if let Err(e) = pushed {
                let written = writer.written();
                warn!(
                    "Stopped after {written} points of {target_measurement} were written; re-run to complete the window",
                    written: written,
                    target_measurement: target_measurement
                );
                return Err(e);
            }
        }
        let points_written = self.guarded(Stage::Writing, writer.finish()).await??;
        info!(
            "Wrote {points_written} points of {target_measurement}",
            points_written: points_written,
            target_measurement: target_measurement
        );

        Ok(RelabelReport {
            samples_read,
            samples_clipped,
            points_written,
        })
    }

    async fn read_clipped(&self, job: &RelabelJob) -> Result<ClippedTimestamps, RelabelError> {
        self.enter(Stage::Reading)?;
        let source = job.source_measurement.as_str();
        let stream = self
            .guarded(
                Stage::Reading,
                self.store
                    .query_window(&job.location, source, &job.field, &job.window),
            )
            .await?
            .map_err(|e| RelabelError::from_store(Stage::Reading, e))?
            .ok_or_else(|| RelabelError::EmptyResult {
                measurement: job.source_measurement.clone(),
            })?;

        self.enter(Stage::Clipping)?;
        let mut read = 0usize;
        let counted = stream.inspect(|_| read += 1);
        let kept: Vec<DateTime<Utc>> = self
            .guarded(
                Stage::Clipping,
                clip_window(counted, job.window)
                    .map_ok(|sample| sample.timestamp)
                    .try_collect::<Vec<_>>(),
            )
            .await?
            .map_err(|e| RelabelError::from_store(Stage::Reading, e))?;

        Ok(ClippedTimestamps { read, kept })
    }

    fn enter(&self, stage: Stage) -> Result<(), RelabelError> {
        if self.cancel.is_cancelled() {
            return Err(RelabelError::Cancelled { stage });
        }
        let name = stage.to_string();
        debug!("Pipeline entering stage {stage}", stage: name);
        Ok(())
    }

    /// Await `fut` unless the run is cancelled first
    async fn guarded<F: Future>(&self, stage: Stage, fut: F) -> Result<F::Output, RelabelError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelabelError::Cancelled { stage }),
            output = fut => Ok(output),
        }
    }
}

struct ClippedTimestamps {
    read: usize,
    kept: Vec<DateTime<Utc>>,
}
