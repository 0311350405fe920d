//! Store capability used by the relabeling pipeline.
//!
//! The pipeline never talks to a backend directly; it is handed something
//! implementing [`TimeSeriesStore`]. The InfluxDB HTTP client and the
//! in-memory store used by tests are the two implementations.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StoreError;
use crate::models::{BucketRef, ReplacementPoint, Sample, Window};

/// Forward-only, finite sequence of samples ordered by timestamp.
/// Consumed once; it cannot be restarted.
pub type SampleStream = BoxStream<'static, Result<Sample, StoreError>>;

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Range query for one measurement and one value field.
    ///
    /// `Ok(None)` means the store completed the query but produced no result
    /// set at all. A result set with zero rows is `Ok(Some(empty stream))`.
    async fn query_window(
        &self,
        location: &BucketRef,
        measurement: &str,
        field: &str,
        window: &Window,
    ) -> Result<Option<SampleStream>, StoreError>;

    /// Delete every point of `measurement` with a timestamp inside `window`.
    /// Returns only once the store has acknowledged the delete.
    async fn delete_window(
        &self,
        location: &BucketRef,
        measurement: &str,
        window: &Window,
    ) -> Result<(), StoreError>;

    /// Submit one batch of points. Returns once the batch is acknowledged.
    async fn write_points(
        &self,
        location: &BucketRef,
        points: &[ReplacementPoint],
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: TimeSeriesStore + ?Sized> TimeSeriesStore for std::sync::Arc<T> {
    async fn query_window(
        &self,
        location: &BucketRef,
        measurement: &str,
        field: &str,
        window: &Window,
    ) -> Result<Option<SampleStream>, StoreError> {
        (**self).query_window(location, measurement, field, window).await
    }

    async fn delete_window(
        &self,
        location: &BucketRef,
        measurement: &str,
        window: &Window,
    ) -> Result<(), StoreError> {
        (**self).delete_window(location, measurement, window).await
    }

    async fn write_points(
        &self,
        location: &BucketRef,
        points: &[ReplacementPoint],
    ) -> Result<(), StoreError> {
        (**self).write_points(location, points).await
    }
}
