pub mod clip;
pub mod config;
pub mod error;
pub mod influx;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod store;
pub mod writer;

// Re-export key types for use in tests and external applications
pub use crate::config::{ConfigOverrides, InfluxConfig, RelabelConfig};
pub use crate::error::{RelabelError, Stage, StoreError};
pub use crate::influx::InfluxClient;
pub use crate::memory::MemoryStore;
pub use crate::models::{BucketRef, RelabelJob, RelabelReport, ReplacementPoint, Sample, Window};
pub use crate::pipeline::Relabeler;
pub use crate::store::{SampleStream, TimeSeriesStore};

use anyhow::{Context, Result};
use diagnostics::*;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Build an InfluxDB client from the configured endpoint and credentials
pub fn connect(config: &RelabelConfig) -> Result<InfluxClient> {
    let influx = &config.influxdb;
    InfluxClient::new(&influx.url, &influx.org, &influx.token, config.timeout())
        .with_context(|| format!("Failed to create client for {}", influx.url))
}

/// Resolve `config`, bootstrap the bucket if asked to, and relabel one window
pub async fn relabel_from_config(
    config: &RelabelConfig,
    cancel: CancellationToken,
) -> Result<RelabelReport> {
    let job = config.resolve()?;
    let client = connect(config)?;

    if config.create_bucket {
        let bucket = &job.location.bucket;
        debug!("Ensuring bucket {bucket} exists", bucket: bucket.as_str());
        client
            .ensure_bucket(bucket)
            .await
            .with_context(|| format!("Failed to find or create bucket {bucket}"))?;
    }

    let report = Relabeler::new(client)
        .with_batch_size(config.batch_size)
        .with_cancellation(cancel)
        .run(&job)
        .await?;
    Ok(report)
}

/// Create example configuration file
pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
    config::create_example_config(path)
}

/// Load configuration from file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RelabelConfig> {
    config::load_config(path)
}
