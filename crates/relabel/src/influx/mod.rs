//! InfluxDB 2.x HTTP API implementation of the store capability.

pub mod client;
pub mod flux;
pub mod line_protocol;

pub use client::{Bucket, Health, InfluxClient, Organization};
