// Error types for relabeling runs
use std::fmt;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Reading,
    Clipping,
    Deleting,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Reading => "reading",
            Stage::Clipping => "clipping",
            Stage::Deleting => "deleting",
            Stage::Writing => "writing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Failures reported by a store client
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication rejected (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Protocol(String),

    #[error("Store reported an error: {0}")]
    Reported(String),

    #[error("Point cannot be encoded: {0}")]
    InvalidPoint(String),
}

impl StoreError {
    /// Transport and authentication failures, as opposed to rejected requests
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Unauthorized { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                StoreError::Unauthorized {
                    status: status.as_u16(),
                    message: e.to_string(),
                }
            }
            Some(status) => StoreError::Rejected {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None if e.is_decode() || e.is_body() => StoreError::Protocol(e.to_string()),
            None => StoreError::Connection(e.to_string()),
        }
    }
}

/// Every failure aborts the run; none are retried
#[derive(Debug, thiserror::Error)]
pub enum RelabelError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store unreachable or authentication rejected while {stage}: {source}")]
    Connectivity {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("Query failed: {0}")]
    Query(#[source] StoreError),

    #[error("Query for measurement {measurement:?} returned no result set")]
    EmptyResult { measurement: String },

    #[error("Delete failed, nothing was written: {0}")]
    Delete(#[source] StoreError),

    #[error("Write failed after {written} points were acknowledged; the window may be partially written: {source}")]
    Write {
        written: usize,
        #[source]
        source: StoreError,
    },

    #[error("Cancelled while {stage}")]
    Cancelled { stage: Stage },
}

impl RelabelError {
    /// Classify a store failure by the stage that observed it
    pub fn from_store(stage: Stage, err: StoreError) -> Self {
        if err.is_connectivity() {
            return RelabelError::Connectivity { stage, source: err };
        }
        match stage {
            Stage::Deleting => RelabelError::Delete(err),
            Stage::Writing => RelabelError::Write {
                written: 0,
                source: err,
            },
            _ => RelabelError::Query(err),
        }
    }

    /// The stage in which the failure happened
    pub fn stage(&self) -> Stage {
        match self {
            RelabelError::Configuration(_) => Stage::Init,
            RelabelError::Connectivity { stage, .. } => *stage,
            RelabelError::Query(_) | RelabelError::EmptyResult { .. } => Stage::Reading,
            RelabelError::Delete(_) => Stage::Deleting,
            RelabelError::Write { .. } => Stage::Writing,
            RelabelError::Cancelled { stage } => *stage,
        }
    }

    /// Short name of the failure kind, for operator-facing reports
    pub fn kind(&self) -> &'static str {
        match self {
            RelabelError::Configuration(_) => "configuration",
            RelabelError::Connectivity { .. } => "connectivity",
            RelabelError::Query(_) => "query",
            RelabelError::EmptyResult { .. } => "empty-result",
            RelabelError::Delete(_) => "delete",
            RelabelError::Write { .. } => "write",
            RelabelError::Cancelled { .. } => "cancelled",
        }
    }
}
