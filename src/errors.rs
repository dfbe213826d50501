use thiserror::Error;

use crate::{
    container::ContainerError,
    services::{
        ledger_service::LedgerError,
        store::{DestinationError, SourceError},
    },
};

/// Errors that stop an archival run.
///
/// Per-object problems never show up here; they become
/// [`FailedObject`](crate::models::archive::FailedObject)s instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "ledger already holds progress ({committed} objects, {volumes} volumes); \
         enable resume to continue it"
    )]
    ResumeDisabled { committed: u64, volumes: u64 },

    #[error("listing failed: {0}")]
    Listing(#[source] SourceError),

    #[error("listing is not in key order: `{next}` after `{previous}`")]
    ListingOrder { previous: String, next: String },

    #[error("volume {index} could not be uploaded: {source}")]
    Upload {
        index: u64,
        #[source]
        source: UploadError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("{0} stage stopped unexpectedly")]
    StageFailed(&'static str),
}

/// Why a volume never reached the destination.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error("rebuilding volume failed: {0}")]
    Rebuild(String),

    #[error("rebuilt volume is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("upload aborted")]
    Aborted,

    #[error("volume abandoned before it was closed")]
    Abandoned,
}

impl UploadError {
    /// Aborted and abandoned uploads are shutdown outcomes, not failures.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, UploadError::Aborted | UploadError::Abandoned)
    }
}

impl PipelineError {
    /// True when the run stopped because it was told to, not because
    /// something broke.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, PipelineError::Upload { source, .. } if source.is_shutdown())
    }
}
