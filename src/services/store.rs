//! Object-store collaborators the pipeline reads from and writes to.
//!
//! Both traits are bucket-scoped: a handle is bound to one bucket and keys are
//! relative to it. Errors are classified so callers know what to retry.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::models::archive::ObjectKey;

/// One page of a lexicographically ordered listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<ObjectKey>,

    /// Opaque token for the next page; `None` once the listing is done.
    pub next_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("transient source error: {0}")]
    Transient(String),
}

impl SourceError {
    /// Timeouts, throttling and 5xx-style errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Throttled(_) | SourceError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("transient destination error: {0}")]
    Transient(String),
    #[error("multipart upload `{0}` not found")]
    NoSuchUpload(String),
    #[error("destination rejected request: {0}")]
    Rejected(String),
}

impl DestinationError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DestinationError::Throttled(_) | DestinationError::Transient(_)
        )
    }
}

/// Part acknowledged by the destination, used to complete an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Read side: the uncompressed source bucket.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// List keys under `prefix` in lexicographic order, one page at a time.
    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ListPage, SourceError>;

    /// Fetch an object's bytes.
    async fn get(&self, key: &str) -> Result<Bytes, SourceError>;
}

/// Write side: the archive bucket, written through multipart uploads.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Begin a multipart upload of `name`, returning its upload id.
    async fn start_multipart(&self, name: &str) -> Result<String, DestinationError>;

    /// Upload one part (1-based), returning its ETag.
    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, DestinationError>;

    /// Assemble the parts into the final object. Success means the object
    /// is durably stored; an existing object of the same name is replaced.
    async fn complete_multipart(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), DestinationError>;

    /// Discard an upload and every part uploaded to it.
    async fn abort_multipart(&self, upload_id: &str) -> Result<(), DestinationError>;
}
