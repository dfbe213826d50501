//! Values that flow through the archival pipeline.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::models::object::Object;

/// A source object as reported by the lister. Immutable once listed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectKey {
    /// Key of the object within the source bucket.
    pub name: String,

    /// Size in bytes as reported by the listing.
    pub size: u64,

    /// Content checksum (ETag) reported by the store, if any.
    pub checksum: Option<String>,

    /// When the source object was last modified.
    pub last_modified: DateTime<Utc>,
}

impl From<&Object> for ObjectKey {
    fn from(object: &Object) -> Self {
        Self {
            name: object.key.clone(),
            size: object.size_bytes.max(0) as u64,
            checksum: object.etag.clone(),
            last_modified: object.last_modified,
        }
    }
}

/// An object's raw bytes, owned by the fetcher until handed to a compressor.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub key: ObjectKey,
    pub data: Bytes,
}

/// One object compressed independently of every other object.
#[derive(Debug, Clone)]
pub struct CompressedEntry {
    pub key: ObjectKey,

    /// zstd frame holding the whole object.
    pub payload: Bytes,

    pub original_size: u64,
    pub compressed_size: u64,

    /// XXH3-64 of the original bytes.
    pub checksum: u64,
}

impl CompressedEntry {
    /// Original size over compressed size; `0.0` for empty objects.
    pub fn ratio(&self) -> f64 {
        if self.compressed_size == 0 || self.original_size == 0 {
            return 0.0;
        }
        self.original_size as f64 / self.compressed_size as f64
    }
}

/// Pipeline stage at which an object was given up on.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Verify,
    Compress,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Verify => "verify",
            FailureStage::Compress => "compress",
        }
    }
}

impl FromStr for FailureStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(FailureStage::Fetch),
            "verify" => Ok(FailureStage::Verify),
            "compress" => Ok(FailureStage::Compress),
            other => Err(format!("unknown failure stage `{other}`")),
        }
    }
}

/// An object excluded from the archive, with the reason it was excluded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FailedObject {
    pub key: String,
    pub stage: FailureStage,
    pub reason: String,

    /// Gave up on a transient error. Not written to the ledger, so the next
    /// run admits the object again.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl FailedObject {
    pub fn new(key: impl Into<String>, stage: FailureStage, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            stage,
            reason: reason.into(),
            retryable: false,
        }
    }

    pub fn into_retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Text stored in the ledger's `detail` column.
    pub fn detail(&self) -> String {
        format!("{}: {}", self.stage.as_str(), self.reason)
    }

    /// Inverse of [`detail`](Self::detail). Unrecognised text is kept whole
    /// as a fetch failure.
    pub fn from_detail(key: impl Into<String>, detail: &str) -> Self {
        match detail
            .split_once(": ")
            .and_then(|(stage, reason)| Some((stage.parse().ok()?, reason)))
        {
            Some((stage, reason)) => Self::new(key, stage, reason),
            None => Self::new(key, FailureStage::Fetch, detail),
        }
    }
}

impl fmt::Display for FailedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.detail())
    }
}
