//! Metadata row of a stored object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An object in a local bucket. The payload lives on disk; this is what the
/// listing and the archiver's source checks read.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    pub id: Uuid,
    pub bucket_id: Uuid,

    /// Key within the bucket.
    pub key: String,

    pub content_type: Option<String>,
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: Option<String>,

    pub last_modified: DateTime<Utc>,
}
