//! A local bucket: the namespace objects and archive volumes live in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A bucket of the local store. Its name doubles as the directory holding
/// its object payloads.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    pub id: Uuid,

    /// S3-style bucket name (lowercase, 3-63 characters).
    pub name: String,

    pub created_at: DateTime<Utc>,
}
