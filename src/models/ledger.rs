//! Durable progress records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// Lifecycle of a single source object.
///
/// Only `Committed` and `Failed` are ever written to the ledger; an object
/// with no record is `Pending`, and `Fetched`/`Compressed` exist only while
/// the object is moving through the pipeline.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Pending,
    Fetched,
    Compressed,
    Committed,
    Failed,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Pending => "pending",
            ObjectState::Fetched => "fetched",
            ObjectState::Compressed => "compressed",
            ObjectState::Committed => "committed",
            ObjectState::Failed => "failed",
        }
    }

    /// Settled objects are never handed to the pipeline again.
    pub fn is_settled(&self) -> bool {
        matches!(self, ObjectState::Committed | ObjectState::Failed)
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ObjectState::Pending),
            "fetched" => Ok(ObjectState::Fetched),
            "compressed" => Ok(ObjectState::Compressed),
            "committed" => Ok(ObjectState::Committed),
            "failed" => Ok(ObjectState::Failed),
            other => Err(format!("unknown object state `{other}`")),
        }
    }
}

/// Current state of one object, reconstructed by replaying the ledger.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LedgerRecord {
    pub key: String,
    pub state: ObjectState,

    /// Position in the archive's total order. Dense across committed objects.
    pub sequence: Option<u64>,

    /// Volume holding the object, once committed.
    pub volume_index: Option<u64>,

    /// Failure reason for failed objects.
    pub detail: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

/// Whether a volume was only opened, has been durably committed, or was
/// opened by an earlier run and then left unused by a later one.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Open,
    Committed,
    Abandoned,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Open => "opened",
            VolumeState::Committed => "committed",
            VolumeState::Abandoned => "abandoned",
        }
    }
}

/// Latest known state of one volume.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VolumeRecord {
    pub index: u64,
    pub state: VolumeState,
    pub object_name: String,
    pub first_sequence: u64,
    pub entry_count: u64,
    pub uncompressed_bytes: u64,
    pub container_bytes: u64,
}

/// Raw row of `ledger_objects`.
#[derive(Clone, FromRow, Debug)]
pub struct ObjectEventRow {
    pub id: i64,
    pub sequence: Option<i64>,
    pub object_key: String,
    pub state: String,
    pub volume_index: Option<i64>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Raw row of `ledger_volumes`.
#[derive(Clone, FromRow, Debug)]
pub struct VolumeEventRow {
    pub id: i64,
    pub volume_index: i64,
    pub event: String,
    pub object_name: String,
    pub first_sequence: i64,
    pub entry_count: i64,
    pub uncompressed_bytes: i64,
    pub container_bytes: i64,
    pub recorded_at: DateTime<Utc>,
}
