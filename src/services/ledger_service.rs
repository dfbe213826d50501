//! src/services/ledger_service.rs
//!
//! Ledger — durable, append-only record of archival progress in SQLite.
//!
//! Two tables are only ever inserted into:
//! - `ledger_objects`: one row per settled object (committed into a volume,
//!   or failed with a reason)
//! - `ledger_volumes`: `opened` / `committed` / `abandoned` events per
//!   volume index
//!
//! Current state is rebuilt by replaying both tables in insertion order,
//! later rows for a key superseding earlier ones. A volume is `opened`
//! (durably) before its upload starts, and all of its object rows land in
//! the same transaction as its `committed` event, so a crash leaves either
//! the whole volume or none of it.

use chrono::Utc;
use futures::TryStreamExt;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    container::VolumeManifest,
    db,
    models::{
        archive::FailedObject,
        ledger::{
            LedgerRecord, ObjectEventRow, ObjectState, VolumeEventRow, VolumeRecord, VolumeState,
        },
    },
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// State reconstructed from a full replay of the ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    /// Latest record per object key.
    pub records: HashMap<String, LedgerRecord>,

    /// Latest event per volume index.
    pub volumes: BTreeMap<u64, VolumeRecord>,

    /// Sequence number the next archived object will carry.
    pub next_sequence: u64,

    /// Index of the next volume to assemble (last committed + 1).
    pub next_volume_index: u64,

    /// Volume that was opened but never committed, if the previous run
    /// stopped mid-volume. Its objects have no records and are re-archived.
    pub interrupted_volume: Option<VolumeRecord>,
}

impl LedgerSnapshot {
    /// True when nothing has ever been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.volumes.is_empty()
    }

    pub fn is_settled(&self, key: &str) -> bool {
        self.records
            .get(key)
            .is_some_and(|record| record.state.is_settled())
    }

    /// Keys the lister must skip.
    pub fn settled_keys(&self) -> HashSet<String> {
        self.records
            .values()
            .filter(|record| record.state.is_settled())
            .map(|record| record.key.clone())
            .collect()
    }

    pub fn committed_count(&self) -> u64 {
        self.records
            .values()
            .filter(|record| record.state == ObjectState::Committed)
            .count() as u64
    }

    /// Objects recorded as failed, sorted by key.
    pub fn failures(&self) -> Vec<FailedObject> {
        let mut failed: Vec<_> = self
            .records
            .values()
            .filter(|record| record.state == ObjectState::Failed)
            .map(|record| {
                FailedObject::from_detail(record.key.clone(), record.detail.as_deref().unwrap_or(""))
            })
            .collect();
        failed.sort_by(|a, b| a.key.cmp(&b.key));
        failed
    }

    /// Committed volumes in index order.
    pub fn committed_volumes(&self) -> impl Iterator<Item = &VolumeRecord> {
        self.volumes
            .values()
            .filter(|volume| volume.state == VolumeState::Committed)
    }

    /// Records committed into volume `index`, in sequence order.
    pub fn records_for_volume(&self, index: u64) -> Vec<&LedgerRecord> {
        let mut records: Vec<_> = self
            .records
            .values()
            .filter(|r| r.state == ObjectState::Committed && r.volume_index == Some(index))
            .collect();
        records.sort_by_key(|r| r.sequence);
        records
    }
}

/// Handle to the ledger database.
#[derive(Clone)]
pub struct Ledger {
    db: SqlitePool,
}

impl Ledger {
    /// Open (or create) the ledger at `url` and apply its schema.
    pub async fn open(url: &str) -> LedgerResult<Self> {
        let db = db::connect(url, 2).await?;
        Self::from_pool(db).await
    }

    pub async fn from_pool(db: SqlitePool) -> LedgerResult<Self> {
        db::run_migrations(&db, db::LEDGER_SCHEMA).await?;
        Ok(Self { db })
    }

    /// Replay the whole ledger and validate it.
    ///
    /// Fails with [`LedgerError::Corrupt`] when:
    /// - committed volume indices are not contiguous from zero
    /// - a volume's records are not a dense run starting at its first sequence
    /// - a volume was left open below the last committed index
    /// - a row carries an unknown state or event
    pub async fn load(&self) -> LedgerResult<LedgerSnapshot> {
        let mut snapshot = LedgerSnapshot::default();
        let mut committed_sequences: BTreeMap<u64, Vec<u64>> = BTreeMap::new();

        let mut rows = sqlx::query_as::<_, ObjectEventRow>(
            "SELECT id, sequence, object_key, state, volume_index, detail, recorded_at
             FROM ledger_objects ORDER BY id ASC",
        )
        .fetch(&self.db);
        while let Some(row) = rows.try_next().await? {
            let state: ObjectState = row.state.parse().map_err(LedgerError::Corrupt)?;
            let volume_index = row.volume_index.map(|v| v as u64);
            let sequence = row.sequence.map(|s| s as u64);
            if state == ObjectState::Committed {
                let (Some(volume), Some(sequence)) = (volume_index, sequence) else {
                    return Err(LedgerError::Corrupt(format!(
                        "committed record {} for `{}` lacks a volume or sequence",
                        row.id, row.object_key
                    )));
                };
                committed_sequences.entry(volume).or_default().push(sequence);
            }
            snapshot.records.insert(
                row.object_key.clone(),
                LedgerRecord {
                    key: row.object_key,
                    state,
                    sequence,
                    volume_index,
                    detail: row.detail,
                    recorded_at: row.recorded_at,
                },
            );
        }
        drop(rows);

        let mut rows = sqlx::query_as::<_, VolumeEventRow>(
            "SELECT id, volume_index, event, object_name, first_sequence, entry_count,
                    uncompressed_bytes, container_bytes, recorded_at
             FROM ledger_volumes ORDER BY id ASC",
        )
        .fetch(&self.db);
        while let Some(row) = rows.try_next().await? {
            let state = match row.event.as_str() {
                "opened" => VolumeState::Open,
                "committed" => VolumeState::Committed,
                "abandoned" => VolumeState::Abandoned,
                other => {
                    return Err(LedgerError::Corrupt(format!(
                        "unknown volume event `{other}` in row {}",
                        row.id
                    )));
                }
            };
            let index = row.volume_index as u64;
            if state != VolumeState::Committed
                && snapshot
                    .volumes
                    .get(&index)
                    .is_some_and(|v| v.state == VolumeState::Committed)
            {
                return Err(LedgerError::Corrupt(format!(
                    "volume {index} {} after commit",
                    row.event
                )));
            }
            snapshot.volumes.insert(
                index,
                VolumeRecord {
                    index,
                    state,
                    object_name: row.object_name,
                    first_sequence: row.first_sequence as u64,
                    entry_count: row.entry_count as u64,
                    uncompressed_bytes: row.uncompressed_bytes as u64,
                    container_bytes: row.container_bytes as u64,
                },
            );
        }
        drop(rows);

        validate(&mut snapshot, &committed_sequences)?;

        info!(
            target: "ledger",
            records = snapshot.records.len(),
            next_sequence = snapshot.next_sequence,
            next_volume = snapshot.next_volume_index,
            interrupted = ?snapshot.interrupted_volume.as_ref().map(|v| v.index),
            "ledger replayed"
        );
        Ok(snapshot)
    }

    /// Durably record that volume `index` is about to be uploaded.
    pub async fn open_volume(
        &self,
        index: u64,
        object_name: &str,
        first_sequence: u64,
    ) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO ledger_volumes (volume_index, event, object_name, first_sequence, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(index as i64)
        .bind(VolumeState::Open.as_str())
        .bind(object_name)
        .bind(first_sequence as i64)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        debug!(target: "ledger", index, object_name, first_sequence, "volume opened");
        Ok(())
    }

    /// Close out an interrupted volume that this run never reopened. Its
    /// index stays free for the next volume.
    pub async fn abandon_volume(
        &self,
        index: u64,
        object_name: &str,
        first_sequence: u64,
    ) -> LedgerResult<()> {
        sqlx::query(
            "INSERT INTO ledger_volumes (volume_index, event, object_name, first_sequence, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(index as i64)
        .bind(VolumeState::Abandoned.as_str())
        .bind(object_name)
        .bind(first_sequence as i64)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        info!(target: "ledger", index, object_name, "interrupted volume abandoned");
        Ok(())
    }

    /// Commit a durably uploaded volume: every entry, the failures observed
    /// while it was open, and the `committed` event, in one transaction.
    pub async fn commit_volume(
        &self,
        manifest: &VolumeManifest,
        object_name: &str,
        failures: &[FailedObject],
    ) -> LedgerResult<()> {
        let now = Utc::now();
        let index = manifest.index as i64;
        let mut tx = self.db.begin().await?;

        for entry in &manifest.entries {
            sqlx::query(
                "INSERT INTO ledger_objects (sequence, object_key, state, volume_index, recorded_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(entry.sequence as i64)
            .bind(&entry.key.name)
            .bind(ObjectState::Committed.as_str())
            .bind(index)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        for failure in failures {
            insert_failure(&mut tx, failure, Some(index), now).await?;
        }

        sqlx::query(
            "INSERT INTO ledger_volumes (volume_index, event, object_name, first_sequence,
                                         entry_count, uncompressed_bytes, container_bytes, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(index)
        .bind(VolumeState::Committed.as_str())
        .bind(object_name)
        .bind(manifest.first_sequence as i64)
        .bind(manifest.entries.len() as i64)
        .bind(manifest.uncompressed_bytes as i64)
        .bind(manifest.container_bytes as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            target: "ledger",
            index = manifest.index,
            entries = manifest.entries.len(),
            failures = failures.len(),
            "volume committed"
        );
        Ok(())
    }

    /// Record failures that belong to no volume.
    pub async fn record_failures(&self, failures: &[FailedObject]) -> LedgerResult<()> {
        if failures.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        for failure in failures {
            insert_failure(&mut tx, failure, None, now).await?;
        }
        tx.commit().await?;
        warn!(target: "ledger", count = failures.len(), "recorded failed objects");
        Ok(())
    }
}

async fn insert_failure(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    failure: &FailedObject,
    volume_index: Option<i64>,
    now: chrono::DateTime<Utc>,
) -> LedgerResult<()> {
    sqlx::query(
        "INSERT INTO ledger_objects (sequence, object_key, state, volume_index, detail, recorded_at)
         VALUES (NULL, ?, ?, ?, ?, ?)",
    )
    .bind(&failure.key)
    .bind(ObjectState::Failed.as_str())
    .bind(volume_index)
    .bind(failure.detail())
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Check replayed state for gaps and derive the resume point.
fn validate(
    snapshot: &mut LedgerSnapshot,
    committed_sequences: &BTreeMap<u64, Vec<u64>>,
) -> LedgerResult<()> {
    let mut next_index = 0u64;
    let mut next_sequence = 0u64;
    for volume in snapshot.committed_volumes() {
        if volume.index != next_index {
            return Err(LedgerError::Corrupt(format!(
                "volume {} committed but volume {} is missing",
                volume.index, next_index
            )));
        }
        if volume.first_sequence != next_sequence {
            return Err(LedgerError::Corrupt(format!(
                "volume {} starts at sequence {}, expected {}",
                volume.index, volume.first_sequence, next_sequence
            )));
        }
        let mut sequences = committed_sequences
            .get(&volume.index)
            .cloned()
            .unwrap_or_default();
        sequences.sort_unstable();
        let dense = sequences.len() as u64 == volume.entry_count
            && sequences
                .iter()
                .enumerate()
                .all(|(i, seq)| *seq == volume.first_sequence + i as u64);
        if !dense {
            return Err(LedgerError::Corrupt(format!(
                "volume {} records {} entries but holds sequences {:?}",
                volume.index,
                volume.entry_count,
                sequences.first().zip(sequences.last())
            )));
        }
        next_index += 1;
        next_sequence += volume.entry_count;
    }

    if let Some(stray) = committed_sequences
        .keys()
        .find(|index| **index >= next_index)
    {
        return Err(LedgerError::Corrupt(format!(
            "records reference uncommitted volume {stray}"
        )));
    }

    let mut interrupted = None;
    for volume in snapshot
        .volumes
        .values()
        .filter(|v| v.state == VolumeState::Open)
    {
        if volume.index < next_index {
            return Err(LedgerError::Corrupt(format!(
                "volume {} left open below committed volume {}",
                volume.index,
                next_index - 1
            )));
        }
        if interrupted.is_none() {
            interrupted = Some(volume.clone());
        }
    }

    snapshot.next_volume_index = next_index;
    snapshot.next_sequence = next_sequence;
    snapshot.interrupted_volume = interrupted;
    Ok(())
}
