//! Reading archives back: verify every volume under a prefix, or extract
//! their objects into another bucket.

use bytes::Bytes;
use serde::Serialize;
use std::io::{self, BufReader};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    container::{ContainerError, VolumeReader},
    services::storage_service::{ListObjectsParams, StorageError, StorageService},
};

const TRACING_TARGET: &str = "cold_archiver::restore";

/// Suffix of every volume object.
pub const VOLUME_SUFFIX: &str = ".vol";

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("volume reader stopped unexpectedly")]
    Reader,
}

pub type RestoreResult<T> = Result<T, RestoreError>;

/// Result of reading one volume.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct VolumeCheck {
    pub name: String,
    pub entries: u64,
    pub original_bytes: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct RestoreReport {
    pub volumes: Vec<VolumeCheck>,
    pub objects: u64,
    pub failed_volumes: usize,
}

impl RestoreReport {
    fn push(&mut self, check: VolumeCheck) {
        if check.error.is_some() {
            self.failed_volumes += 1;
        }
        self.objects += check.entries;
        self.volumes.push(check);
    }

    pub fn is_clean(&self) -> bool {
        self.failed_volumes == 0
    }
}

#[derive(Clone)]
pub struct RestoreService {
    storage: StorageService,
}

impl RestoreService {
    pub fn new(storage: StorageService) -> Self {
        Self { storage }
    }

    /// Volume object names under `prefix`, in name (and so index) order.
    pub async fn list_volumes(&self, bucket: &str, prefix: &str) -> RestoreResult<Vec<String>> {
        let mut names = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .storage
                .list_objects_v2(
                    bucket,
                    ListObjectsParams {
                        prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
                        continuation_token: token.take(),
                        max_keys: 1000,
                    },
                )
                .await?;
            names.extend(
                page.objects
                    .into_iter()
                    .map(|object| object.key)
                    .filter(|key| key.ends_with(VOLUME_SUFFIX)),
            );
            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        Ok(names)
    }

    /// Read every volume end to end, decompressing each entry and checking
    /// it against its recorded size and checksum.
    pub async fn verify(&self, bucket: &str, prefix: &str) -> RestoreResult<RestoreReport> {
        let mut report = RestoreReport::default();
        for name in self.list_volumes(bucket, prefix).await? {
            let check = match self.verify_volume(bucket, &name).await {
                Ok((entries, original_bytes)) => {
                    info!(target: TRACING_TARGET, volume = %name, entries, "volume verified");
                    VolumeCheck {
                        name,
                        entries,
                        original_bytes,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(target: TRACING_TARGET, volume = %name, error = %err, "volume failed verification");
                    VolumeCheck {
                        name,
                        entries: 0,
                        original_bytes: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            report.push(check);
        }
        Ok(report)
    }

    async fn verify_volume(&self, bucket: &str, name: &str) -> RestoreResult<(u64, u64)> {
        let (_, file) = self.storage.get_object_reader(bucket, name).await?;
        let file = file.into_std().await;
        tokio::task::spawn_blocking(move || -> RestoreResult<(u64, u64)> {
            let mut reader = VolumeReader::new(BufReader::new(file));
            let (mut entries, mut bytes) = (0, 0);
            while let Some(entry) = reader.next_entry()? {
                entry.decompress()?;
                entries += 1;
                bytes += entry.header.original_size;
            }
            Ok((entries, bytes))
        })
        .await
        .map_err(|_| RestoreError::Reader)?
    }

    /// Restore every object from the volumes under `prefix` into
    /// `target_bucket`, creating it if needed. Keys are prefixed with
    /// `target_prefix`.
    pub async fn extract(
        &self,
        bucket: &str,
        prefix: &str,
        target_bucket: &str,
        target_prefix: &str,
    ) -> RestoreResult<RestoreReport> {
        self.storage.ensure_bucket(target_bucket).await?;
        let mut report = RestoreReport::default();
        for name in self.list_volumes(bucket, prefix).await? {
            let (entries, original_bytes, error) = self
                .extract_volume(bucket, &name, target_bucket, target_prefix)
                .await;
            if let Some(err) = &error {
                warn!(target: TRACING_TARGET, volume = %name, entries, error = %err, "volume only partly extracted");
            } else {
                info!(target: TRACING_TARGET, volume = %name, entries, "volume extracted");
            }
            report.push(VolumeCheck {
                name,
                entries,
                original_bytes,
                error: error.map(|err| err.to_string()),
            });
        }
        Ok(report)
    }

    /// Entries are decoded on a blocking thread and written one at a time.
    /// The first unreadable entry or rejected write stops this volume only;
    /// whatever was restored before it is counted.
    async fn extract_volume(
        &self,
        bucket: &str,
        name: &str,
        target_bucket: &str,
        target_prefix: &str,
    ) -> (u64, u64, Option<RestoreError>) {
        let file = match self.storage.get_object_reader(bucket, name).await {
            Ok((_, file)) => file.into_std().await,
            Err(err) => return (0, 0, Some(err.into())),
        };

        let (tx, rx) = flume::bounded::<(String, Vec<u8>)>(1);
        let reader = tokio::task::spawn_blocking(move || -> Result<(), ContainerError> {
            let mut reader = VolumeReader::new(BufReader::new(file));
            while let Some(entry) = reader.next_entry()? {
                let data = entry.decompress()?;
                if tx.send((entry.header.key, data)).is_err() {
                    break;
                }
            }
            Ok(())
        });

        let (mut entries, mut bytes) = (0, 0);
        let mut write_error: Option<RestoreError> = None;
        while let Ok((key, data)) = rx.recv_async().await {
            let size = data.len() as u64;
            let chunk = futures::stream::once(async move { Ok::<_, io::Error>(Bytes::from(data)) });
            let target = format!("{target_prefix}{key}");
            if let Err(err) = self
                .storage
                .upload_object_stream(target_bucket, &target, None, chunk)
                .await
            {
                warn!(target: TRACING_TARGET, volume = %name, key = %target, error = %err, "could not restore object");
                write_error = Some(err.into());
                break;
            }
            entries += 1;
            bytes += size;
        }
        drop(rx);

        let read_error = match reader.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.into()),
            Err(_) => Some(RestoreError::Reader),
        };
        (entries, bytes, write_error.or(read_error))
    }
}
