//! Streams one volume into a multipart upload as it is assembled.
//!
//! Parts arrive over a channel while the assembler is still writing the
//! volume, so the container is never held whole. If any part or the
//! completion fails, the upload is aborted, the rest of the stream is
//! drained, and the volume is rebuilt from the source objects listed in its
//! manifest and uploaded again from scratch.

use backon::Retryable as _;
use bytes::Bytes;
use std::{future::Future, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::compressor;
use crate::{
    config::PipelineConfig,
    container::{VolumeBuilder, VolumeManifest},
    errors::UploadError,
    models::archive::FetchedObject,
    services::store::{
        CompletedPart, DestinationError, DestinationStore, SourceError, SourceStore,
    },
};

const TRACING_TARGET: &str = "cold_archiver::pipeline::uploader";

/// Parts buffered between the assembler and an upload.
pub(crate) const PART_QUEUE: usize = 2;

#[derive(Debug)]
pub(crate) enum UploadMessage {
    Part(Bytes),

    /// The volume is closed; no parts follow.
    Finish(VolumeManifest),
}

/// A volume durably stored at the destination.
#[derive(Debug, Clone)]
pub struct UploadedVolume {
    pub index: u64,
    pub name: String,
    pub parts: u32,
    pub attempts: u32,
    pub manifest: VolumeManifest,
}

pub(crate) struct VolumeUpload {
    pub index: u64,
    pub name: String,
    pub config: Arc<PipelineConfig>,
    pub source: Arc<dyn SourceStore>,
    pub destination: Arc<dyn DestinationStore>,
    pub halt: CancellationToken,
}

impl VolumeUpload {
    /// Upload the streamed volume. Returns once the destination has
    /// acknowledged the completed object, or with the reason it never will.
    ///
    /// - `halt` aborts the multipart upload and yields [`UploadError::Aborted`]
    /// - a stream that ends without `Finish` yields [`UploadError::Abandoned`]
    pub async fn run(self, parts: mpsc::Receiver<UploadMessage>) -> Result<UploadedVolume, UploadError> {
        let halt = self.halt.clone();
        let mut active: Option<String> = None;
        let result = tokio::select! {
            biased;
            _ = halt.cancelled() => Err(UploadError::Aborted),
            result = self.upload(parts, &mut active) => result,
        };

        if let Some(upload_id) = active {
            self.abort(&upload_id).await;
        }
        match &result {
            Ok(volume) => info!(
                target: TRACING_TARGET,
                index = self.index,
                name = %self.name,
                parts = volume.parts,
                bytes = volume.manifest.container_bytes,
                attempts = volume.attempts,
                "volume uploaded"
            ),
            Err(err) if err.is_shutdown() => {
                info!(target: TRACING_TARGET, index = self.index, reason = %err, "volume upload abandoned")
            }
            Err(err) => warn!(target: TRACING_TARGET, index = self.index, error = %err, "volume upload failed"),
        }
        result
    }

    /// `active` holds the id of a started, not yet completed or aborted
    /// upload, so it can be aborted if this future is dropped.
    async fn upload(
        &self,
        mut parts: mpsc::Receiver<UploadMessage>,
        active: &mut Option<String>,
    ) -> Result<UploadedVolume, UploadError> {
        let mut failure: Option<DestinationError> = None;
        match self.start().await {
            Ok(upload_id) => *active = Some(upload_id),
            Err(err) => failure = Some(err),
        }

        let mut completed = Vec::new();
        let manifest = loop {
            match parts.recv().await {
                Some(UploadMessage::Part(data)) => {
                    let Some(upload_id) = active.as_deref() else {
                        continue;
                    };
                    if failure.is_some() {
                        continue;
                    }
                    let number = completed.len() as u32 + 1;
                    match self.put_part(upload_id, number, data).await {
                        Ok(part) => completed.push(part),
                        Err(err) => {
                            warn!(
                                target: TRACING_TARGET,
                                index = self.index,
                                part = number,
                                error = %err,
                                "part upload failed, draining volume before retry"
                            );
                            failure = Some(err);
                        }
                    }
                }
                Some(UploadMessage::Finish(manifest)) => break manifest,
                None => return Err(UploadError::Abandoned),
            }
        };

        if let (None, Some(upload_id)) = (&failure, active.as_deref()) {
            match self.complete(upload_id, &completed).await {
                Ok(()) => {
                    *active = None;
                    return Ok(UploadedVolume {
                        index: self.index,
                        name: self.name.clone(),
                        parts: completed.len() as u32,
                        attempts: 1,
                        manifest,
                    });
                }
                Err(err) => failure = Some(err),
            }
        }

        if let Some(upload_id) = active.take() {
            self.abort(&upload_id).await;
        }
        let mut last = UploadError::from(
            failure.unwrap_or_else(|| DestinationError::Rejected("upload never started".into())),
        );

        for attempt in 2..=self.config.volume_upload_attempts {
            warn!(
                target: TRACING_TARGET,
                index = self.index,
                attempt,
                error = %last,
                "rebuilding volume from source"
            );
            match self.rebuild(&manifest, active).await {
                Ok(parts) => {
                    return Ok(UploadedVolume {
                        index: self.index,
                        name: self.name.clone(),
                        parts,
                        attempts: attempt,
                        manifest,
                    });
                }
                Err(err) => {
                    if let Some(upload_id) = active.take() {
                        self.abort(&upload_id).await;
                    }
                    last = err;
                }
            }
        }
        Err(last)
    }

    /// Re-read every object of the volume, recompress it and upload the
    /// result as a fresh multipart upload. The rebuilt container must match
    /// the manifest exactly.
    async fn rebuild(
        &self,
        manifest: &VolumeManifest,
        active: &mut Option<String>,
    ) -> Result<u32, UploadError> {
        let upload_id = self.start().await?;
        *active = Some(upload_id.clone());

        let mut builder = VolumeBuilder::new(
            manifest.index,
            manifest.first_sequence,
            u64::MAX,
            self.config.part_size,
        );
        let mut completed = Vec::new();
        for entry in &manifest.entries {
            let data = self.refetch(&entry.key.name).await?;
            if data.len() as u64 != entry.original_size || xxh3_64(&data) != entry.checksum {
                return Err(UploadError::Rebuild(format!(
                    "object `{}` changed since it was archived",
                    entry.key.name
                )));
            }
            let object = FetchedObject {
                key: entry.key.clone(),
                data,
            };
            let compressed = compressor::compress(&object, self.config.compression_level)
                .map_err(|failure| UploadError::Rebuild(failure.to_string()))?;
            if compressed.compressed_size != entry.compressed_size {
                return Err(UploadError::Rebuild(format!(
                    "object `{}` recompressed to {} bytes, archived as {}",
                    entry.key.name, compressed.compressed_size, entry.compressed_size
                )));
            }
            let parts = builder
                .append(&compressed)
                .map_err(|err| UploadError::Rebuild(err.to_string()))?;
            for data in parts {
                let number = completed.len() as u32 + 1;
                completed.push(self.put_part(&upload_id, number, data).await?);
            }
        }

        let (parts, rebuilt) = builder.finish();
        for data in parts {
            let number = completed.len() as u32 + 1;
            completed.push(self.put_part(&upload_id, number, data).await?);
        }
        if rebuilt.container_bytes != manifest.container_bytes {
            return Err(UploadError::SizeMismatch {
                expected: manifest.container_bytes,
                actual: rebuilt.container_bytes,
            });
        }

        self.complete(&upload_id, &completed).await?;
        *active = None;
        Ok(completed.len() as u32)
    }

    async fn start(&self) -> Result<String, DestinationError> {
        let upload_id = self
            .retrying("start", || {
                let destination = Arc::clone(&self.destination);
                let name = self.name.clone();
                async move { destination.start_multipart(&name).await }
            })
            .await?;
        debug!(target: TRACING_TARGET, index = self.index, upload_id = %upload_id, "multipart upload started");
        Ok(upload_id)
    }

    async fn put_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart, DestinationError> {
        let etag = self
            .retrying("part", || {
                let destination = Arc::clone(&self.destination);
                let upload_id = upload_id.to_string();
                let data = data.clone();
                async move { destination.upload_part(&upload_id, part_number, data).await }
            })
            .await?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete(&self, upload_id: &str, parts: &[CompletedPart]) -> Result<(), DestinationError> {
        self.retrying("complete", || {
            let destination = Arc::clone(&self.destination);
            let upload_id = upload_id.to_string();
            let parts = parts.to_vec();
            async move { destination.complete_multipart(&upload_id, &parts).await }
        })
        .await
    }

    /// Best effort: a failed abort leaves an orphaned upload behind, which
    /// the destination's lifecycle rules reclaim.
    async fn abort(&self, upload_id: &str) {
        let aborted = self
            .retrying("abort", || {
                let destination = Arc::clone(&self.destination);
                let upload_id = upload_id.to_string();
                async move { destination.abort_multipart(&upload_id).await }
            })
            .await;
        match aborted {
            Ok(()) => debug!(target: TRACING_TARGET, index = self.index, upload_id, "multipart upload aborted"),
            Err(err) => warn!(target: TRACING_TARGET, index = self.index, upload_id, error = %err, "abort failed"),
        }
    }

    async fn refetch(&self, key: &str) -> Result<Bytes, UploadError> {
        let get = || {
            let source = Arc::clone(&self.source);
            let key = key.to_string();
            async move { source.get(&key).await }
        };
        get.retry(self.config.retry.backoff())
            .when(SourceError::is_transient)
            .await
            .map_err(|err| UploadError::Rebuild(format!("refetching `{key}`: {err}")))
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, DestinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DestinationError>>,
    {
        call.retry(self.config.retry.backoff())
            .when(DestinationError::is_transient)
            .notify(|err, delay| {
                warn!(
                    target: TRACING_TARGET,
                    index = self.index,
                    op,
                    error = %err,
                    retry_in = ?delay,
                    "destination call failed, retrying"
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        container::VolumeReader,
        models::archive::ObjectKey,
        services::memory_store::MemoryStore,
    };
    use chrono::Utc;
    use std::{io::Cursor, time::Duration};

    fn config() -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            part_size: 1024,
            max_volume_size: 1 << 20,
            volume_upload_attempts: 2,
            retry: crate::config::RetryPolicy {
                max_attempts: 2,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..PipelineConfig::default()
        })
    }

    fn upload(store: &MemoryStore, halt: CancellationToken) -> VolumeUpload {
        VolumeUpload {
            index: 0,
            name: "vol-0".into(),
            config: config(),
            source: Arc::new(store.clone()),
            destination: Arc::new(store.clone()),
            halt,
        }
    }

    /// Build a volume over the store's objects, returning parts + manifest.
    fn assemble(store: &MemoryStore, keys: &[&str]) -> (Vec<Bytes>, VolumeManifest) {
        let mut builder = VolumeBuilder::new(0, 0, u64::MAX, 1024);
        let mut parts = Vec::new();
        for key in keys {
            let data = store.object(key).unwrap();
            let object = FetchedObject {
                key: ObjectKey {
                    name: key.to_string(),
                    size: data.len() as u64,
                    checksum: None,
                    last_modified: Utc::now(),
                },
                data,
            };
            let entry = compressor::compress(&object, config().compression_level).unwrap();
            parts.extend(builder.append(&entry).unwrap());
        }
        let (tail, manifest) = builder.finish();
        parts.extend(tail);
        (parts, manifest)
    }

    async fn feed(
        parts: Vec<Bytes>,
        manifest: VolumeManifest,
        tx: mpsc::Sender<UploadMessage>,
    ) {
        for part in parts {
            tx.send(UploadMessage::Part(part)).await.unwrap();
        }
        tx.send(UploadMessage::Finish(manifest)).await.unwrap();
    }

    fn seed(store: &MemoryStore) {
        store.put("a", Bytes::from(vec![1u8; 3000]));
        store.put("b", Bytes::from((0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>()));
    }

    #[tokio::test]
    async fn streamed_volume_lands_intact() {
        let store = MemoryStore::new();
        seed(&store);
        let (parts, manifest) = assemble(&store, &["a", "b"]);
        let (tx, rx) = mpsc::channel(PART_QUEUE);
        let task = tokio::spawn(upload(&store, CancellationToken::new()).run(rx));
        feed(parts, manifest.clone(), tx).await;

        let uploaded = task.await.unwrap().unwrap();
        assert_eq!(uploaded.attempts, 1);
        let volume = store.object("vol-0").unwrap();
        assert_eq!(volume.len() as u64, manifest.container_bytes);

        let mut reader = VolumeReader::new(Cursor::new(volume));
        let mut keys = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            entry.decompress().unwrap();
            keys.push(entry.header.key);
        }
        assert_eq!(keys, ["a", "b"]);
    }

    #[tokio::test]
    async fn rejected_part_triggers_rebuild() {
        let store = MemoryStore::new();
        seed(&store);
        let (parts, manifest) = assemble(&store, &["a", "b"]);
        let expected: Vec<u8> = parts.iter().flat_map(|p| p.to_vec()).collect();
        store.reject_parts(1);

        let (tx, rx) = mpsc::channel(PART_QUEUE);
        let task = tokio::spawn(upload(&store, CancellationToken::new()).run(rx));
        feed(parts, manifest, tx).await;

        let uploaded = task.await.unwrap().unwrap();
        assert_eq!(uploaded.attempts, 2);
        assert_eq!(store.object("vol-0").unwrap(), expected);
        assert_eq!(store.open_uploads(), 0);
        assert_eq!(store.stats().uploads_aborted, 1);
    }

    #[tokio::test]
    async fn dropped_stream_aborts_upload() {
        let store = MemoryStore::new();
        seed(&store);
        let (parts, _) = assemble(&store, &["a"]);
        let (tx, rx) = mpsc::channel(PART_QUEUE);
        let task = tokio::spawn(upload(&store, CancellationToken::new()).run(rx));
        tx.send(UploadMessage::Part(parts[0].clone())).await.unwrap();
        drop(tx);

        assert!(matches!(task.await.unwrap(), Err(UploadError::Abandoned)));
        assert!(store.object("vol-0").is_none());
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn halt_aborts_upload() {
        let store = MemoryStore::new();
        let halt = CancellationToken::new();
        let (tx, rx) = mpsc::channel(PART_QUEUE);
        let task = tokio::spawn(upload(&store, halt.clone()).run(rx));
        tx.send(UploadMessage::Part(Bytes::from(vec![0u8; 1024])))
            .await
            .unwrap();
        halt.cancel();

        assert!(matches!(task.await.unwrap(), Err(UploadError::Aborted)));
        assert_eq!(store.open_uploads(), 0);
        drop(tx);
    }
}
