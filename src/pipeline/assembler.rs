//! Archive assembler: the single writer that turns settled objects, in
//! listing order, into size-bounded volumes and commits them to the ledger.

use std::{collections::VecDeque, mem, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Outcome, Settled,
    reorder::ReorderBuffer,
    report::VolumeSummary,
    state::{PipelineState, StageCounters},
    uploader::{PART_QUEUE, UploadMessage, UploadedVolume, VolumeUpload},
};
use crate::{
    config::PipelineConfig,
    container::VolumeBuilder,
    errors::{PipelineError, UploadError},
    models::archive::{CompressedEntry, FailedObject},
    services::{
        ledger_service::Ledger,
        store::{DestinationStore, SourceStore},
    },
};

const TRACING_TARGET: &str = "cold_archiver::pipeline::assembler";

type UploadTask = JoinHandle<Result<UploadedVolume, UploadError>>;

/// What the assembler committed during this run.
#[derive(Debug, Default)]
pub struct AssemblyOutcome {
    pub archived: u64,
    pub failed: Vec<FailedObject>,
    pub volumes: Vec<VolumeSummary>,
    pub bytes_in: u64,
    pub bytes_out: u64,

    /// Volumes opened, whether or not they were committed.
    pub opened: u64,
}

/// The volume currently being written.
struct OpenVolume {
    builder: VolumeBuilder,
    name: String,
    parts: mpsc::Sender<UploadMessage>,
    failures: Vec<FailedObject>,
    upload: UploadTask,
}

/// A closed volume whose upload may still be running.
struct ClosedVolume {
    index: u64,
    name: String,
    failures: Vec<FailedObject>,
    upload: UploadTask,
}

pub(crate) struct Assembler {
    config: Arc<PipelineConfig>,
    ledger: Ledger,
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    state: Arc<PipelineState>,
    halt: CancellationToken,
    next_index: u64,
    next_sequence: u64,
    open: Option<OpenVolume>,
    closed: VecDeque<ClosedVolume>,

    /// Failures seen while no volume was open; they ride along with the next
    /// volume's commit.
    orphans: Vec<FailedObject>,
    outcome: AssemblyOutcome,
}

impl Assembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<PipelineConfig>,
        ledger: Ledger,
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        state: Arc<PipelineState>,
        halt: CancellationToken,
        next_index: u64,
        next_sequence: u64,
    ) -> Self {
        Self {
            config,
            ledger,
            source,
            destination,
            state,
            halt,
            next_index,
            next_sequence,
            open: None,
            closed: VecDeque::new(),
            orphans: Vec::new(),
            outcome: AssemblyOutcome::default(),
        }
    }

    /// Consume `settled` until every upstream sender is gone, then either
    /// close the last volume (listing finished, or closing partial volumes
    /// was requested) or abandon it for the next run to redo.
    ///
    /// On error the halt token is cancelled and every upload still running
    /// is aborted before returning.
    pub async fn run(
        mut self,
        settled: flume::Receiver<Settled>,
    ) -> (AssemblyOutcome, Option<PipelineError>) {
        let guard = self.halt.clone().drop_guard();
        let error = match self.assemble(settled).await {
            Ok(()) => None,
            Err(err) => {
                warn!(target: TRACING_TARGET, error = %err, "assembly failed, halting pipeline");
                self.halt.cancel();
                Some(err)
            }
        };
        if error.is_some() || self.halt.is_cancelled() {
            self.wind_down().await;
        }
        self.state.set_open_volume(None);
        guard.disarm();
        (self.outcome, error)
    }

    async fn assemble(&mut self, settled: flume::Receiver<Settled>) -> Result<(), PipelineError> {
        let mut reorder = ReorderBuffer::new(0);
        loop {
            let message = tokio::select! {
                biased;
                _ = self.halt.cancelled() => return Ok(()),
                message = settled.recv_async() => message,
            };
            let Ok(Settled {
                ordinal,
                outcome,
                ticket,
            }) = message
            else {
                break;
            };
            if !reorder.insert(ordinal, (outcome, ticket)) {
                return Err(PipelineError::StageFailed("reorder"));
            }
            while let Some((outcome, ticket)) = reorder.pop_ready() {
                self.consume(outcome).await?;
                drop(ticket);
            }
            self.commit_finished().await?;
        }

        if !reorder.is_empty() {
            warn!(
                target: TRACING_TARGET,
                waiting_for = reorder.next_ordinal(),
                buffered = reorder.len(),
                "inputs ended with a gap in the order"
            );
            return Err(PipelineError::StageFailed("compress"));
        }
        if self.halt.is_cancelled() {
            return Ok(());
        }

        if self.state.listing_complete() || self.config.close_partial_on_shutdown {
            self.close_open().await?;
            while !self.closed.is_empty() {
                self.commit_front().await?;
            }
            if self.state.listing_complete() && !self.orphans.is_empty() {
                let orphans = mem::take(&mut self.orphans);
                self.ledger.record_failures(&orphans).await?;
            }
        } else {
            self.abandon_open().await;
            while !self.closed.is_empty() {
                self.commit_front().await?;
            }
        }
        Ok(())
    }

    async fn consume(&mut self, outcome: Outcome) -> Result<(), PipelineError> {
        match outcome {
            Outcome::Failed(failure) => {
                debug!(target: TRACING_TARGET, key = %failure.key, "object failed, excluded from archive");
                self.outcome.failed.push(failure.clone());
                if failure.retryable {
                    return Ok(());
                }
                match self.open.as_mut() {
                    Some(open) => open.failures.push(failure),
                    None => self.orphans.push(failure),
                }
                Ok(())
            }
            Outcome::Archived(entry) => self.append(entry).await,
        }
    }

    async fn append(&mut self, entry: CompressedEntry) -> Result<(), PipelineError> {
        let full = self
            .open
            .as_ref()
            .is_some_and(|open| !open.builder.is_empty() && !open.builder.fits(&entry));
        if full {
            self.close_open().await?;
        }

        let mut open = match self.open.take() {
            Some(open) => open,
            None => self.open_volume().await?,
        };
        if !open.builder.is_empty() || open.builder.fits(&entry) {
            debug!(target: TRACING_TARGET, key = %entry.key.name, index = open.builder.index(), "appending entry");
        } else {
            warn!(
                target: TRACING_TARGET,
                key = %entry.key.name,
                compressed = entry.compressed_size,
                max = self.config.max_volume_size,
                "entry exceeds the volume size on its own, writing single-entry volume"
            );
        }

        let parts = open.builder.append(&entry)?;
        for part in parts {
            if open.parts.send(UploadMessage::Part(part)).await.is_err() {
                return Err(upload_failed(open.builder.index(), open.upload).await);
            }
        }
        self.open = Some(open);
        Ok(())
    }

    /// Durably record the next volume as opened, then start its upload.
    async fn open_volume(&mut self) -> Result<OpenVolume, PipelineError> {
        let index = self.next_index;
        let name = self.config.volume_name(index);
        self.ledger
            .open_volume(index, &name, self.next_sequence)
            .await?;

        let (parts, receiver) = mpsc::channel(PART_QUEUE);
        let upload = VolumeUpload {
            index,
            name: name.clone(),
            config: Arc::clone(&self.config),
            source: Arc::clone(&self.source),
            destination: Arc::clone(&self.destination),
            halt: self.halt.clone(),
        };
        let upload = tokio::spawn(upload.run(receiver));

        info!(
            target: TRACING_TARGET,
            index,
            name = %name,
            first_sequence = self.next_sequence,
            "volume opened"
        );
        self.next_index += 1;
        self.outcome.opened += 1;
        self.state.set_open_volume(Some(index));
        Ok(OpenVolume {
            builder: VolumeBuilder::new(
                index,
                self.next_sequence,
                self.config.max_volume_size,
                self.config.part_size,
            ),
            name,
            parts,
            failures: mem::take(&mut self.orphans),
            upload,
        })
    }

    /// Finish the open volume, hand its tail to the uploader and queue it
    /// for commit. Blocks while `pipeline_depth` volumes are in flight.
    async fn close_open(&mut self) -> Result<(), PipelineError> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        let index = open.builder.index();
        let (parts, manifest) = open.builder.finish();
        self.next_sequence = manifest.first_sequence + manifest.entries.len() as u64;
        info!(
            target: TRACING_TARGET,
            index,
            entries = manifest.entries.len(),
            bytes = manifest.container_bytes,
            "volume closed"
        );

        for part in parts {
            if open.parts.send(UploadMessage::Part(part)).await.is_err() {
                return Err(upload_failed(index, open.upload).await);
            }
        }
        if open.parts.send(UploadMessage::Finish(manifest)).await.is_err() {
            return Err(upload_failed(index, open.upload).await);
        }
        self.state.set_open_volume(None);
        self.closed.push_back(ClosedVolume {
            index,
            name: open.name,
            failures: open.failures,
            upload: open.upload,
        });

        while self.closed.len() >= self.config.pipeline_depth {
            self.commit_front().await?;
        }
        Ok(())
    }

    /// Commit, in order, every closed volume whose upload already finished.
    async fn commit_finished(&mut self) -> Result<(), PipelineError> {
        while self
            .closed
            .front()
            .is_some_and(|closed| closed.upload.is_finished())
        {
            self.commit_front().await?;
        }
        Ok(())
    }

    /// Wait for the oldest closed volume's upload, then commit it.
    async fn commit_front(&mut self) -> Result<(), PipelineError> {
        let Some(closed) = self.closed.pop_front() else {
            return Ok(());
        };
        let uploaded = match closed.upload.await {
            Ok(Ok(uploaded)) => uploaded,
            Ok(Err(source)) => {
                return Err(PipelineError::Upload {
                    index: closed.index,
                    source,
                });
            }
            Err(_) => return Err(PipelineError::StageFailed("upload")),
        };
        self.commit(uploaded, &closed.name, &closed.failures).await
    }

    async fn commit(
        &mut self,
        uploaded: UploadedVolume,
        name: &str,
        failures: &[FailedObject],
    ) -> Result<(), PipelineError> {
        let manifest = &uploaded.manifest;
        self.ledger.commit_volume(manifest, name, failures).await?;

        let entries = manifest.entries.len() as u64;
        self.outcome.archived += entries;
        self.outcome.bytes_in += manifest.uncompressed_bytes;
        self.outcome.bytes_out += manifest.container_bytes;
        self.outcome.volumes.push(VolumeSummary {
            index: manifest.index,
            name: name.to_string(),
            entries,
            uncompressed_bytes: manifest.uncompressed_bytes,
            container_bytes: manifest.container_bytes,
            parts: uploaded.parts,
            attempts: uploaded.attempts,
        });
        for _ in 0..entries {
            StageCounters::bump(&self.state.counters.committed);
        }
        Ok(())
    }

    /// Leave the open volume for the next run: its upload is aborted and its
    /// `opened` ledger event marks it as interrupted.
    async fn abandon_open(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        let index = open.builder.index();
        info!(
            target: TRACING_TARGET,
            index,
            entries = open.builder.entry_count(),
            "leaving partial volume for the next run"
        );
        drop(open.parts);
        join_abandoned(index, open.upload).await;
        self.state.set_open_volume(None);
    }

    /// After a halt: abort the open volume and keep committing closed
    /// volumes, in order, for as long as their uploads had already landed.
    async fn wind_down(&mut self) {
        if let Some(open) = self.open.take() {
            let index = open.builder.index();
            drop(open.parts);
            join_abandoned(index, open.upload).await;
        }
        let mut committing = true;
        while let Some(closed) = self.closed.pop_front() {
            if !committing {
                join_abandoned(closed.index, closed.upload).await;
                continue;
            }
            match closed.upload.await {
                Ok(Ok(uploaded)) => {
                    if let Err(err) = self.commit(uploaded, &closed.name, &closed.failures).await {
                        warn!(target: TRACING_TARGET, index = closed.index, error = %err, "commit during shutdown failed");
                        committing = false;
                    }
                }
                Ok(Err(err)) => {
                    if !err.is_shutdown() {
                        warn!(target: TRACING_TARGET, index = closed.index, error = %err, "upload failed during shutdown");
                    }
                    committing = false;
                }
                Err(err) => {
                    warn!(target: TRACING_TARGET, index = closed.index, error = %err, "upload task panicked");
                    committing = false;
                }
            }
        }
    }
}

/// Wait out an upload whose volume will not be committed this run.
async fn join_abandoned(index: u64, upload: UploadTask) {
    match upload.await {
        Ok(Ok(_)) => {
            debug!(target: TRACING_TARGET, index, "upload finished after its volume was given up")
        }
        Ok(Err(err)) if err.is_shutdown() => {}
        Ok(Err(err)) => {
            warn!(target: TRACING_TARGET, index, error = %err, "upload of abandoned volume failed")
        }
        Err(err) => warn!(target: TRACING_TARGET, index, error = %err, "upload task panicked"),
    }
}

/// The part stream closed early, so the upload task already ended. Surface
/// its error.
async fn upload_failed(index: u64, upload: UploadTask) -> PipelineError {
    match upload.await {
        Ok(Err(source)) => PipelineError::Upload { index, source },
        _ => PipelineError::StageFailed("upload"),
    }
}
