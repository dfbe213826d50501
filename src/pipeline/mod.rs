//! The archival pipeline.
//!
//! ```text
//! lister ──admitted──▶ fetchers ──fetched──▶ compressors ──settled──▶ assembler ──parts──▶ uploads
//!                          └──────────── failures ───────────────────────┘
//! ```
//!
//! The lister numbers every unsettled key in listing order. Fetchers and
//! compressors work out of order; the assembler puts results back in
//! order, packs them into volumes and commits each uploaded volume to the
//! ledger. Memory is bounded by the in-flight byte budget, the reorder
//! window and the number of volumes uploading at once.

pub mod assembler;
pub mod compressor;
pub mod fetcher;
pub mod lister;
pub mod reorder;
pub mod report;
pub mod state;
pub mod uploader;

use std::{
    sync::{Arc, atomic::Ordering::Relaxed},
    time::Duration,
};
use tokio::{sync::OwnedSemaphorePermit, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::PipelineConfig,
    errors::PipelineError,
    models::archive::{CompressedEntry, FailedObject, FetchedObject, ObjectKey},
    services::{
        ledger_service::{Ledger, LedgerSnapshot},
        store::{DestinationStore, SourceStore},
    },
};
use assembler::{Assembler, AssemblyOutcome};
use fetcher::Fetcher;
use lister::Lister;
use report::{ArchiveReport, RunOutcome};
use state::{BudgetPermit, PipelineState};

const TRACING_TARGET: &str = "cold_archiver::pipeline";

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// A key the lister let into the pipeline. `ticket` is its slot in the
/// reorder window, held until the assembler consumes the object.
pub(crate) struct Admitted {
    pub ordinal: u64,
    pub key: ObjectKey,
    pub ticket: OwnedSemaphorePermit,
}

pub(crate) struct Fetched {
    pub ordinal: u64,
    pub object: FetchedObject,
    pub ticket: OwnedSemaphorePermit,
    pub budget: BudgetPermit,
}

pub(crate) enum Outcome {
    Archived(CompressedEntry),
    Failed(FailedObject),
}

/// An object that is done being worked on, one way or the other.
pub(crate) struct Settled {
    pub ordinal: u64,
    pub outcome: Outcome,
    pub ticket: OwnedSemaphorePermit,
}

/// Two-level shutdown request.
///
/// `drain` stops admitting new keys and lets admitted ones finish. `abort`
/// also stops in-flight work and aborts uploads. Either way the ledger is
/// left consistent.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    drain: CancellationToken,
    abort: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) {
        self.drain.cancel();
    }

    pub fn abort(&self) {
        self.drain.cancel();
        self.abort.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

/// Runs the pipeline for one archive.
pub struct Archiver {
    config: Arc<PipelineConfig>,
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    ledger: Ledger,
}

impl Archiver {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        ledger: Ledger,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            source,
            destination,
            ledger,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Archive every unsettled source object, resuming from the ledger.
    ///
    /// Errors are returned only when the run cannot start (the ledger
    /// cannot be read or resume is disabled over existing progress). Once
    /// started, every ending, fatal ones included, is described by the
    /// report.
    pub async fn run(&self, signal: ShutdownSignal) -> Result<ArchiveReport, PipelineError> {
        let started = Instant::now();
        let snapshot = self.ledger.load().await?;
        if !self.config.resume && !snapshot.is_empty() {
            return Err(PipelineError::ResumeDisabled {
                committed: snapshot.committed_count(),
                volumes: snapshot.committed_volumes().count() as u64,
            });
        }
        if let Some(volume) = &snapshot.interrupted_volume {
            warn!(
                target: TRACING_TARGET,
                index = volume.index,
                name = %volume.object_name,
                "previous run stopped inside this volume, rebuilding it"
            );
        }
        let previously_archived = snapshot.committed_count();
        let prior_failures = snapshot.failures();
        info!(
            target: TRACING_TARGET,
            previously_archived,
            previously_failed = prior_failures.len(),
            next_volume = snapshot.next_volume_index,
            next_sequence = snapshot.next_sequence,
            "starting archive run"
        );

        let state = PipelineState::new(&self.config);
        let halt = signal.abort.child_token();
        let (assembly, error) = self.execute(&snapshot, &state, &signal, &halt).await;
        if let Some(volume) = &snapshot.interrupted_volume {
            if assembly.opened == 0 {
                if let Err(err) = self
                    .ledger
                    .abandon_volume(volume.index, &volume.object_name, volume.first_sequence)
                    .await
                {
                    warn!(target: TRACING_TARGET, index = volume.index, error = %err, "could not abandon interrupted volume");
                }
            }
        }

        let mut failures = prior_failures;
        failures.extend(assembly.failed.iter().cloned());
        failures.sort_by(|a, b| a.key.cmp(&b.key));

        let outcome = if error.is_some() {
            RunOutcome::Fatal
        } else if signal.is_aborted() || halt.is_cancelled() || !state.listing_complete() {
            RunOutcome::Interrupted
        } else if !failures.is_empty() {
            RunOutcome::PartialSuccess
        } else {
            RunOutcome::Success
        };

        let report = ArchiveReport {
            outcome,
            objects_archived: assembly.archived,
            objects_previously_archived: previously_archived,
            objects_skipped: state.counters.skipped.load(Relaxed),
            objects_failed: failures,
            compression_ratio: ArchiveReport::ratio(assembly.bytes_in, assembly.bytes_out),
            volumes: assembly.volumes,
            bytes_in: assembly.bytes_in,
            bytes_out: assembly.bytes_out,
            peak_in_flight_bytes: state.budget.peak(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: error.map(|err| err.to_string()),
        };
        report.log();
        Ok(report)
    }

    /// Wire the stages together, run them to completion and collect the
    /// first error that was not caused by a shutdown request.
    async fn execute(
        &self,
        snapshot: &LedgerSnapshot,
        state: &Arc<PipelineState>,
        signal: &ShutdownSignal,
        halt: &CancellationToken,
    ) -> (AssemblyOutcome, Option<PipelineError>) {
        let config = &self.config;
        let (admit_tx, admit_rx) = flume::bounded(config.fetch_concurrency * 2);
        let (fetched_tx, fetched_rx) = flume::bounded(config.compress_concurrency * 2);
        let (settled_tx, settled_rx) =
            flume::bounded(config.fetch_concurrency + config.compress_concurrency);

        let compressors = match compressor::spawn(
            config.compress_concurrency,
            config.compression_level,
            fetched_rx,
            settled_tx.clone(),
            Arc::clone(state),
            halt.clone(),
        ) {
            Ok(handles) => handles,
            Err(err) => {
                warn!(target: TRACING_TARGET, error = %err, "could not start compressor threads");
                return (
                    AssemblyOutcome::default(),
                    Some(PipelineError::StageFailed("compress")),
                );
            }
        };

        let assembler = Assembler::new(
            Arc::clone(config),
            self.ledger.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.destination),
            Arc::clone(state),
            halt.clone(),
            snapshot.next_volume_index,
            snapshot.next_sequence,
        );
        let assembler = tokio::spawn(assembler.run(settled_rx));

        let fetchers = Fetcher {
            source: Arc::clone(&self.source),
            retry: config.retry,
            verify_etag: config.verify_source_etag,
            state: Arc::clone(state),
            halt: halt.clone(),
        }
        .spawn(config.fetch_concurrency, admit_rx, fetched_tx, settled_tx);

        let lister = Lister {
            source: Arc::clone(&self.source),
            prefix: config.source_prefix.clone(),
            retry: config.retry,
            settled: snapshot.settled_keys(),
            state: Arc::clone(state),
            drain: signal.drain.clone(),
            halt: halt.clone(),
        };
        // A failed or panicked lister only closes admission: `admit_tx` is
        // dropped with it and everything already admitted drains through.
        let lister = tokio::spawn(lister.run(admit_tx));

        let progress = CancellationToken::new();
        tokio::spawn(report_progress(
            Arc::clone(state),
            config.reorder_window,
            progress.clone(),
        ));
        let _stop_progress = progress.drop_guard();

        let mut errors = Vec::new();
        match lister.await {
            Ok(Ok(summary)) => debug!(
                target: TRACING_TARGET,
                admitted = summary.admitted,
                complete = summary.complete,
                "lister finished"
            ),
            Ok(Err(err)) => errors.push(err),
            Err(_) => errors.push(PipelineError::StageFailed("list")),
        }
        for fetcher in fetchers {
            if fetcher.await.is_err() {
                errors.push(PipelineError::StageFailed("fetch"));
            }
        }
        let joined = tokio::task::spawn_blocking(move || {
            compressors
                .into_iter()
                .map(|handle| handle.join())
                .filter(Result::is_err)
                .count()
        })
        .await;
        if !matches!(joined, Ok(0)) {
            errors.push(PipelineError::StageFailed("compress"));
        }
        let assembly = match assembler.await {
            Ok((assembly, error)) => {
                errors.extend(error);
                assembly
            }
            Err(_) => {
                errors.push(PipelineError::StageFailed("assemble"));
                AssemblyOutcome::default()
            }
        };

        let error = errors.into_iter().find(|err| !err.is_shutdown());
        (assembly, error)
    }
}

/// Log stage counters every [`PROGRESS_INTERVAL`] until `done` is cancelled.
async fn report_progress(state: Arc<PipelineState>, window: usize, done: CancellationToken) {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let counters = &state.counters;
        info!(
            target: TRACING_TARGET,
            listed = counters.listed.load(Relaxed),
            skipped = counters.skipped.load(Relaxed),
            fetched = counters.fetched.load(Relaxed),
            compressed = counters.compressed.load(Relaxed),
            committed = counters.committed.load(Relaxed),
            failed = counters.failed.load(Relaxed),
            admitted = state.admitted(window),
            in_flight_bytes = state.budget.in_flight(),
            open_volume = ?state.open_volume(),
            "progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_implies_drain() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_draining());
        signal.drain();
        assert!(signal.is_draining() && !signal.is_aborted());

        let signal = ShutdownSignal::new();
        signal.abort();
        assert!(signal.is_draining() && signal.is_aborted());
    }
}
