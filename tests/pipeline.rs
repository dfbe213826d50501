use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use xxhash_rust::xxh3::xxh3_64;

use cold_archiver::{
    config::{PipelineConfig, RetryPolicy},
    container::VolumeReader,
    db,
    errors::PipelineError,
    models::archive::FailureStage,
    pipeline::{
        Archiver, ShutdownSignal,
        report::{ArchiveReport, RunOutcome},
    },
    services::{
        ledger_service::Ledger,
        memory_store::{MemoryStore, SourceFault},
        restore_service::RestoreService,
        storage_service::StorageService,
        store::{ListPage, SourceError, SourceStore},
    },
};

/// Incompressible bytes, reproducible from `seed`.
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + 8);
    let mut i = 0u64;
    while out.len() < len {
        out.extend_from_slice(&xxh3_64(&[seed.to_le_bytes(), i.to_le_bytes()].concat()).to_le_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

/// 400 KiB: 300 KiB of noise then 100 KiB of zeros.
fn sample(seed: u64) -> Bytes {
    let mut data = noise(seed, 300 << 10);
    data.resize(400 << 10, 0);
    Bytes::from(data)
}

fn config() -> PipelineConfig {
    PipelineConfig {
        max_volume_size: 1 << 20,
        part_size: 256 << 10,
        fetch_concurrency: 4,
        compress_concurrency: 2,
        in_flight_byte_budget: 2 << 20,
        reorder_window: 16,
        retry: RetryPolicy {
            max_attempts: 4,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..PipelineConfig::default()
    }
}

struct Harness {
    source: MemoryStore,
    destination: MemoryStore,
    dir: TempDir,
}

impl Harness {
    fn new(keys: &[&str]) -> Self {
        let source = MemoryStore::new().with_page_size(2);
        for (seed, key) in keys.iter().enumerate() {
            source.put(*key, sample(seed as u64));
        }
        Self {
            source,
            destination: MemoryStore::new(),
            dir: TempDir::new().unwrap(),
        }
    }

    async fn ledger(&self) -> Ledger {
        let url = format!("sqlite://{}", self.dir.path().join("ledger.db").display());
        Ledger::open(&url).await.unwrap()
    }

    async fn try_run(
        &self,
        config: PipelineConfig,
        signal: ShutdownSignal,
    ) -> Result<ArchiveReport, PipelineError> {
        self.run_from(Arc::new(self.source.clone()), config, signal)
            .await
    }

    async fn run_from(
        &self,
        source: Arc<dyn SourceStore>,
        config: PipelineConfig,
        signal: ShutdownSignal,
    ) -> Result<ArchiveReport, PipelineError> {
        Archiver::new(
            config,
            source,
            Arc::new(self.destination.clone()),
            self.ledger().await,
        )?
        .run(signal)
        .await
    }

    async fn run(&self, config: PipelineConfig) -> ArchiveReport {
        self.try_run(config, ShutdownSignal::new()).await.unwrap()
    }

    /// Keys stored in a destination volume, in order, after checking every
    /// entry decompresses to the source object.
    fn volume_keys(&self, name: &str) -> Vec<String> {
        let volume = self.destination.object(name).unwrap();
        let mut reader = VolumeReader::new(&volume[..]);
        let mut keys = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            let data = entry.decompress().unwrap();
            assert_eq!(self.source.object(&entry.header.key).unwrap(), data);
            keys.push(entry.header.key);
        }
        assert_eq!(reader.trailer().unwrap().entry_count, keys.len() as u64);
        keys
    }
}

/// Requests a drain the moment the second listing page is asked for, so
/// exactly the first page is admitted.
struct DrainAfterFirstPage {
    inner: MemoryStore,
    signal: ShutdownSignal,
}

#[async_trait]
impl SourceStore for DrainAfterFirstPage {
    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ListPage, SourceError> {
        if continuation_token.is_some() {
            self.signal.drain();
        }
        self.inner.list(prefix, continuation_token).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, SourceError> {
        self.inner.get(key).await
    }
}

/// Volumes small enough that every sample gets its own.
fn one_per_volume() -> PipelineConfig {
    PipelineConfig {
        max_volume_size: 512 << 10,
        ..config()
    }
}

#[tokio::test]
async fn three_objects_share_one_volume() {
    let harness = Harness::new(&["a", "b", "c"]);
    let report = harness.run(config()).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.objects_archived, 3);
    assert_eq!(report.volumes.len(), 1);
    assert_eq!(report.volumes[0].name, "archive-000000.vol");
    assert_eq!(report.volumes[0].entries, 3);
    assert!(report.volumes[0].container_bytes <= 1 << 20);
    assert!(report.compression_ratio > 1.0);
    assert!(report.peak_in_flight_bytes <= 2 << 20);
    assert_eq!(harness.volume_keys("archive-000000.vol"), ["a", "b", "c"]);
    assert_eq!(harness.destination.open_uploads(), 0);
}

#[tokio::test]
async fn volume_that_would_overflow_is_closed() {
    let harness = Harness::new(&["a", "b", "c", "d"]);
    let report = harness.run(config()).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    let entries: Vec<_> = report.volumes.iter().map(|v| v.entries).collect();
    assert_eq!(entries, [3, 1]);
    assert_eq!(harness.volume_keys("archive-000000.vol"), ["a", "b", "c"]);
    assert_eq!(harness.volume_keys("archive-000001.vol"), ["d"]);

    let snapshot = harness.ledger().await.load().await.unwrap();
    assert_eq!(snapshot.committed_count(), 4);
    assert_eq!(snapshot.next_volume_index, 2);
    assert_eq!(snapshot.next_sequence, 4);
    let second: Vec<_> = snapshot
        .records_for_volume(1)
        .iter()
        .map(|r| (r.key.clone(), r.sequence))
        .collect();
    assert_eq!(second, [("d".to_string(), Some(3))]);
}

#[tokio::test]
async fn missing_object_is_reported_not_fatal() {
    let harness = Harness::new(&["a", "b", "c"]);
    harness.source.fail_permanently("b", SourceFault::NotFound);
    let report = harness.run(config()).await;

    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
    assert_eq!(report.outcome.exit_code(), 2);
    assert_eq!(report.objects_archived, 2);
    assert_eq!(report.objects_failed.len(), 1);
    assert_eq!(report.objects_failed[0].key, "b");
    assert_eq!(report.objects_failed[0].stage, FailureStage::Fetch);
    assert_eq!(harness.volume_keys("archive-000000.vol"), ["a", "c"]);

    let snapshot = harness.ledger().await.load().await.unwrap();
    assert!(snapshot.is_settled("b"));
    assert_eq!(snapshot.failures().len(), 1);
}

#[tokio::test]
async fn throttled_reads_are_retried() {
    let harness = Harness::new(&["a", "b", "c"]);
    harness.source.throttle("b", 2);
    let report = harness.run(config()).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.objects_archived, 3);
    assert_eq!(harness.source.stats().gets, 5);
}

#[tokio::test]
async fn oversize_object_gets_a_volume_of_its_own() {
    let harness = Harness::new(&[]);
    harness.source.put("a", noise(1, 1 << 10));
    harness.source.put("b", noise(2, 200 << 10));
    harness.source.put("c", noise(3, 1 << 10));
    let report = harness
        .run(PipelineConfig {
            max_volume_size: 64 << 10,
            part_size: 16 << 10,
            ..config()
        })
        .await;

    assert_eq!(report.outcome, RunOutcome::Success);
    let entries: Vec<_> = report.volumes.iter().map(|v| v.entries).collect();
    assert_eq!(entries, [1, 1, 1]);
    assert!(report.volumes[1].container_bytes > 64 << 10);
    assert!(report.volumes[1].parts > 1);
    assert_eq!(harness.volume_keys("archive-000001.vol"), ["b"]);
}

#[tokio::test]
async fn second_run_over_a_finished_archive_does_nothing() {
    let harness = Harness::new(&["a", "b", "c", "d"]);
    harness.run(config()).await;
    let source = harness.source.stats();
    let destination = harness.destination.stats();

    let report = harness.run(config()).await;
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.objects_archived, 0);
    assert_eq!(report.objects_previously_archived, 4);
    assert_eq!(report.objects_skipped, 4);
    assert!(report.volumes.is_empty());
    assert_eq!(harness.source.stats().gets, source.gets);
    assert_eq!(
        harness.destination.stats().uploads_started,
        destination.uploads_started
    );
}

#[tokio::test]
async fn resumed_archive_matches_uninterrupted_one() {
    let keys = ["a", "b", "c", "d"];
    let reference = Harness::new(&keys);
    reference.run(config()).await;

    let harness = Harness::new(&keys);
    harness
        .destination
        .reject_completion("archive-000001.vol", 1);
    let failed = harness
        .run(PipelineConfig {
            volume_upload_attempts: 1,
            ..config()
        })
        .await;
    assert_eq!(failed.outcome, RunOutcome::Fatal);
    assert_eq!(failed.outcome.exit_code(), 1);
    assert!(failed.error.is_some());
    assert_eq!(failed.objects_archived, 3);
    assert!(harness.destination.object("archive-000001.vol").is_none());
    assert_eq!(harness.destination.open_uploads(), 0);

    let snapshot = harness.ledger().await.load().await.unwrap();
    assert_eq!(snapshot.interrupted_volume.map(|v| v.index), Some(1));

    let resumed = harness.run(config()).await;
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.objects_archived, 1);
    assert_eq!(resumed.objects_previously_archived, 3);
    assert_eq!(resumed.volumes.len(), 1);
    assert_eq!(resumed.volumes[0].index, 1);

    for name in ["archive-000000.vol", "archive-000001.vol"] {
        assert_eq!(
            harness.destination.object(name),
            reference.destination.object(name),
            "{name}"
        );
    }
}

#[tokio::test]
async fn rejected_part_rebuilds_the_volume() {
    let harness = Harness::new(&["a", "b"]);
    harness.destination.reject_parts(1);
    let report = harness.run(config()).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.volumes[0].attempts, 2);
    assert_eq!(harness.volume_keys("archive-000000.vol"), ["a", "b"]);
    assert_eq!(harness.destination.stats().uploads_aborted, 1);
    assert_eq!(harness.destination.open_uploads(), 0);
}

#[tokio::test]
async fn drained_run_is_resumed_later() {
    let harness = Harness::new(&["a", "b", "c"]);
    let signal = ShutdownSignal::new();
    signal.drain();
    let report = harness.try_run(config(), signal).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.objects_archived, 0);
    assert_eq!(harness.destination.stats().uploads_started, 0);

    let signal = ShutdownSignal::new();
    signal.abort();
    let report = harness.try_run(config(), signal).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted);

    let report = harness.run(config()).await;
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.objects_archived, 3);
}

#[tokio::test]
async fn resume_can_be_refused() {
    let harness = Harness::new(&["a"]);
    harness.run(config()).await;
    let err = harness
        .try_run(
            PipelineConfig {
                resume: false,
                ..config()
            },
            ShutdownSignal::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ResumeDisabled {
            committed: 1,
            volumes: 1
        }
    ));
}

#[tokio::test]
async fn local_buckets_round_trip() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}", dir.path().join("meta.db").display());
    let pool = db::connect(&url, 4).await.unwrap();
    db::run_migrations(&pool, db::OBJECT_STORE_SCHEMA).await.unwrap();
    let storage = StorageService::new(Arc::new(pool), dir.path().join("objects"));

    storage.ensure_bucket("source-bucket").await.unwrap();
    storage.ensure_bucket("archive-bucket").await.unwrap();
    let objects = [
        ("logs/2024/01.txt", sample(1)),
        ("logs/2024/02.txt", sample(2)),
        ("photos/cat.jpg", Bytes::from(noise(3, 10_000))),
        ("empty", Bytes::new()),
    ];
    for (key, data) in &objects {
        let chunk = data.clone();
        storage
            .upload_object_stream(
                "source-bucket",
                key,
                None,
                futures::stream::once(async move { Ok::<_, std::io::Error>(chunk) }),
            )
            .await
            .unwrap();
    }

    let ledger_url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let archiver = Archiver::new(
        PipelineConfig {
            destination_prefix: "cold/".into(),
            archive_name: "source-bucket".into(),
            ..config()
        },
        Arc::new(storage.bucket("source-bucket").with_page_size(2)),
        Arc::new(storage.bucket("archive-bucket")),
        Ledger::open(&ledger_url).await.unwrap(),
    )
    .unwrap();
    let report = archiver.run(ShutdownSignal::new()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.objects_archived, 4);
    assert_eq!(report.volumes[0].name, "cold/source-bucket-000000.vol");

    let restore = RestoreService::new(storage.clone());
    let verified = restore.verify("archive-bucket", "cold/").await.unwrap();
    assert!(verified.is_clean());
    assert_eq!(verified.objects, 4);

    let extracted = restore
        .extract("archive-bucket", "cold/", "restored-bucket", "copy/")
        .await
        .unwrap();
    assert!(extracted.is_clean());
    for (key, data) in &objects {
        let restored = storage
            .get_object_bytes("restored-bucket", &format!("copy/{key}"))
            .await
            .unwrap();
        assert_eq!(&restored, data, "{key}");
    }
}

#[tokio::test]
async fn listing_failure_lets_admitted_objects_drain() {
    let harness = Harness::new(&["a", "b", "c"]);
    harness.source.fail_listing_after(1);
    let report = harness.run(one_per_volume()).await;

    assert_eq!(report.outcome, RunOutcome::Fatal);
    assert!(report.error.as_deref().is_some_and(|e| e.contains("listing")));
    assert_eq!(report.objects_archived, 1);
    assert_eq!(harness.volume_keys("archive-000000.vol"), ["a"]);
    assert!(harness.destination.object("archive-000001.vol").is_none());
    assert_eq!(harness.destination.stats().uploads_started, 2);
    assert_eq!(harness.destination.open_uploads(), 0);

    harness.source.clear_faults();
    let resumed = harness.run(one_per_volume()).await;
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.objects_archived, 2);
    assert_eq!(resumed.objects_previously_archived, 1);
    assert_eq!(harness.volume_keys("archive-000001.vol"), ["b"]);
    assert_eq!(harness.volume_keys("archive-000002.vol"), ["c"]);
}

#[tokio::test]
async fn pipeline_depth_bounds_volumes_in_flight() {
    let keys = ["a", "b", "c", "d"];
    for depth in [1, 2] {
        let harness = Harness {
            destination: MemoryStore::new().with_part_delay(Duration::from_millis(50)),
            ..Harness::new(&keys)
        };
        let report = harness
            .run(PipelineConfig {
                pipeline_depth: depth,
                ..one_per_volume()
            })
            .await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.volumes.len(), 4);
        assert_eq!(
            harness.destination.stats().peak_open_uploads,
            depth as u64,
            "pipeline depth {depth}"
        );
    }
}

#[tokio::test]
async fn drain_can_close_the_partial_volume() {
    let harness = Harness::new(&["a", "b", "c", "d"]);
    let signal = ShutdownSignal::new();
    let source = Arc::new(DrainAfterFirstPage {
        inner: harness.source.clone(),
        signal: signal.clone(),
    });
    let report = harness
        .run_from(
            source,
            PipelineConfig {
                close_partial_on_shutdown: true,
                ..config()
            },
            signal,
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.objects_archived, 2);
    assert_eq!(harness.volume_keys("archive-000000.vol"), ["a", "b"]);

    let resumed = harness.run(config()).await;
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.objects_archived, 2);
    assert_eq!(harness.volume_keys("archive-000001.vol"), ["c", "d"]);
}

#[tokio::test]
async fn drain_leaves_the_partial_volume_for_the_next_run() {
    let harness = Harness::new(&["a", "b", "c", "d"]);
    let signal = ShutdownSignal::new();
    let source = Arc::new(DrainAfterFirstPage {
        inner: harness.source.clone(),
        signal: signal.clone(),
    });
    let report = harness.run_from(source, config(), signal).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.objects_archived, 0);
    assert!(harness.destination.object("archive-000000.vol").is_none());
    assert_eq!(harness.destination.stats().uploads_aborted, 1);
    let snapshot = harness.ledger().await.load().await.unwrap();
    assert_eq!(snapshot.interrupted_volume.map(|v| v.index), Some(0));

    let resumed = harness.run(config()).await;
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.objects_archived, 4);
    assert_eq!(harness.volume_keys("archive-000000.vol"), ["a", "b", "c"]);
    assert_eq!(harness.volume_keys("archive-000001.vol"), ["d"]);
}

#[tokio::test]
async fn throttled_parts_are_retried_in_place() {
    let harness = Harness::new(&["a", "b"]);
    harness.destination.throttle_parts(2);
    let report = harness.run(config()).await;

    assert_eq!(report.outcome, RunOutcome::Success);
    assert_eq!(report.volumes[0].attempts, 1);
    assert_eq!(harness.volume_keys("archive-000000.vol"), ["a", "b"]);
    assert_eq!(harness.destination.stats().uploads_started, 1);
    assert_eq!(harness.destination.stats().uploads_aborted, 0);
}

#[tokio::test]
async fn object_throttled_past_retries_is_archived_next_run() {
    let harness = Harness::new(&["a", "b", "c"]);
    harness.source.throttle("b", 100);
    let report = harness.run(config()).await;

    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
    assert_eq!(report.objects_archived, 2);
    assert_eq!(report.objects_failed.len(), 1);
    assert_eq!(report.objects_failed[0].key, "b");
    assert!(report.objects_failed[0].retryable);
    let snapshot = harness.ledger().await.load().await.unwrap();
    assert!(!snapshot.is_settled("b"));
    assert!(snapshot.failures().is_empty());

    harness.source.clear_faults();
    let resumed = harness.run(config()).await;
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.objects_archived, 1);
    assert!(resumed.objects_failed.is_empty());
    assert_eq!(harness.volume_keys("archive-000001.vol"), ["b"]);
}

#[tokio::test]
async fn unused_interrupted_volume_is_closed_out() {
    let harness = Harness::new(&["a", "b"]);
    harness
        .destination
        .reject_completion("archive-000000.vol", 1);
    let failed = harness
        .run(PipelineConfig {
            volume_upload_attempts: 1,
            ..config()
        })
        .await;
    assert_eq!(failed.outcome, RunOutcome::Fatal);
    let snapshot = harness.ledger().await.load().await.unwrap();
    assert_eq!(snapshot.interrupted_volume.map(|v| v.index), Some(0));

    harness.source.fail_permanently("a", SourceFault::NotFound);
    harness.source.fail_permanently("b", SourceFault::AccessDenied);
    let report = harness.run(config()).await;
    assert_eq!(report.outcome, RunOutcome::PartialSuccess);
    assert!(report.volumes.is_empty());
    assert_eq!(report.objects_failed.len(), 2);

    let snapshot = harness.ledger().await.load().await.unwrap();
    assert!(snapshot.interrupted_volume.is_none());
    assert_eq!(snapshot.next_volume_index, 0);
    assert_eq!(snapshot.failures().len(), 2);
}
