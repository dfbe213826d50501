//! Fetcher pool: retrieves admitted objects under the in-flight byte budget.

use backon::Retryable as _;
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    Admitted, Fetched, Outcome, Settled,
    state::{PipelineState, StageCounters},
};
use crate::{
    config::RetryPolicy,
    container::MAX_KEY_LEN,
    models::archive::{FailedObject, FailureStage, FetchedObject, ObjectKey},
    services::store::{SourceError, SourceStore},
};

const TRACING_TARGET: &str = "cold_archiver::pipeline::fetcher";

#[derive(Clone)]
pub(crate) struct Fetcher {
    pub source: Arc<dyn SourceStore>,
    pub retry: RetryPolicy,
    pub verify_etag: bool,
    pub state: Arc<PipelineState>,
    pub halt: CancellationToken,
}

impl Fetcher {
    /// Start `count` workers pulling from `admitted`.
    ///
    /// Fetched objects go to `compress`; objects that cannot be fetched are
    /// settled as failures straight to `settled`. A worker that panics
    /// cancels `halt`.
    pub fn spawn(
        self,
        count: usize,
        admitted: flume::Receiver<Admitted>,
        compress: flume::Sender<Fetched>,
        settled: flume::Sender<Settled>,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let fetcher = self.clone();
                let admitted = admitted.clone();
                let compress = compress.clone();
                let settled = settled.clone();
                tokio::spawn(async move {
                    fetcher.run(worker, admitted, compress, settled).await;
                })
            })
            .collect()
    }

    async fn run(
        self,
        worker: usize,
        admitted: flume::Receiver<Admitted>,
        compress: flume::Sender<Fetched>,
        settled: flume::Sender<Settled>,
    ) {
        let guard = self.halt.clone().drop_guard();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.halt.cancelled() => break,
                next = admitted.recv_async() => next,
            };
            let Ok(Admitted {
                ordinal,
                key,
                ticket,
            }) = next
            else {
                break;
            };

            if key.name.len() > MAX_KEY_LEN {
                let failure = FailedObject::new(
                    &key.name,
                    FailureStage::Verify,
                    format!("key is longer than {MAX_KEY_LEN} bytes"),
                );
                if !self.settle(&settled, ordinal, failure, ticket).await {
                    break;
                }
                continue;
            }

            let budget = tokio::select! {
                biased;
                _ = self.halt.cancelled() => break,
                permit = self.state.budget.acquire(key.size) => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let fetched = tokio::select! {
                biased;
                _ = self.halt.cancelled() => break,
                fetched = self.fetch(&key) => fetched,
            };

            match fetched.and_then(|data| self.verify(&key, data)) {
                Ok(data) => {
                    StageCounters::bump(&self.state.counters.fetched);
                    let fetched = Fetched {
                        ordinal,
                        object: FetchedObject { key, data },
                        ticket,
                        budget,
                    };
                    let sent = tokio::select! {
                        biased;
                        _ = self.halt.cancelled() => break,
                        sent = compress.send_async(fetched) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Err(failure) => {
                    drop(budget);
                    if !self.settle(&settled, ordinal, failure, ticket).await {
                        break;
                    }
                }
            }
        }
        guard.disarm();
        debug!(target: TRACING_TARGET, worker, "fetcher stopped");
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Bytes, FailedObject> {
        let get = || {
            let source = Arc::clone(&self.source);
            let name = key.name.clone();
            async move { source.get(&name).await }
        };
        get.retry(self.retry.backoff())
            .when(SourceError::is_transient)
            .notify(|err, delay| {
                warn!(
                    target: TRACING_TARGET,
                    key = %key.name,
                    error = %err,
                    retry_in = ?delay,
                    "fetch failed, retrying"
                );
            })
            .await
            .map_err(|err| {
                let failure = FailedObject::new(&key.name, FailureStage::Fetch, err.to_string());
                if err.is_transient() {
                    warn!(target: TRACING_TARGET, key = %key.name, error = %err, "retries exhausted, leaving object for the next run");
                    failure.into_retryable()
                } else {
                    warn!(target: TRACING_TARGET, key = %key.name, error = %err, "giving up on object");
                    failure
                }
            })
    }

    /// Check the fetched bytes against what the listing reported.
    fn verify(&self, key: &ObjectKey, data: Bytes) -> Result<Bytes, FailedObject> {
        let mismatch =
            |reason: String| Err(FailedObject::new(&key.name, FailureStage::Verify, reason));

        if data.len() as u64 != key.size {
            return mismatch(format!(
                "listed as {} bytes, fetched {}",
                key.size,
                data.len()
            ));
        }
        if self.verify_etag {
            if let Some(expected) = key.checksum.as_deref().and_then(md5_etag) {
                let actual = format!("{:x}", md5::compute(&data));
                if actual != expected {
                    return mismatch(format!("etag {expected} does not match content {actual}"));
                }
            }
        }
        Ok(data)
    }

    async fn settle(
        &self,
        settled: &flume::Sender<Settled>,
        ordinal: u64,
        failure: FailedObject,
        ticket: tokio::sync::OwnedSemaphorePermit,
    ) -> bool {
        StageCounters::bump(&self.state.counters.failed);
        let message = Settled {
            ordinal,
            outcome: Outcome::Failed(failure),
            ticket,
        };
        tokio::select! {
            biased;
            _ = self.halt.cancelled() => false,
            sent = settled.send_async(message) => sent.is_ok(),
        }
    }
}

/// The ETag as a lowercase MD5 hex digest, when it is one. Multipart
/// ETags (`<md5>-<parts>`) and other formats are not content digests.
fn md5_etag(etag: &str) -> Option<String> {
    let etag = etag.trim_matches('"');
    (etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit()))
        .then(|| etag.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PipelineConfig,
        services::memory_store::{MemoryStore, SourceFault},
    };
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn fetcher(store: &MemoryStore) -> Fetcher {
        Fetcher {
            source: Arc::new(store.clone()),
            retry: RetryPolicy {
                max_attempts: 4,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            verify_etag: true,
            state: PipelineState::new(&PipelineConfig::default()),
            halt: CancellationToken::new(),
        }
    }

    fn key(name: &str, data: &[u8]) -> ObjectKey {
        ObjectKey {
            name: name.into(),
            size: data.len() as u64,
            checksum: Some(format!("\"{:x}\"", md5::compute(data))),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn only_plain_md5_etags_are_digests() {
        assert_eq!(
            md5_etag("\"0CC175B9C0F1B6A831C399E269772661\"").as_deref(),
            Some("0cc175b9c0f1b6a831c399e269772661")
        );
        assert_eq!(md5_etag("0cc175b9c0f1b6a831c399e269772661-3"), None);
        assert_eq!(md5_etag("abc"), None);
    }

    #[tokio::test]
    async fn throttled_fetch_is_retried() {
        let store = MemoryStore::new();
        store.put("a", Bytes::from_static(b"alpha"));
        store.throttle("a", 2);
        let data = fetcher(&store).fetch(&key("a", b"alpha")).await.unwrap();
        assert_eq!(data, "alpha");
        assert_eq!(store.stats().gets, 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let store = MemoryStore::new();
        store.put("a", Bytes::from_static(b"alpha"));
        store.fail_permanently("a", SourceFault::AccessDenied);
        let failure = fetcher(&store).fetch(&key("a", b"alpha")).await.unwrap_err();
        assert_eq!(failure.stage, FailureStage::Fetch);
        assert!(!failure.retryable);
        assert_eq!(store.stats().gets, 1);
    }

    #[tokio::test]
    async fn exhausted_throttling_stays_retryable() {
        let store = MemoryStore::new();
        store.put("a", Bytes::from_static(b"alpha"));
        store.throttle("a", 10);
        let failure = fetcher(&store).fetch(&key("a", b"alpha")).await.unwrap_err();
        assert!(failure.retryable);
        assert_eq!(store.stats().gets, 4);
    }

    #[tokio::test]
    async fn content_must_match_listing() {
        let store = MemoryStore::new();
        let fetcher = fetcher(&store);
        let listed = key("a", b"alpha");

        assert!(fetcher.verify(&listed, Bytes::from_static(b"alpha")).is_ok());
        let short = fetcher.verify(&listed, Bytes::from_static(b"alp")).unwrap_err();
        assert_eq!(short.stage, FailureStage::Verify);
        let altered = fetcher.verify(&listed, Bytes::from_static(b"alphA")).unwrap_err();
        assert!(altered.reason.contains("etag"));
    }

    #[tokio::test]
    async fn failures_settle_without_compression() {
        let store = MemoryStore::new();
        store.put("a", Bytes::from_static(b"alpha"));
        store.fail_permanently("b", SourceFault::NotFound);
        let window = Arc::new(Semaphore::new(8));

        let (admit_tx, admit_rx) = flume::unbounded();
        let (compress_tx, compress_rx) = flume::unbounded();
        let (settled_tx, settled_rx) = flume::unbounded();
        for (ordinal, (name, data)) in [("a", &b"alpha"[..]), ("b", &b"beta"[..])]
            .into_iter()
            .enumerate()
        {
            admit_tx
                .send(Admitted {
                    ordinal: ordinal as u64,
                    key: key(name, data),
                    ticket: window.clone().try_acquire_owned().unwrap(),
                })
                .unwrap();
        }
        drop(admit_tx);

        let handles = fetcher(&store).spawn(2, admit_rx, compress_tx, settled_tx);
        for handle in handles {
            handle.await.unwrap();
        }

        let fetched: Vec<_> = compress_rx.drain().collect();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].object.key.name, "a");
        assert_eq!(fetched[0].budget.bytes(), 5);

        let settled: Vec<_> = settled_rx.drain().collect();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].ordinal, 1);
        assert!(matches!(&settled[0].outcome, Outcome::Failed(f) if f.key == "b"));
    }
}
