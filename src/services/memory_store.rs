//! In-process bucket implementing both store traits.
//!
//! Faults can be injected per key or per operation, and every call is
//! counted, which is what the pipeline tests lean on to observe retries,
//! skipped objects and idempotent re-runs.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use uuid::Uuid;

use crate::{
    models::archive::ObjectKey,
    services::store::{
        CompletedPart, DestinationError, DestinationStore, ListPage, SourceError, SourceStore,
    },
};

/// Permanent error returned for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFault {
    NotFound,
    AccessDenied,
}

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub lists: u64,
    pub gets: u64,
    pub uploads_started: u64,
    pub parts_uploaded: u64,
    pub uploads_completed: u64,
    pub uploads_aborted: u64,

    /// Most multipart uploads ever in progress at once.
    pub peak_open_uploads: u64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    name: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct Faults {
    permanent: HashMap<String, SourceFault>,
    throttled: HashMap<String, u32>,
    list_failures: u32,
    listing_breaks_after: Option<u64>,
    throttled_parts: u32,
    rejected_parts: u32,
    rejected_completions: HashMap<String, u32>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    page_size: Option<usize>,
    part_delay: Option<Duration>,
    faults: Faults,
    stats: StoreStats,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys returned per listing page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = Some(page_size.max(1));
        self
    }

    /// Delay every part upload, standing in for a slow destination.
    pub fn with_part_delay(self, delay: Duration) -> Self {
        self.lock().part_delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object, replacing any previous one.
    pub fn put(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        let data = data.into();
        let object = StoredObject {
            etag: format!("{:x}", md5::compute(&data)),
            data,
            last_modified: Utc::now(),
        };
        self.lock().objects.insert(key.into(), object);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).map(|o| o.data.clone())
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }

    /// Multipart uploads started but neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Make every `get` of `key` fail permanently.
    pub fn fail_permanently(&self, key: impl Into<String>, fault: SourceFault) {
        self.lock().faults.permanent.insert(key.into(), fault);
    }

    /// Throttle the next `times` gets of `key`.
    pub fn throttle(&self, key: impl Into<String>, times: u32) {
        self.lock().faults.throttled.insert(key.into(), times);
    }

    /// Fail the next `times` listing calls with a transient error.
    pub fn fail_listing(&self, times: u32) {
        self.lock().faults.list_failures = times;
    }

    /// Serve the first `pages` listing calls, then fail every later one
    /// with a transient error.
    pub fn fail_listing_after(&self, pages: u64) {
        self.lock().faults.listing_breaks_after = Some(pages);
    }

    /// Throttle the next `times` part uploads.
    pub fn throttle_parts(&self, times: u32) {
        self.lock().faults.throttled_parts = times;
    }

    /// Reject the next `times` part uploads outright.
    pub fn reject_parts(&self, times: u32) {
        self.lock().faults.rejected_parts = times;
    }

    /// Reject the next `times` completions of uploads named `name`.
    pub fn reject_completion(&self, name: impl Into<String>, times: u32) {
        self.lock()
            .faults
            .rejected_completions
            .insert(name.into(), times);
    }

    /// Drop every injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }
}

/// Consume one unit of a countdown fault, returning whether it fired.
fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ListPage, SourceError> {
        let mut inner = self.lock();
        inner.stats.lists += 1;
        let broken = inner
            .faults
            .listing_breaks_after
            .is_some_and(|pages| inner.stats.lists > pages);
        if broken || take(&mut inner.faults.list_failures) {
            return Err(SourceError::Transient("listing timed out".into()));
        }

        let page_size = inner.page_size.unwrap_or(1000);
        let mut keys = Vec::new();
        let mut next_token = None;
        let matching = inner
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| continuation_token.is_none_or(|after| key.as_str() > after));
        for (key, object) in matching {
            if keys.len() == page_size {
                next_token = keys.last().map(|k: &ObjectKey| k.name.clone());
                break;
            }
            keys.push(ObjectKey {
                name: key.clone(),
                size: object.data.len() as u64,
                checksum: Some(object.etag.clone()),
                last_modified: object.last_modified,
            });
        }
        Ok(ListPage { keys, next_token })
    }

    async fn get(&self, key: &str) -> Result<Bytes, SourceError> {
        let mut inner = self.lock();
        inner.stats.gets += 1;
        match inner.faults.permanent.get(key) {
            Some(SourceFault::NotFound) => return Err(SourceError::NotFound(key.to_string())),
            Some(SourceFault::AccessDenied) => {
                return Err(SourceError::AccessDenied(key.to_string()));
            }
            None => {}
        }
        if let Some(remaining) = inner.faults.throttled.get_mut(key) {
            if take(remaining) {
                return Err(SourceError::Throttled(key.to_string()));
            }
        }
        inner
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| SourceError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn start_multipart(&self, name: &str) -> Result<String, DestinationError> {
        let mut inner = self.lock();
        inner.stats.uploads_started += 1;
        let upload_id = Uuid::new_v4().to_string();
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                name: name.to_string(),
                parts: BTreeMap::new(),
            },
        );
        let open = inner.uploads.len() as u64;
        inner.stats.peak_open_uploads = inner.stats.peak_open_uploads.max(open);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, DestinationError> {
        let delay = self.lock().part_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        if take(&mut inner.faults.throttled_parts) {
            return Err(DestinationError::Throttled(format!("part {part_number}")));
        }
        if take(&mut inner.faults.rejected_parts) {
            return Err(DestinationError::Rejected(format!("part {part_number}")));
        }
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| DestinationError::NoSuchUpload(upload_id.to_string()))?;
        let etag = format!("{:x}", md5::compute(&data));
        upload.parts.insert(part_number, (etag.clone(), data));
        inner.stats.parts_uploaded += 1;
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), DestinationError> {
        let mut inner = self.lock();
        let name = inner
            .uploads
            .get(upload_id)
            .map(|u| u.name.clone())
            .ok_or_else(|| DestinationError::NoSuchUpload(upload_id.to_string()))?;
        if let Some(remaining) = inner.faults.rejected_completions.get_mut(&name) {
            if take(remaining) {
                return Err(DestinationError::Rejected(format!("completion of {name}")));
            }
        }

        let Some(upload) = inner.uploads.remove(upload_id) else {
            return Err(DestinationError::NoSuchUpload(upload_id.to_string()));
        };
        let matches = parts.len() == upload.parts.len()
            && parts
                .iter()
                .zip(&upload.parts)
                .all(|(given, (number, (etag, _)))| {
                    given.part_number == *number && given.etag == *etag
                });
        if !matches {
            inner.uploads.insert(upload_id.to_string(), upload);
            return Err(DestinationError::Rejected("part list mismatch".into()));
        }

        let mut data = BytesMut::new();
        for (_, part) in upload.parts.values() {
            data.extend_from_slice(part);
        }
        let data = data.freeze();
        let object = StoredObject {
            etag: format!("{:x}", md5::compute(&data)),
            data,
            last_modified: Utc::now(),
        };
        inner.objects.insert(upload.name, object);
        inner.stats.uploads_completed += 1;
        Ok(())
    }

    async fn abort_multipart(&self, upload_id: &str) -> Result<(), DestinationError> {
        let mut inner = self.lock();
        inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| DestinationError::NoSuchUpload(upload_id.to_string()))?;
        inner.stats.uploads_aborted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_pages_in_key_order() {
        let store = MemoryStore::new().with_page_size(2);
        for key in ["b", "a", "c", "other/x"] {
            store.put(key, Bytes::from_static(b"x"));
        }

        let first = store.list("", None).await.unwrap();
        let names: Vec<_> = first.keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);

        let second = store.list("", first.next_token.as_deref()).await.unwrap();
        let names: Vec<_> = second.keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["c", "other/x"]);
        assert!(second.next_token.is_none());

        let scoped = store.list("other/", None).await.unwrap();
        assert_eq!(scoped.keys.len(), 1);
    }

    #[tokio::test]
    async fn multipart_upload_assembles_parts_in_order() {
        let store = MemoryStore::new();
        let id = store.start_multipart("vol-0").await.unwrap();
        let second = store
            .upload_part(&id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let first = store
            .upload_part(&id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let parts = [
            CompletedPart {
                part_number: 1,
                etag: first,
            },
            CompletedPart {
                part_number: 2,
                etag: second,
            },
        ];
        store.complete_multipart(&id, &parts).await.unwrap();
        assert_eq!(store.object("vol-0").unwrap(), "hello world");
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn throttling_wears_off() {
        let store = MemoryStore::new();
        store.put("k", Bytes::from_static(b"v"));
        store.throttle("k", 2);
        assert!(store.get("k").await.unwrap_err().is_transient());
        assert!(store.get("k").await.unwrap_err().is_transient());
        assert_eq!(store.get("k").await.unwrap(), "v");
        assert_eq!(store.stats().gets, 3);
    }

    #[tokio::test]
    async fn broken_listing_serves_leading_pages() {
        let store = MemoryStore::new().with_page_size(1);
        for key in ["a", "b", "c"] {
            store.put(key, Bytes::from_static(b"x"));
        }
        store.fail_listing_after(1);
        let first = store.list("", None).await.unwrap();
        assert_eq!(first.keys[0].name, "a");
        let err = store.list("", first.next_token.as_deref()).await.unwrap_err();
        assert!(err.is_transient());

        store.clear_faults();
        assert!(store.list("", first.next_token.as_deref()).await.is_ok());
    }

    #[tokio::test]
    async fn peak_counts_concurrent_uploads() {
        let store = MemoryStore::new();
        let first = store.start_multipart("vol-0").await.unwrap();
        store.abort_multipart(&first).await.unwrap();
        let _second = store.start_multipart("vol-1").await.unwrap();
        assert_eq!(store.stats().peak_open_uploads, 1);
        let _third = store.start_multipart("vol-2").await.unwrap();
        assert_eq!(store.stats().peak_open_uploads, 2);
    }
}
