//! src/services/storage_service.rs
//!
//! StorageService — S3-like bucket store backed by SQLite for metadata and
//! local disk for object payloads, sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`. Multipart parts are staged
//! under `base_path/.multipart/{upload_id}/` until completion.
//!
//! [`LocalBucket`] binds the service to one bucket and implements both
//! [`SourceStore`] and [`DestinationStore`], so the archiver can read from
//! and write to local buckets.

use crate::{
    models::{
        archive::ObjectKey,
        bucket::Bucket,
        multipart::{MultipartPart, MultipartUpload},
        object::Object,
    },
    services::store::{
        CompletedPart, DestinationError, DestinationStore, ListPage, SourceError, SourceStore,
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListObjectsResult {
    pub objects: Vec<Object>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("multipart upload `{0}` not found")]
    UploadNotFound(String),
    #[error("invalid part list for upload `{upload_id}`: {reason}")]
    InvalidPart { upload_id: String, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// StorageService provides basic S3-like operations:
/// - Upload an object (writes bytes to disk and inserts metadata into SQLite)
/// - Multipart uploads (parts staged on disk, concatenated on completion)
/// - Get object (reads metadata from SQLite and payload from disk)
/// - List objects (query SQLite)
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

const TRACING_TARGET: &str = "cold_archiver::storage";

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects empty or overlong keys, keys that begin with `/` or contain
    /// `..`, and keys with control characters or backslashes.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    ///
    /// Ensures predictable directory structure and prevents invalid inputs.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let trimmed = name.trim();
        if trimmed != name {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "cannot begin or end with whitespace".into(),
            });
        }

        let len = name.len();
        if len < BUCKET_NAME_MIN_LEN || len > BUCKET_NAME_MAX_LEN {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "must be between 3 and 63 characters".into(),
            });
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "allowed characters are lowercase letters, digits, dots, and hyphens"
                    .into(),
            });
        }

        if name.starts_with('.')
            || name.ends_with('.')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "must start and end with a lowercase letter or digit".into(),
            });
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "cannot contain consecutive dots or dot-hyphen combinations".into(),
            });
        }

        if is_ipv4_like(name) {
            return Err(StorageError::InvalidBucketName {
                name: name.to_string(),
                reason: "must not be formatted like an IP address".into(),
            });
        }

        Ok(())
    }

    /// Compute the physical base folder path for a bucket.
    ///
    /// This does not check for existence. Used for building object paths.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket_name);
        path
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    ///
    /// Combines base_path/bucket/{shard}/{shard}/{key}.
    /// Parent directories may not exist yet.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Fetch bucket metadata from SQLite.
    ///
    /// Returns BucketNotFound if missing.
    /// Validates bucket name before querying.
    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<sqlx::sqlite::Sqlite, Bucket>(
            "SELECT id, name, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch an object's metadata record by key and bucket_id.
    ///
    /// Returns ObjectNotFound if the record is missing.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, content_type, size_bytes, etag, last_modified
             FROM objects
             WHERE key = ? AND bucket_id = ?",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Stream-upload an object to disk and update metadata.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Atomically renames into final location.
    /// - Upserts metadata row (S3-like overwrite semantics).
    ///
    /// Ensures durable writes (fsync) and cleans up temp files on errors.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        let last_modified = Utc::now();
        let etag = format!("{:x}", digest.compute());

        let insert_result = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, size_bytes, etag, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, bucket_id, key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(bucket_rec.id)
        .bind(key)
        .bind(content_type)
        .bind(size_bytes)
        .bind(&etag)
        .bind(last_modified)
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(obj) => Ok(obj),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    /// Returns ObjectNotFound if metadata exists but physical file is missing.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    /// List objects following S3 ListObjectsV2 rules.
    ///
    /// Keys come back in byte order, filtered by prefix. The continuation
    /// token is the last key returned.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> StorageResult<ListObjectsResult> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let max_keys = params.max_keys.clamp(1, 1000);
        let fetch_limit = max_keys + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, bucket_id, key, content_type, size_bytes, etag, last_modified \
             FROM objects WHERE bucket_id = ",
        );
        builder.push_bind(bucket_rec.id);

        // LIKE is case-insensitive in SQLite; compare the raw prefix instead.
        if let Some(prefix) = &params.prefix {
            builder.push(" AND substr(key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix.clone());
        }

        if let Some(token) = &params.continuation_token {
            builder.push(" AND key > ");
            builder.push_bind(token);
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<Object> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut is_truncated = false;
        let mut next_continuation_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_continuation_token = rows.last().map(|last| last.key.clone());
            is_truncated = true;
        }

        Ok(ListObjectsResult {
            objects: rows,
            is_truncated,
            next_continuation_token,
        })
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Validates the name and inserts the metadata row. Returns
    /// BucketAlreadyExists if name conflict occurs.
    ///
    /// Creates the bucket folder on disk.
    pub async fn create_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let bucket_root = self.bucket_root(name);
        fs::create_dir_all(&bucket_root).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => {
                debug!(target: TRACING_TARGET, bucket = %bucket.name, "bucket created");
                Ok(bucket)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Create a bucket unless one with that name already exists.
    pub async fn ensure_bucket(&self, name: &str) -> StorageResult<Bucket> {
        match self.fetch_bucket(name).await {
            Ok(bucket) => Ok(bucket),
            Err(StorageError::BucketNotFound(_)) => {
                match self.create_bucket(name).await {
                    Ok(bucket) => Ok(bucket),
                    Err(StorageError::BucketAlreadyExists(_)) => self.fetch_bucket(name).await,
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Read a whole object into memory.
    pub async fn get_object_bytes(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        let (meta, mut file) = self.get_object_reader(bucket, key).await?;
        let mut buf = Vec::with_capacity(meta.size_bytes.max(0) as usize);
        file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Directory holding the staged parts of a multipart upload.
    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(".multipart");
        path.push(upload_id);
        path
    }

    /// Fetch an in-progress multipart upload session.
    ///
    /// Upload ids are UUIDs issued by this service; anything else is rejected
    /// before it can reach the filesystem.
    async fn fetch_upload(&self, upload_id: &str) -> StorageResult<MultipartUpload> {
        if Uuid::parse_str(upload_id).is_err() {
            return Err(StorageError::UploadNotFound(upload_id.to_string()));
        }
        sqlx::query_as::<_, MultipartUpload>(
            "SELECT id, bucket_id, key, upload_id, initiated_at, completed
             FROM multipart_uploads WHERE upload_id = ? AND completed = 0",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::UploadNotFound(upload_id.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Start a multipart upload session for `bucket/key`.
    pub async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<MultipartUpload> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let upload = MultipartUpload {
            id: Uuid::new_v4(),
            bucket_id: bucket_rec.id,
            key: key.to_string(),
            upload_id: Uuid::new_v4().to_string(),
            initiated_at: Utc::now(),
            completed: false,
        };
        fs::create_dir_all(self.upload_dir(&upload.upload_id)).await?;

        sqlx::query(
            "INSERT INTO multipart_uploads (id, bucket_id, key, upload_id, initiated_at, completed)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(upload.id)
        .bind(upload.bucket_id)
        .bind(&upload.key)
        .bind(&upload.upload_id)
        .bind(upload.initiated_at)
        .bind(upload.completed)
        .execute(&*self.db)
        .await?;

        debug!(
            target: TRACING_TARGET,
            upload_id = %upload.upload_id,
            bucket,
            key,
            "multipart upload started"
        );
        Ok(upload)
    }

    /// Stage one part on disk and record it. Re-uploading a part number
    /// replaces the earlier part.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<MultipartPart> {
        if !(1..=10_000).contains(&part_number) {
            return Err(StorageError::InvalidPart {
                upload_id: upload_id.to_string(),
                reason: format!("part number {} out of range", part_number),
            });
        }
        let upload = self.fetch_upload(upload_id).await?;

        let dir = self.upload_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let part_path = dir.join(format!("{:05}", part_number));
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let mut file = File::create(&tmp_path).await?;
        let written = async {
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        fs::rename(&tmp_path, &part_path).await?;

        let part = MultipartPart {
            id: Uuid::new_v4(),
            upload_id: upload.id,
            part_number,
            size_bytes: data.len() as i64,
            etag: format!("{:x}", md5::compute(&data)),
            uploaded_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO multipart_parts (id, upload_id, part_number, size_bytes, etag, uploaded_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                uploaded_at = excluded.uploaded_at",
        )
        .bind(part.id)
        .bind(part.upload_id)
        .bind(part.part_number)
        .bind(part.size_bytes)
        .bind(&part.etag)
        .bind(part.uploaded_at)
        .execute(&*self.db)
        .await?;

        Ok(part)
    }

    /// Concatenate the listed parts into the final object.
    ///
    /// `parts` must name every staged part, in ascending order, with the
    /// ETags returned by [`upload_part`](Self::upload_part). The object is
    /// written through [`upload_object_stream`](Self::upload_object_stream),
    /// so an existing object with the same key is replaced atomically.
    pub async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> StorageResult<Object> {
        let upload = self.fetch_upload(upload_id).await?;
        let stored = sqlx::query_as::<_, MultipartPart>(
            "SELECT id, upload_id, part_number, size_bytes, etag, uploaded_at
             FROM multipart_parts WHERE upload_id = ? ORDER BY part_number ASC",
        )
        .bind(upload.id)
        .fetch_all(&*self.db)
        .await?;

        let invalid = |reason: String| StorageError::InvalidPart {
            upload_id: upload_id.to_string(),
            reason,
        };
        if parts.is_empty() {
            return Err(invalid("no parts given".into()));
        }
        if parts.len() != stored.len() {
            return Err(invalid(format!(
                "{} parts given, {} uploaded",
                parts.len(),
                stored.len()
            )));
        }
        for ((number, etag), part) in parts.iter().zip(&stored) {
            if *number != part.part_number || *etag != part.etag {
                return Err(invalid(format!("part {} does not match", number)));
            }
        }

        let bucket_name: String = sqlx::query_scalar("SELECT name FROM buckets WHERE id = ?")
            .bind(upload.bucket_id)
            .fetch_one(&*self.db)
            .await?;

        let dir = self.upload_dir(upload_id);
        let paths: Vec<PathBuf> = stored
            .iter()
            .map(|part| dir.join(format!("{:05}", part.part_number)))
            .collect();
        let stream = futures::stream::iter(paths)
            .then(|path| async move { fs::read(&path).await.map(Bytes::from) });

        let object = self
            .upload_object_stream(
                &bucket_name,
                &upload.key,
                Some("application/octet-stream".into()),
                stream,
            )
            .await?;

        sqlx::query("UPDATE multipart_uploads SET completed = 1 WHERE id = ?")
            .bind(upload.id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload.id)
            .execute(&*self.db)
            .await?;
        self.remove_upload_dir(&dir).await;

        debug!(
            target: TRACING_TARGET,
            upload_id,
            bucket = %bucket_name,
            key = %upload.key,
            parts = stored.len(),
            "multipart upload completed"
        );
        Ok(object)
    }

    /// Drop an in-progress upload and its staged parts.
    pub async fn abort_multipart_upload(&self, upload_id: &str) -> StorageResult<()> {
        let upload = self.fetch_upload(upload_id).await?;
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload.id)
            .execute(&*self.db)
            .await?;
        sqlx::query("DELETE FROM multipart_uploads WHERE id = ?")
            .bind(upload.id)
            .execute(&*self.db)
            .await?;
        self.remove_upload_dir(&self.upload_dir(upload_id)).await;
        debug!(target: TRACING_TARGET, upload_id, "multipart upload aborted");
        Ok(())
    }

    async fn remove_upload_dir(&self, dir: &Path) {
        if let Err(err) = fs::remove_dir_all(dir).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    target: TRACING_TARGET,
                    dir = %dir.display(),
                    error = %err,
                    "failed to remove upload dir"
                );
            }
        }
    }

    /// Bind this service to one bucket.
    pub fn bucket(&self, name: impl Into<String>) -> LocalBucket {
        LocalBucket {
            service: self.clone(),
            bucket: name.into(),
            page_size: 1000,
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    for segment in parts {
        if segment.is_empty() || segment.len() > 3 {
            return false;
        }
        if segment.chars().any(|c| !c.is_ascii_digit()) {
            return false;
        }
        if segment.parse::<u8>().is_err() {
            return false;
        }
    }
    true
}

/// A [`StorageService`] bound to a single bucket.
#[derive(Clone)]
pub struct LocalBucket {
    service: StorageService,
    bucket: String,
    page_size: usize,
}

impl LocalBucket {
    /// Keys returned per listing page (clamped to 1..=1000).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, 1000);
        self
    }
}

impl From<StorageError> for SourceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound { key, .. } => SourceError::NotFound(key),
            StorageError::Sqlx(err) => SourceError::Transient(err.to_string()),
            StorageError::Io(err) => SourceError::Transient(err.to_string()),
            other => SourceError::AccessDenied(other.to_string()),
        }
    }
}

impl From<StorageError> for DestinationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UploadNotFound(id) => DestinationError::NoSuchUpload(id),
            StorageError::Sqlx(err) => DestinationError::Transient(err.to_string()),
            StorageError::Io(err) => DestinationError::Transient(err.to_string()),
            other => DestinationError::Rejected(other.to_string()),
        }
    }
}

#[async_trait]
impl SourceStore for LocalBucket {
    async fn list(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ListPage, SourceError> {
        let params = ListObjectsParams {
            prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
            continuation_token: continuation_token.map(decode_continuation_token),
            max_keys: self.page_size,
        };
        let result = self.service.list_objects_v2(&self.bucket, params).await?;
        Ok(ListPage {
            keys: result.objects.iter().map(ObjectKey::from).collect(),
            next_token: result
                .next_continuation_token
                .as_deref()
                .map(encode_continuation_token),
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes, SourceError> {
        Ok(self.service.get_object_bytes(&self.bucket, key).await?)
    }
}

#[async_trait]
impl DestinationStore for LocalBucket {
    async fn start_multipart(&self, name: &str) -> Result<String, DestinationError> {
        let upload = self
            .service
            .create_multipart_upload(&self.bucket, name)
            .await?;
        Ok(upload.upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, DestinationError> {
        let number = i32::try_from(part_number)
            .map_err(|_| DestinationError::Rejected(format!("part number {part_number}")))?;
        let part = self.service.upload_part(upload_id, number, data).await?;
        Ok(part.etag)
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), DestinationError> {
        let parts = parts
            .iter()
            .map(|p| (p.part_number as i32, p.etag.clone()))
            .collect::<Vec<_>>();
        self.service
            .complete_multipart_upload(upload_id, &parts)
            .await?;
        Ok(())
    }

    async fn abort_multipart(&self, upload_id: &str) -> Result<(), DestinationError> {
        Ok(self.service.abort_multipart_upload(upload_id).await?)
    }
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> StorageService {
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let pool = db::connect(&url, 2).await.unwrap();
        db::run_migrations(&pool, db::OBJECT_STORE_SCHEMA)
            .await
            .unwrap();
        StorageService::new(Arc::new(pool), dir.path().join("objects"))
    }

    async fn put(service: &StorageService, bucket: &str, key: &str, data: &'static [u8]) {
        service
            .upload_object_stream(
                bucket,
                key,
                None,
                futures::stream::once(async move { Ok(Bytes::from_static(data)) }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn listing_pages_cover_every_key_once() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service.ensure_bucket("source").await.unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            put(&service, "source", key, b"x").await;
        }
        put(&service, "source", "B-upper", b"x").await;

        let bucket = service.bucket("source").with_page_size(2);
        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = bucket.list("", token.as_deref()).await.unwrap();
            seen.extend(page.keys.into_iter().map(|k| k.name));
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, ["B-upper", "a", "b", "c", "d", "e"]);

        let scoped = bucket.list("B", None).await.unwrap();
        assert_eq!(scoped.keys.len(), 1);
    }

    #[tokio::test]
    async fn multipart_upload_lands_as_one_object() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service.ensure_bucket("dest").await.unwrap();
        let bucket = service.bucket("dest");

        let id = bucket.start_multipart("vol/archive-000000.vol").await.unwrap();
        let first = bucket
            .upload_part(&id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let second = bucket
            .upload_part(&id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        bucket
            .complete_multipart(
                &id,
                &[
                    CompletedPart {
                        part_number: 1,
                        etag: first,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: second,
                    },
                ],
            )
            .await
            .unwrap();

        let stored = service
            .get_object_bytes("dest", "vol/archive-000000.vol")
            .await
            .unwrap();
        assert_eq!(stored, "hello world");
        assert!(matches!(
            bucket.abort_multipart(&id).await,
            Err(DestinationError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn ensure_bucket_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let first = service.ensure_bucket("archive").await.unwrap();
        let second = service.ensure_bucket("archive").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(service.ensure_bucket("No_Such").await.is_err());
    }
}
