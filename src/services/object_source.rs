//! src/services/object_source.rs
//!
//! ObjectSource: read-only view of the storage namespace. `DiskObjectSource`
//! serves objects laid out as `root/{bucket}/{key}` and fingerprints them with
//! the hex MD5 of their content, the same token a single-part upload gets as
//! its entity tag.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use md5::Context;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::PathBuf,
    sync::{
        RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncReadExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::errors::ProcessError;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object source unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type SourceResult<T> = Result<T, SourceError>;

impl SourceError {
    pub fn into_process(self, operation: &str) -> ProcessError {
        match self {
            SourceError::NotFound { bucket, key } => ProcessError::NotFound { bucket, key },
            SourceError::InvalidObjectKey(_) | SourceError::InvalidBucketName { .. } => {
                ProcessError::Validation(self.to_string())
            }
            SourceError::Unavailable(_) => ProcessError::backend(operation, self, true),
            SourceError::Io(ref err) => {
                let retryable = matches!(
                    err.kind(),
                    ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
                );
                ProcessError::backend(operation, self, retryable)
            }
        }
    }
}

/// Content of one object as reported by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectContent {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Storage backend the index is reconciled against.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Current content fingerprint. Fails with `NotFound` if the object is gone.
    async fn head_fingerprint(&self, bucket: &str, key: &str) -> SourceResult<String>;

    async fn read_content(&self, bucket: &str, key: &str) -> SourceResult<ObjectContent>;

    async fn health_check(&self) -> SourceResult<()>;
}

/// Objects stored as plain files beneath `base_path/{bucket}/{key}`.
#[derive(Clone, Debug)]
pub struct DiskObjectSource {
    pub base_path: PathBuf,
}

impl DiskObjectSource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Rejects keys that are empty, absolute, carry `\\` or control
    /// characters, or have a `.`/`..` path component, so a key can never
    /// address a file outside its bucket. `..` inside a file name is fine.
    fn ensure_key_safe(&self, key: &str) -> SourceResult<()> {
        if key.len() > MAX_OBJECT_KEY_LEN || unsafe_path_reason(key).is_some() {
            return Err(SourceError::InvalidObjectKey(key.to_string()));
        }
        Ok(())
    }

    /// A bucket is one directory under the root, so it must be a single
    /// safe path component.
    fn ensure_bucket_name_safe(&self, name: &str) -> SourceResult<()> {
        let reason = if name.contains('/') {
            Some("must be a single path component")
        } else {
            unsafe_path_reason(name)
        };
        match reason {
            Some(reason) => Err(SourceError::InvalidBucketName {
                name: name.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> SourceResult<PathBuf> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_key_safe(key)?;
        let mut path = self.base_path.clone();
        path.push(bucket);
        path.push(key);
        Ok(path)
    }

    /// Open the object file, mapping a missing file (or a directory) to NotFound.
    async fn open_object(&self, bucket: &str, key: &str) -> SourceResult<(PathBuf, File)> {
        let path = self.object_path(bucket, key)?;
        let not_found = || SourceError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(SourceError::Io(err)),
        };
        if !metadata.is_file() {
            return Err(not_found());
        }

        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                not_found()
            } else {
                SourceError::Io(err)
            }
        })?;
        Ok((path, file))
    }
}

#[async_trait]
impl ObjectSource for DiskObjectSource {
    async fn head_fingerprint(&self, bucket: &str, key: &str) -> SourceResult<String> {
        let (path, file) = self.open_object(bucket, key).await?;

        let mut digest = Context::new();
        let mut stream = ReaderStream::new(file);
        while let Some(chunk) = stream.next().await {
            digest.consume(&chunk?);
        }
        let fingerprint = format!("{:x}", digest.compute());

        debug!("fingerprinted {} => {}", path.display(), fingerprint);
        Ok(fingerprint)
    }

    async fn read_content(&self, bucket: &str, key: &str) -> SourceResult<ObjectContent> {
        let (_path, mut file) = self.open_object(bucket, key).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;

        Ok(ObjectContent {
            bytes: Bytes::from(bytes),
            content_type: content_type_for(key),
        })
    }

    async fn health_check(&self) -> SourceResult<()> {
        let metadata = fs::metadata(&self.base_path).await?;
        if !metadata.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "{} is not a directory",
                self.base_path.display()
            )));
        }
        fs::read_dir(&self.base_path).await?;
        Ok(())
    }
}

/// Why `name` cannot be joined onto a directory, if it cannot.
fn unsafe_path_reason(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("must not be empty");
    }
    if name.starts_with('/') {
        return Some("must not start with `/`");
    }
    if name.chars().any(|c| c == '\\' || c.is_control()) {
        return Some("must not contain `\\` or control characters");
    }
    if name.split('/').any(|part| part == "." || part == "..") {
        return Some("must not contain `.` or `..` path components");
    }
    None
}

/// MIME type guessed from the key's extension, `application/octet-stream`
/// when unknown.
pub fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[derive(Clone, Debug)]
struct MemoryObject {
    bytes: Bytes,
    content_type: String,
}

/// In-process object namespace. Fingerprints are computed the same way as on
/// disk. `set_unavailable(true)` makes every call fail with a retryable error.
#[derive(Default)]
pub struct MemoryObjectSource {
    objects: RwLock<HashMap<(String, String), MemoryObject>>,
    unavailable: AtomicBool,
    head_calls: AtomicUsize,
}

impl MemoryObjectSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, bytes: impl Into<Bytes>, content_type: &str) {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                (bucket.to_string(), key.to_string()),
                MemoryObject {
                    bytes: bytes.into(),
                    content_type: content_type.to_string(),
                },
            );
    }

    pub fn remove(&self, bucket: &str, key: &str) {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(bucket.to_string(), key.to_string()));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of head lookups served so far.
    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, bucket: &str, key: &str) -> SourceResult<MemoryObject> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("source marked unavailable".into()));
        }
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl ObjectSource for MemoryObjectSource {
    async fn head_fingerprint(&self, bucket: &str, key: &str) -> SourceResult<String> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let object = self.lookup(bucket, key)?;
        Ok(format!("{:x}", md5::compute(&object.bytes)))
    }

    async fn read_content(&self, bucket: &str, key: &str) -> SourceResult<ObjectContent> {
        let object = self.lookup(bucket, key)?;
        Ok(ObjectContent {
            bytes: object.bytes,
            content_type: object.content_type,
        })
    }

    async fn health_check(&self) -> SourceResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("source marked unavailable".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn disk_source_with(
        bucket: &str,
        key: &str,
        content: &[u8],
    ) -> (tempfile::TempDir, DiskObjectSource) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(bucket).join(key);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, content).await.unwrap();
        let source = DiskObjectSource::new(dir.path());
        (dir, source)
    }

    #[tokio::test]
    async fn disk_fingerprint_is_content_md5() {
        let (_dir, source) = disk_source_with("media", "a/b/hello.txt", b"hello world").await;
        let fingerprint = source
            .head_fingerprint("media", "a/b/hello.txt")
            .await
            .unwrap();
        assert_eq!(fingerprint, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn disk_missing_object_is_not_found() {
        let (_dir, source) = disk_source_with("media", "dir/present.txt", b"x").await;
        let err = source
            .head_fingerprint("media", "dir/absent.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));

        // a directory is not an object
        let err = source.read_content("media", "dir").await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn disk_read_reports_content_type() {
        let (_dir, source) = disk_source_with("media", "img/logo.PNG", &[137, 80, 78, 71]).await;
        let content = source.read_content("media", "img/logo.PNG").await.unwrap();
        assert_eq!(content.bytes.as_ref(), &[137, 80, 78, 71]);
        assert_eq!(content.content_type, "image/png");
    }

    #[tokio::test]
    async fn disk_rejects_traversal() {
        let (_dir, source) = disk_source_with("media", "ok.txt", b"x").await;
        let keys = [
            "../secret",
            "a/../../secret",
            "./ok.txt",
            "/etc/passwd",
            "a\\b",
            "nul\0",
        ];
        for key in keys {
            assert!(
                matches!(
                    source.read_content("media", key).await,
                    Err(SourceError::InvalidObjectKey(_))
                ),
                "{key:?}"
            );
        }
        for bucket in ["..", ".", "", "media/sub", "/media"] {
            assert!(
                matches!(
                    source.read_content(bucket, "ok.txt").await,
                    Err(SourceError::InvalidBucketName { .. })
                ),
                "{bucket:?}"
            );
        }
    }

    #[tokio::test]
    async fn disk_accepts_short_buckets_and_dots_inside_names() {
        let (dir, source) = disk_source_with("b", "dir/file.txt", b"plain").await;
        let content = source.read_content("b", "dir/file.txt").await.unwrap();
        assert_eq!(content.bytes.as_ref(), b"plain");

        let path = dir.path().join("reports").join("q1..final.csv");
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, b"total,1\n").await.unwrap();
        assert_eq!(
            source
                .head_fingerprint("reports", "q1..final.csv")
                .await
                .unwrap(),
            format!("{:x}", md5::compute(b"total,1\n"))
        );

        let path = dir.path().join("Upper_Case").join("..hidden");
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, b"h").await.unwrap();
        assert!(source.read_content("Upper_Case", "..hidden").await.is_ok());
    }

    #[tokio::test]
    async fn disk_health_requires_existing_root() {
        let (dir, source) = disk_source_with("media", "ok.txt", b"x").await;
        source.health_check().await.unwrap();

        let missing = DiskObjectSource::new(dir.path().join("nope"));
        assert!(missing.health_check().await.is_err());
    }

    #[test]
    fn content_type_falls_back_to_octet_stream() {
        assert_eq!(content_type_for("report.csv"), "text/csv");
        assert_eq!(content_type_for("bundle.zip"), "application/zip");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }

    #[test]
    fn not_found_maps_to_process_not_found() {
        let err = SourceError::NotFound {
            bucket: "b".into(),
            key: "k".into(),
        }
        .into_process("head_fingerprint");
        assert_eq!(
            err,
            ProcessError::NotFound {
                bucket: "b".into(),
                key: "k".into()
            }
        );
        assert!(
            SourceError::Unavailable("down".into())
                .into_process("read_content")
                .is_retryable()
        );
    }

    #[tokio::test]
    async fn memory_source_fingerprint_matches_disk_scheme() {
        let source = MemoryObjectSource::new();
        source.put("media", "hello.txt", "hello world", "text/plain");
        assert_eq!(
            source.head_fingerprint("media", "hello.txt").await.unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(source.head_calls(), 1);

        source.remove("media", "hello.txt");
        assert!(matches!(
            source.head_fingerprint("media", "hello.txt").await,
            Err(SourceError::NotFound { .. })
        ));
    }
}
