use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::Stream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::paths::{PathError, object_path};

/// Boxed asynchronous byte stream returned/accepted by the object store.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ObjectStoreError>> + Send>>;

/// Metadata returned by `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: Option<u64>,
}

/// Result of a completed `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// Identifier under which the object can be fetched again.
    pub object_id: String,
    pub size_bytes: u64,
    /// BLAKE3 hex digest of the stored bytes.
    pub checksum: String,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{key}` not found")]
    NotFound { key: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("object store responded {status} for `{key}`")]
    Status { status: StatusCode, key: String },

    #[error("object store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("stream error: {0}")]
    Stream(String),
}

impl ObjectStoreError {
    /// Failures worth retrying: local I/O, transport and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ObjectStoreError::Io(_) | ObjectStoreError::Stream(_) => true,
            ObjectStoreError::Transport(err) => !err.is_builder() && !err.is_decode(),
            ObjectStoreError::Status { status, .. } => status.is_server_error(),
            ObjectStoreError::NotFound { .. } | ObjectStoreError::InvalidKey(_) => false,
        }
    }
}

impl From<std::io::Error> for ObjectStoreError {
    fn from(e: std::io::Error) -> Self {
        ObjectStoreError::Io(e.to_string())
    }
}

impl From<PathError> for ObjectStoreError {
    fn from(e: PathError) -> Self {
        match e {
            PathError::InvalidObjectKey { key } => ObjectStoreError::InvalidKey(key),
            other => ObjectStoreError::Io(other.to_string()),
        }
    }
}

/// Join a namespace prefix and a key with a single `/`.
pub fn namespaced_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_start_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Trait abstracting over object storage backends.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream the object stored under `key` or `ObjectStoreError::NotFound`.
    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError>;

    /// Store `data` under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: ByteStream) -> Result<PutResult, ObjectStoreError>;

    /// Metadata for `key` if present.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError>;
}

/// Durability policy for filesystem writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurableWrite {
    /// No explicit fsync.
    None,
    /// Fsync the file only.
    FileOnly,
    /// Fsync file and parent directory.
    FileAndDir,
}

/// Filesystem object store rooted at a directory.
///
/// Writes stream into a temp file beside the root and are renamed into place
/// once complete, so readers never observe a partial object.
#[derive(Debug, Clone, bon::Builder)]
pub struct FsObjectStore {
    root: PathBuf,
    #[builder(default = 65536)]
    chunk_size_bytes: usize,
    #[builder(default = DurableWrite::None)]
    durability: DurableWrite,
}

impl FsObjectStore {
    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        Ok(object_path(&self.root, key)?)
    }

    async fn fsync_dir(&self, dir_path: &Path) {
        match fs::File::open(dir_path).await {
            Ok(dir_file) => {
                if let Err(e) = dir_file.sync_all().await {
                    tracing::warn!(error = %e, "directory fsync unsupported or failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open directory for fsync");
            }
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let path = self.path_for(key)?;
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::NotFound {
                    key: key.to_string(),
                }
            } else {
                ObjectStoreError::Io(format!("open object: {e}"))
            }
        })?;

        let chunk_size = self.chunk_size_bytes;
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| ObjectStoreError::Io(format!("read: {e}")))?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    async fn put(&self, key: &str, mut data: ByteStream) -> Result<PutResult, ObjectStoreError> {
        let final_path = self.path_for(key)?;
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| ObjectStoreError::Io(format!("create object dir: {e}")))?;

        let temp_file = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| ObjectStoreError::Io(format!("create temp file: {e}")))?;
        let mut file = fs::File::from_std(
            temp_file
                .reopen()
                .map_err(|e| ObjectStoreError::Io(format!("reopen temp file: {e}")))?,
        );

        let mut hasher = blake3::Hasher::new();
        let mut total_bytes: u64 = 0;

        while let Some(chunk_res) = data.next().await {
            let chunk = chunk_res?;
            total_bytes = total_bytes
                .checked_add(chunk.len() as u64)
                .ok_or_else(|| ObjectStoreError::Io("size overflow".to_string()))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| ObjectStoreError::Io(format!("write chunk: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| ObjectStoreError::Io(format!("flush: {e}")))?;

        if self.durability != DurableWrite::None {
            file.sync_all()
                .await
                .map_err(|e| ObjectStoreError::Io(format!("fsync file: {e}")))?;
        }
        drop(file);

        // The temp file unlinks itself if persisting fails.
        temp_file
            .persist(&final_path)
            .map_err(|e| ObjectStoreError::Io(format!("persist object: {}", e.error)))?;

        if self.durability == DurableWrite::FileAndDir {
            self.fsync_dir(&parent).await;
        }

        Ok(PutResult {
            object_id: key.to_string(),
            size_bytes: total_bytes,
            checksum: hasher.finalize().to_hex().to_string(),
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size_bytes: Some(meta.len()),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ObjectStoreError::Io(format!("stat object: {e}"))),
        }
    }
}

/// Object store speaking plain GET/PUT/HEAD against a base URL.
#[derive(Debug, Clone, bon::Builder)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpObjectStore {
    fn url_for(&self, key: &str) -> Result<Url, ObjectStoreError> {
        // Validates the key shape without touching the filesystem.
        object_path(Path::new("/"), key)?;
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(key.trim_start_matches('/'))
            .map_err(|e| ObjectStoreError::InvalidKey(format!("{key}: {e}")))
    }

    fn check_status(status: StatusCode, key: &str) -> Result<(), ObjectStoreError> {
        if status == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound {
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ObjectStoreError::Status {
                status,
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let url = self.url_for(key)?;
        let response = self.client.get(url).send().await?;
        Self::check_status(response.status(), key)?;
        let stream = response.bytes_stream().map_err(ObjectStoreError::from);
        Ok(Box::pin(stream))
    }

    async fn put(&self, key: &str, data: ByteStream) -> Result<PutResult, ObjectStoreError> {
        let url = self.url_for(key)?;
        let hasher = std::sync::Arc::new(std::sync::Mutex::new((blake3::Hasher::new(), 0u64)));
        let tally = hasher.clone();
        let counted = data.inspect_ok(move |chunk| {
            if let Ok(mut guard) = tally.lock() {
                guard.0.update(chunk);
                guard.1 += chunk.len() as u64;
            }
        });
        let response = self
            .client
            .put(url)
            .body(reqwest::Body::wrap_stream(counted))
            .send()
            .await?;
        Self::check_status(response.status(), key)?;

        let (checksum, size_bytes) = match hasher.lock() {
            Ok(guard) => (guard.0.finalize().to_hex().to_string(), guard.1),
            Err(_) => return Err(ObjectStoreError::Stream("checksum state poisoned".to_string())),
        };
        Ok(PutResult {
            object_id: key.to_string(),
            size_bytes,
            checksum,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        let url = self.url_for(key)?;
        let response = self.client.head(url).send().await?;
        match Self::check_status(response.status(), key) {
            Ok(()) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size_bytes: response.content_length(),
            })),
            Err(ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }
}
