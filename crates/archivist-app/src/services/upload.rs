use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use futures_util::TryStreamExt;
use tokio::time::sleep;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use archivist_server::Archive;

use crate::services::object_store::{
    ByteStream, ObjectStore, ObjectStoreError, PutResult, namespaced_key,
};
use crate::services::retry::RetryPolicy;

/// Object key of a sealed archive (`<prefix>/<id>.tar.gz`).
pub fn archive_object_key(archive_prefix: &str, archive: &Archive) -> String {
    namespaced_key(archive_prefix, &archive.file_name())
}

/// Stream the sealed file at `path` into the object store. Each retry reopens
/// the file so a partial attempt never leaks into the next one.
pub async fn upload_sealed(
    objects: Arc<dyn ObjectStore>,
    archive_prefix: &str,
    archive: &Archive,
    path: &Path,
    retry: RetryPolicy,
) -> Result<PutResult, ObjectStoreError> {
    let key = archive_object_key(archive_prefix, archive);
    let attempt = {
        let objects = objects.clone();
        let key = key.clone();
        let path: PathBuf = path.to_path_buf();
        move || {
            let objects = objects.clone();
            let key = key.clone();
            let path = path.clone();
            async move {
                let file = tokio::fs::File::open(&path).await?;
                let body: ByteStream = Box::pin(ReaderStream::new(file).map_err(ObjectStoreError::from));
                objects.put(&key, body).await
            }
        }
    };

    let stored = attempt
        .retry(retry.backoff())
        .sleep(sleep)
        .when(ObjectStoreError::is_transient)
        .notify(|err: &ObjectStoreError, delay: Duration| {
            warn!(
                stage = "upload",
                archive_id = %archive.id,
                delay_ms = delay.as_millis(),
                error = %err,
                "retrying archive upload"
            );
        })
        .await?;

    info!(
        archive_id = %archive.id,
        object_id = %stored.object_id,
        size_bytes = stored.size_bytes,
        "archive uploaded"
    );
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::FsObjectStore;
    use archivist_server::ArchiveType;
    use tempfile::TempDir;

    #[tokio::test]
    async fn uploads_under_archive_prefix() {
        let tmp = TempDir::new().unwrap();
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::builder().root(tmp.path().join("objects")).build());
        let sealed = tmp.path().join("sealed.tar.gz");
        tokio::fs::write(&sealed, b"sealed-bytes").await.unwrap();
        let archive = Archive::building(ArchiveType::All, "hash", 0);

        let stored = upload_sealed(objects.clone(), "archives", &archive, &sealed, RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(stored.object_id, format!("archives/{}.tar.gz", archive.id));
        assert_eq!(stored.size_bytes, 12);
        let meta = objects.head(&stored.object_id).await.unwrap().unwrap();
        assert_eq!(meta.size_bytes, Some(12));
    }

    #[tokio::test]
    async fn missing_sealed_file_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::builder().root(tmp.path().to_path_buf()).build());
        let archive = Archive::building(ArchiveType::All, "hash", 0);
        let err = upload_sealed(
            objects,
            "archives",
            &archive,
            &tmp.path().join("absent.tar.gz"),
            RetryPolicy::none(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ObjectStoreError::Io(_)));
    }
}
