use std::io;
use std::sync::Arc;
use std::time::Duration;

use archivist_server::{
    Archive, ArchiveApi, ArchiveFile, ArchiveStatus, ArchiveType, CatalogError, HealthReport,
    ListParams, Page, SetQuerySubmission,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use tracing::{error, warn};
use uuid::Uuid;

use crate::services::archives::{ArchiveStore, StoreError};
use crate::services::coordinator::CoordinatorHandle;
use crate::services::dispatcher::{DispatchError, SetQueryHandle};
use crate::services::object_store::{ObjectStore, ObjectStoreError};
use crate::services::requests::RequestError;
use crate::services::resolver::ResolveError;

/// Read side of the archive table plus the entry points that start builds.
#[derive(bon::Builder)]
pub struct CatalogService {
    store: Arc<dyn ArchiveStore>,
    objects: Arc<dyn ObjectStore>,
    coordinator: Option<CoordinatorHandle>,
    set_queries: Option<SetQueryHandle>,
    #[builder(default = Duration::from_secs(3_600))]
    max_building: Duration,
}

fn store_failure(err: StoreError) -> CatalogError {
    error!(error = %err, "archive store request failed");
    CatalogError::internal("archive store unavailable")
}

impl CatalogService {
    async fn open(&self, archive: Archive) -> Result<ArchiveFile, CatalogError> {
        let Some(object_id) = archive.object_id.clone() else {
            error!(archive_id = %archive.id, "complete archive has no object id");
            return Err(CatalogError::internal("archive has no stored object"));
        };
        let size_bytes = match self.objects.head(&object_id).await {
            Ok(Some(meta)) => meta.size_bytes,
            Ok(None) => {
                warn!(archive_id = %archive.id, object_id = %object_id, "archive object missing");
                return Err(CatalogError::unavailable("archive file is missing from storage"));
            }
            Err(err) => return Err(object_failure(&archive, err)),
        };
        let stream = self
            .objects
            .get(&object_id)
            .await
            .map_err(|err| object_failure(&archive, err))?
            .map_err(io::Error::other);

        if let Err(err) = self.store.record_download(archive.id).await {
            warn!(archive_id = %archive.id, error = %err, "failed to count download");
        }
        Ok(ArchiveFile {
            archive,
            size_bytes,
            stream: Box::pin(stream),
        })
    }
}

fn object_failure(archive: &Archive, err: ObjectStoreError) -> CatalogError {
    match err {
        ObjectStoreError::NotFound { .. } => {
            CatalogError::unavailable("archive file is missing from storage")
        }
        other => {
            error!(archive_id = %archive.id, error = %other, "archive object read failed");
            CatalogError::internal("archive storage unavailable")
        }
    }
}

fn dispatch_failure(set_id: &str, err: DispatchError) -> CatalogError {
    match err {
        DispatchError::Request(RequestError::SetNotFound { .. }) => {
            CatalogError::not_found("set", format!("saved set `{set_id}` not found"))
        }
        DispatchError::Request(RequestError::Resolve(ResolveError::AlreadyBuilding { .. })) => {
            CatalogError::conflict(format!("an archive for set `{set_id}` is already building"))
        }
        DispatchError::Request(RequestError::Index(err)) => {
            warn!(set_id, error = %err, "set-query preparation hit the index");
            CatalogError::unavailable("document index unavailable")
        }
        DispatchError::Closed => CatalogError::unavailable("set-query builds are shutting down"),
        other => {
            error!(set_id, error = %other, "set-query submission failed");
            CatalogError::internal("set-query submission failed")
        }
    }
}

#[async_trait]
impl ArchiveApi for CatalogService {
    async fn list(&self, params: ListParams) -> Result<Page<Archive>, CatalogError> {
        self.store.list(&params).await.map_err(store_failure)
    }

    async fn get(&self, archive_type: ArchiveType, id: Uuid) -> Result<Archive, CatalogError> {
        match self.store.get(id).await.map_err(store_failure)? {
            Some(archive) if archive.archive_type == archive_type => Ok(archive),
            _ => Err(CatalogError::not_found(
                "archive",
                format!("archive {id} not found"),
            )),
        }
    }

    async fn latest_download(&self) -> Result<ArchiveFile, CatalogError> {
        let archive = self
            .store
            .latest_complete(ArchiveType::All)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| CatalogError::unavailable("no complete archive has been built yet"))?;
        self.open(archive).await
    }

    async fn download(&self, id: Uuid) -> Result<ArchiveFile, CatalogError> {
        let archive = self
            .store
            .get(id)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| CatalogError::not_found("archive", format!("archive {id} not found")))?;
        if archive.status != ArchiveStatus::Complete {
            return Err(CatalogError::unavailable(format!(
                "archive {id} is {}",
                archive.status
            )));
        }
        self.open(archive).await
    }

    async fn request_set_query(&self, set_id: &str) -> Result<SetQuerySubmission, CatalogError> {
        let handle = self
            .set_queries
            .as_ref()
            .ok_or_else(|| CatalogError::unavailable("set-query builds are disabled"))?;
        handle
            .submit(set_id)
            .await
            .map_err(|err| dispatch_failure(set_id, err))
    }

    async fn trigger_build(&self) -> Result<(), CatalogError> {
        let coordinator = self
            .coordinator
            .as_ref()
            .ok_or_else(|| CatalogError::unavailable("all-corpus builds are disabled"))?;
        coordinator
            .trigger(Utc::now())
            .await
            .map_err(|_| CatalogError::unavailable("build coordinator is not running"))
    }

    async fn health(&self) -> HealthReport {
        let Some(coordinator) = &self.coordinator else {
            return HealthReport::ok();
        };
        match coordinator.status().await {
            Ok(status) => match status.overdue(Utc::now(), self.max_building) {
                Some(over) => HealthReport::degraded(format!(
                    "all-corpus build {} for {}s past the {}s limit",
                    status.phase,
                    over.as_secs(),
                    self.max_building.as_secs()
                )),
                None => HealthReport::ok(),
            },
            Err(_) => HealthReport::degraded("build coordinator is not running"),
        }
    }
}
