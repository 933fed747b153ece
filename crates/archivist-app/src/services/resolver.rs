use std::sync::Arc;
use std::time::Duration;

use archivist_server::{Archive, ArchiveStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::services::archives::{ArchiveStore, InsertOutcome, RowVersion, StoreError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("archive with hash {hash_info} is already building")]
    AlreadyBuilding { hash_info: String },
    #[error("archive with hash {hash_info} conflicted on insert but could not be re-read")]
    Vanished { hash_info: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to a candidate archive row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Inserted(Archive),
    /// A failed, cancelled or stuck row was reset to `BUILDING`.
    Restarted(Archive),
    /// A complete archive already covers this snapshot.
    Existing(Archive),
}

impl Resolution {
    pub fn archive(&self) -> &Archive {
        match self {
            Resolution::Inserted(archive)
            | Resolution::Restarted(archive)
            | Resolution::Existing(archive) => archive,
        }
    }

    pub fn into_archive(self) -> Archive {
        match self {
            Resolution::Inserted(archive)
            | Resolution::Restarted(archive)
            | Resolution::Existing(archive) => archive,
        }
    }

    pub fn needs_build(&self) -> bool {
        !matches!(self, Resolution::Existing(_))
    }
}

/// Saves candidate rows, turning `(type, hash_info)` collisions into reuse,
/// restart or rejection.
#[derive(Clone)]
pub struct ArchiveResolver {
    store: Arc<dyn ArchiveStore>,
    max_building: Duration,
}

impl ArchiveResolver {
    pub fn new(store: Arc<dyn ArchiveStore>, max_building: Duration) -> Self {
        Self {
            store,
            max_building,
        }
    }

    pub async fn save(&self, candidate: Archive) -> Result<Resolution, ResolveError> {
        debug_assert_eq!(candidate.status, ArchiveStatus::Building);
        match self.store.insert(&candidate).await? {
            InsertOutcome::Inserted(archive) => {
                debug!(archive_id = %archive.id, hash_info = %archive.hash_info, "archive inserted");
                Ok(Resolution::Inserted(archive))
            }
            InsertOutcome::Conflict => self.resolve_conflict(candidate).await,
        }
    }

    async fn resolve_conflict(&self, candidate: Archive) -> Result<Resolution, ResolveError> {
        let existing = self
            .store
            .find_by_hash(candidate.archive_type, &candidate.hash_info)
            .await?
            .ok_or_else(|| ResolveError::Vanished {
                hash_info: candidate.hash_info.clone(),
            })?;

        let now = Utc::now();
        match existing.status {
            ArchiveStatus::Complete => {
                debug!(archive_id = %existing.id, "complete archive reused");
                Ok(Resolution::Existing(existing))
            }
            ArchiveStatus::Building if !self.is_stuck(existing.created_at, now) => {
                Err(ResolveError::AlreadyBuilding {
                    hash_info: existing.hash_info,
                })
            }
            previous => {
                let expected = RowVersion::of(&existing);
                let restarted = Archive {
                    status: ArchiveStatus::Building,
                    created_at: now,
                    object_id: None,
                    num_of_samples: candidate.num_of_samples,
                    ..existing
                };
                // Another submit may have restarted the row since it was read.
                if !self.store.update(&restarted, expected).await? {
                    debug!(archive_id = %restarted.id, "restart lost to a concurrent writer");
                    return Err(ResolveError::AlreadyBuilding {
                        hash_info: restarted.hash_info,
                    });
                }
                info!(
                    archive_id = %restarted.id,
                    hash_info = %restarted.hash_info,
                    previous = %previous,
                    "archive restarted"
                );
                Ok(Resolution::Restarted(restarted))
            }
        }
    }

    fn is_stuck(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(created_at);
        age.to_std().is_ok_and(|age| age > self.max_building)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::archives::MemoryArchiveStore;
    use archivist_server::ArchiveType;
    use chrono::Duration as ChronoDuration;

    fn resolver(store: Arc<MemoryArchiveStore>) -> ArchiveResolver {
        ArchiveResolver::new(store, Duration::from_secs(60))
    }

    async fn seed(store: &MemoryArchiveStore, status: ArchiveStatus, age_secs: i64) -> Archive {
        let mut row = Archive::building(ArchiveType::All, "hash", 1);
        row.status = status;
        row.object_id = Some("archives/old.tar.gz".to_string());
        row.created_at = Utc::now() - ChronoDuration::seconds(age_secs);
        store.insert(&row).await.unwrap();
        row
    }

    #[tokio::test]
    async fn fresh_hash_inserts() {
        let store = Arc::new(MemoryArchiveStore::new());
        let out = resolver(store.clone())
            .save(Archive::building(ArchiveType::All, "hash", 3))
            .await
            .unwrap();
        assert!(matches!(out, Resolution::Inserted(_)));
        assert!(out.needs_build());
    }

    #[tokio::test]
    async fn complete_row_is_reused_untouched() {
        let store = Arc::new(MemoryArchiveStore::new());
        let seeded = seed(&store, ArchiveStatus::Complete, 5).await;
        let out = resolver(store.clone())
            .save(Archive::building(ArchiveType::All, "hash", 9))
            .await
            .unwrap();
        assert_eq!(out, Resolution::Existing(seeded));
        assert!(!out.needs_build());
    }

    #[tokio::test]
    async fn failed_and_cancelled_rows_restart_with_same_identity() {
        for status in [ArchiveStatus::Failed, ArchiveStatus::Cancelled] {
            let store = Arc::new(MemoryArchiveStore::new());
            let seeded = seed(&store, status, 5).await;
            let out = resolver(store.clone())
                .save(Archive::building(ArchiveType::All, "hash", 9))
                .await
                .unwrap();
            let Resolution::Restarted(archive) = out else {
                panic!("expected restart for {status}");
            };
            assert_eq!(archive.id, seeded.id);
            assert_eq!(archive.status, ArchiveStatus::Building);
            assert_eq!(archive.object_id, None);
            assert_eq!(archive.num_of_samples, 9);
            assert!(archive.created_at > seeded.created_at);
            assert_eq!(store.snapshot().await, vec![archive]);
        }
    }

    #[tokio::test]
    async fn building_row_is_rejected_until_stuck() {
        let store = Arc::new(MemoryArchiveStore::new());
        seed(&store, ArchiveStatus::Building, 5).await;
        let err = resolver(store.clone())
            .save(Archive::building(ArchiveType::All, "hash", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::AlreadyBuilding { .. }));
        assert_eq!(store.snapshot().await.len(), 1);

        let stuck_store = Arc::new(MemoryArchiveStore::new());
        let stuck = seed(&stuck_store, ArchiveStatus::Building, 600).await;
        let out = resolver(stuck_store.clone())
            .save(Archive::building(ArchiveType::All, "hash", 1))
            .await
            .unwrap();
        assert!(matches!(out, Resolution::Restarted(ref a) if a.id == stuck.id));
    }

    /// Hands control back to the scheduler before every call so concurrent
    /// saves interleave between the read and the write.
    struct YieldingStore(MemoryArchiveStore);

    #[async_trait::async_trait]
    impl ArchiveStore for YieldingStore {
        async fn insert(&self, archive: &Archive) -> Result<InsertOutcome, StoreError> {
            tokio::task::yield_now().await;
            self.0.insert(archive).await
        }

        async fn find_by_hash(
            &self,
            archive_type: ArchiveType,
            hash_info: &str,
        ) -> Result<Option<Archive>, StoreError> {
            tokio::task::yield_now().await;
            self.0.find_by_hash(archive_type, hash_info).await
        }

        async fn get(&self, id: uuid::Uuid) -> Result<Option<Archive>, StoreError> {
            tokio::task::yield_now().await;
            self.0.get(id).await
        }

        async fn update(&self, archive: &Archive, expected: RowVersion) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.0.update(archive, expected).await
        }

        async fn list(
            &self,
            params: &archivist_server::ListParams,
        ) -> Result<archivist_server::Page<Archive>, StoreError> {
            self.0.list(params).await
        }

        async fn latest_complete(
            &self,
            archive_type: ArchiveType,
        ) -> Result<Option<Archive>, StoreError> {
            self.0.latest_complete(archive_type).await
        }

        async fn record_download(&self, id: uuid::Uuid) -> Result<(), StoreError> {
            self.0.record_download(id).await
        }
    }

    #[tokio::test]
    async fn concurrent_restarts_elect_a_single_builder() {
        let inner = MemoryArchiveStore::new();
        seed(&inner, ArchiveStatus::Failed, 5).await;
        let store = Arc::new(YieldingStore(inner));
        let resolver = ArchiveResolver::new(store.clone(), Duration::from_secs(60));

        let (first, second) = tokio::join!(
            resolver.save(Archive::building(ArchiveType::All, "hash", 2)),
            resolver.save(Archive::building(ArchiveType::All, "hash", 2)),
        );
        let outcomes = [first, second];
        let restarted = outcomes
            .iter()
            .filter(|out| matches!(out, Ok(Resolution::Restarted(_))))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|out| matches!(out, Err(ResolveError::AlreadyBuilding { .. })))
            .count();
        assert_eq!((restarted, rejected), (1, 1));
        assert_eq!(store.0.snapshot().await.len(), 1);
    }
}
