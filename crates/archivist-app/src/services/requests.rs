//! Turns a trigger (cutoff instant or saved set) into a persisted archive row
//! plus the query the pipeline will scroll.

use std::sync::Arc;

use archivist_server::{Archive, ArchiveType};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::pipeline::{IndexQuery, corpus_fingerprint, format_instant, set_fingerprint};
use crate::services::index::{CorpusStats, DocumentIndex, IndexError};
use crate::services::resolver::{ArchiveResolver, ResolveError};

/// One pipeline attempt. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub archive: Archive,
    pub query: IndexQuery,
    pub trigger_instant: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildPlan {
    Build(BuildRequest),
    /// The snapshot is already archived.
    Reuse(Archive),
}

impl BuildPlan {
    pub fn archive(&self) -> &Archive {
        match self {
            BuildPlan::Build(request) => &request.archive,
            BuildPlan::Reuse(archive) => archive,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("saved set {set_id} not found")]
    SetNotFound { set_id: String },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Field names the factory needs to phrase index queries.
#[derive(Debug, Clone, bon::Builder)]
pub struct QueryFields {
    #[builder(into)]
    pub id_field: String,
    #[builder(into)]
    pub updated_field: String,
    #[builder(into)]
    pub sets_index: String,
}

#[derive(Clone)]
pub struct BuildRequestFactory {
    index: Arc<dyn DocumentIndex>,
    resolver: ArchiveResolver,
    fields: QueryFields,
}

impl BuildRequestFactory {
    pub fn new(
        index: Arc<dyn DocumentIndex>,
        resolver: ArchiveResolver,
        fields: QueryFields,
    ) -> Self {
        Self {
            index,
            resolver,
            fields,
        }
    }

    /// All-corpus snapshot of records updated at or before `cutoff`.
    pub async fn for_cutoff(&self, cutoff: DateTime<Utc>) -> Result<BuildPlan, RequestError> {
        let query = IndexQuery::updated_up_to(&self.fields.updated_field, cutoff);
        let stats = self.index.aggregate(&query).await?;
        let hash_info = corpus_fingerprint(stats.count, stats.max_updated);
        debug!(
            cutoff = %format_instant(cutoff),
            count = stats.count,
            hash_info = %hash_info,
            "all-corpus snapshot fingerprinted"
        );
        self.persist(ArchiveType::All, hash_info, stats, query, cutoff)
            .await
    }

    /// Snapshot of the records listed by saved set `set_id`.
    pub async fn for_set(&self, set_id: &str) -> Result<BuildPlan, RequestError> {
        let set = self
            .index
            .fetch_set(set_id)
            .await?
            .ok_or_else(|| RequestError::SetNotFound {
                set_id: set_id.to_string(),
            })?;
        let query =
            IndexQuery::in_saved_set(&self.fields.id_field, &self.fields.sets_index, &set.id);
        let stats = self.index.aggregate(&query).await?;
        let hash_info = set_fingerprint(&set.sqon, set.size, stats.max_updated);
        debug!(
            set_id,
            count = stats.count,
            hash_info = %hash_info,
            "saved set fingerprinted"
        );
        self.persist(ArchiveType::SetQuery, hash_info, stats, query, Utc::now())
            .await
    }

    async fn persist(
        &self,
        archive_type: ArchiveType,
        hash_info: String,
        stats: CorpusStats,
        query: IndexQuery,
        trigger_instant: DateTime<Utc>,
    ) -> Result<BuildPlan, RequestError> {
        let samples = i64::try_from(stats.count).unwrap_or(i64::MAX);
        let candidate = Archive::building(archive_type, hash_info, samples);
        let resolution = self.resolver.save(candidate).await?;
        // The resolved row carries the generation the pipeline must finish.
        if !resolution.needs_build() {
            return Ok(BuildPlan::Reuse(resolution.into_archive()));
        }
        Ok(BuildPlan::Build(BuildRequest {
            archive: resolution.into_archive(),
            query,
            trigger_instant,
        }))
    }
}
