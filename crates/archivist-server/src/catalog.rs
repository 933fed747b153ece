use std::{fmt, pin::Pin};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

pub const PAGE_SIZE_DEFAULT: usize = 20;
pub const PAGE_SIZE_MAX: usize = 100;

/// Lifecycle of a single archive build.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveStatus {
    Building,
    Complete,
    Failed,
    Cancelled,
}

impl ArchiveStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ArchiveStatus::Building)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveType {
    All,
    SetQuery,
}

impl ArchiveType {
    /// Path segment used by the HTTP routes.
    pub fn slug(self) -> &'static str {
        match self {
            ArchiveType::All => "all",
            ArchiveType::SetQuery => "set-query",
        }
    }
}

/// Persisted record of one build attempt and its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Archive {
    pub id: Uuid,
    pub status: ArchiveStatus,
    #[serde(rename = "type")]
    pub archive_type: ArchiveType,
    pub hash_info: String,
    pub object_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub num_of_samples: i64,
    #[serde(default)]
    pub num_of_downloads: i64,
}

impl Archive {
    /// Fresh `BUILDING` archive with a new identity.
    #[must_use]
    pub fn building(
        archive_type: ArchiveType,
        hash_info: impl Into<String>,
        num_of_samples: i64,
    ) -> Self {
        let hash_info = hash_info.into();
        debug_assert!(!hash_info.is_empty());
        Self {
            id: Uuid::new_v4(),
            status: ArchiveStatus::Building,
            archive_type,
            hash_info,
            object_id: None,
            created_at: Utc::now(),
            num_of_samples,
            num_of_downloads: 0,
        }
    }

    /// File name of the sealed archive (`<id>.tar.gz`).
    pub fn file_name(&self) -> String {
        format!("{}.tar.gz", self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub offset: usize,
    pub size: usize,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn empty(offset: usize, size: usize) -> Self {
        Self {
            content: Vec::new(),
            offset,
            size,
            total: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    NumOfSamples,
    NumOfDownloads,
    Status,
}

impl SortField {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "createdAt" => Some(SortField::CreatedAt),
            "numOfSamples" => Some(SortField::NumOfSamples),
            "numOfDownloads" => Some(SortField::NumOfDownloads),
            "status" => Some(SortField::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListParams {
    pub archive_type: ArchiveType,
    pub status: Option<ArchiveStatus>,
    pub id: Option<Uuid>,
    pub offset: usize,
    pub size: usize,
    pub sort_field: SortField,
    pub sort_dir: SortDirection,
}

impl ListParams {
    pub fn first_page(archive_type: ArchiveType) -> Self {
        Self {
            archive_type,
            status: None,
            id: None,
            offset: 0,
            size: PAGE_SIZE_DEFAULT,
            sort_field: SortField::default(),
            sort_dir: SortDirection::default(),
        }
    }
}

/// Byte stream of a sealed archive.
pub type FileStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

pub struct ArchiveFile {
    pub archive: Archive,
    pub size_bytes: Option<u64>,
    pub stream: FileStream,
}

impl fmt::Debug for ArchiveFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveFile")
            .field("archive", &self.archive)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetQuerySubmission {
    /// A build was queued for this archive.
    Accepted(Archive),
    /// An identical snapshot is already complete.
    Reused(Archive),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    pub reason: Option<String>,
}

impl HealthReport {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait ArchiveApi: Send + Sync + 'static {
    async fn list(&self, params: ListParams) -> Result<Page<Archive>, CatalogError>;
    async fn get(&self, archive_type: ArchiveType, id: Uuid) -> Result<Archive, CatalogError>;
    /// Newest complete all-corpus archive.
    async fn latest_download(&self) -> Result<ArchiveFile, CatalogError>;
    async fn download(&self, id: Uuid) -> Result<ArchiveFile, CatalogError>;
    async fn request_set_query(&self, set_id: &str) -> Result<SetQuerySubmission, CatalogError>;
    /// Signal that the corpus may have changed.
    async fn trigger_build(&self) -> Result<(), CatalogError>;
    async fn health(&self) -> HealthReport;
}

#[derive(Debug, Clone)]
pub struct CatalogError {
    pub kind: CatalogErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogErrorKind {
    InvalidParameter { field: String },
    NotFound { resource: String },
    Conflict,
    Unavailable { reason: String },
    Internal,
}

impl CatalogError {
    pub fn invalid_param(field: impl Into<String>, message: impl Into<String>) -> Self {
        CatalogError {
            kind: CatalogErrorKind::InvalidParameter {
                field: field.into(),
            },
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, message: impl Into<String>) -> Self {
        CatalogError {
            kind: CatalogErrorKind::NotFound {
                resource: resource.into(),
            },
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        CatalogError {
            kind: CatalogErrorKind::Conflict,
            message: message.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        CatalogError {
            message: reason.clone(),
            kind: CatalogErrorKind::Unavailable { reason },
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CatalogError {
            kind: CatalogErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CatalogError {}
