use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};
use thiserror::Error;

use crate::config::{AppConfig, NotifyKind, ObjectBackend};
use crate::paths::{AppPaths, PathError};
use crate::pipeline::{RowEncoder, TsvRowEncoder};
use crate::services::archives::{ArchiveStore, StoreError};
use crate::services::bundle::{BundleError, BundleLayout};
use crate::services::downloader::{BlobRateLimiter, DownloadError, RecordDownloader, blob_rate_limiter};
use crate::services::index::{DocumentIndex, ElasticIndex, IndexError};
use crate::services::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::services::object_store::{FsObjectStore, HttpObjectStore, ObjectStore, ObjectStoreError};
use crate::services::requests::{BuildRequestFactory, QueryFields, RequestError};
use crate::services::resolver::ArchiveResolver;
use crate::services::retry::RetryPolicy;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Message(String),
    #[error("build cancelled")]
    Cancelled,
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("archive upload failed: {0}")]
    Upload(#[from] ObjectStoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Path(#[from] PathError),
}

impl BuildError {
    pub fn message(msg: impl Into<String>) -> Self {
        BuildError::Message(msg.into())
    }

    /// Whether a later attempt could plausibly succeed without intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            BuildError::Index(err) => err.is_transient(),
            BuildError::Download(DownloadError::Index(err)) => err.is_transient(),
            BuildError::Download(DownloadError::Blob { source, .. }) => source.is_transient(),
            BuildError::Upload(err) => err.is_transient(),
            BuildError::Bundle(BundleError::Io { .. }) => true,
            BuildError::Store(StoreError::Database(_)) => true,
            _ => false,
        }
    }
}

/// Knobs for one pipeline run.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub blob_prefix: String,
    pub archive_prefix: String,
    pub fetch_concurrency: usize,
    pub retry: RetryPolicy,
    pub layout: BundleLayout,
    pub fields: QueryFields,
    pub max_building: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            blob_prefix: "blobs".to_string(),
            archive_prefix: "archives".to_string(),
            fetch_concurrency: 8,
            retry: RetryPolicy::default(),
            layout: BundleLayout::default(),
            fields: QueryFields::builder()
                .id_field("id")
                .updated_field("lastUpdated")
                .sets_index("sets")
                .build(),
            max_building: Duration::from_secs(3_600),
        }
    }
}

impl BuildOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            blob_prefix: cfg.storage.blob_prefix.clone(),
            archive_prefix: cfg.storage.archive_prefix.clone(),
            fetch_concurrency: cfg.build.fetch_concurrency,
            retry: RetryPolicy::from_config(&cfg.build),
            layout: BundleLayout {
                payload_file_name: cfg.build.payload_file_name.clone(),
                metadata_file_name: cfg.build.metadata_file_name.clone(),
            },
            fields: QueryFields::builder()
                .id_field(cfg.index.id_field.clone())
                .updated_field(cfg.index.updated_field.clone())
                .sets_index(cfg.index.sets_index.clone())
                .build(),
            max_building: Duration::from_secs(cfg.build.max_building_secs),
        }
    }
}

/// Everything a pipeline run touches.
#[derive(Clone)]
pub struct BuildContext {
    pub index: Arc<dyn DocumentIndex>,
    pub objects: Arc<dyn ObjectStore>,
    pub store: Arc<dyn ArchiveStore>,
    pub notifier: Arc<dyn Notifier>,
    pub encoder: Arc<dyn RowEncoder>,
    pub paths: AppPaths,
    pub limiter: Option<Arc<BlobRateLimiter>>,
    pub options: BuildOptions,
}

impl BuildContext {
    pub fn downloader(&self) -> RecordDownloader {
        RecordDownloader::builder()
            .objects(self.objects.clone())
            .blob_prefix(self.options.blob_prefix.clone())
            .concurrency(self.options.fetch_concurrency)
            .retry(self.options.retry)
            .maybe_limiter(self.limiter.clone())
            .build()
    }

    pub fn request_factory(&self) -> BuildRequestFactory {
        let resolver = ArchiveResolver::new(self.store.clone(), self.options.max_building);
        BuildRequestFactory::new(
            self.index.clone(),
            resolver,
            self.options.fields.clone(),
        )
    }
}

fn parse_url(field: &str, raw: &str) -> BuildResult<Url> {
    Url::parse(raw).map_err(|err| BuildError::message(format!("invalid {field} `{raw}`: {err}")))
}

/// Wire the index client, object store and notifier described by `cfg`.
pub fn build_context(
    cfg: &AppConfig,
    paths: AppPaths,
    store: Arc<dyn ArchiveStore>,
) -> BuildResult<BuildContext> {
    let options = BuildOptions::from_config(cfg);
    let client = Client::builder()
        .timeout(cfg.index.timeout())
        .build()
        .map_err(|err| BuildError::message(format!("http client: {err}")))?;

    let index = ElasticIndex::builder()
        .client(client.clone())
        .base_url(parse_url("index.url", &cfg.index.url)?)
        .index(cfg.index.index.clone())
        .sets_index(cfg.index.sets_index.clone())
        .id_field(cfg.index.id_field.clone())
        .updated_field(cfg.index.updated_field.clone())
        .blob_key_field(cfg.index.blob_key_field.clone())
        .source_fields(cfg.build.columns.iter().map(|c| c.field.clone()).collect())
        .page_size(cfg.index.page_size)
        .scroll_keep_alive(cfg.index.scroll_keep_alive.clone())
        .retry(options.retry)
        .build();

    let objects: Arc<dyn ObjectStore> = match cfg.storage.backend {
        ObjectBackend::Fs => {
            let root = match &cfg.storage.root {
                Some(root) => root.clone(),
                None => paths.objects_dir()?,
            };
            Arc::new(FsObjectStore::builder().root(root).build())
        }
        ObjectBackend::Http => {
            let raw = cfg
                .storage
                .base_url
                .as_deref()
                .ok_or_else(|| BuildError::message("storage.base_url is required for http"))?;
            Arc::new(
                HttpObjectStore::builder()
                    .client(client.clone())
                    .base_url(parse_url("storage.base_url", raw)?)
                    .build(),
            )
        }
    };

    let notifier: Arc<dyn Notifier> = match cfg.notify.kind {
        NotifyKind::Log => Arc::new(LogNotifier),
        NotifyKind::Webhook => {
            let raw = cfg
                .notify
                .webhook_url
                .as_deref()
                .ok_or_else(|| BuildError::message("notify.webhook_url is required for webhook"))?;
            Arc::new(
                WebhookNotifier::builder()
                    .client(client)
                    .url(parse_url("notify.webhook_url", raw)?)
                    .retry(options.retry)
                    .build(),
            )
        }
    };

    Ok(BuildContext {
        index: Arc::new(index),
        objects,
        store,
        notifier,
        encoder: Arc::new(TsvRowEncoder::new(&cfg.build.columns)),
        paths,
        limiter: blob_rate_limiter(cfg.build.fetch_rate_per_sec),
        options,
    })
}
