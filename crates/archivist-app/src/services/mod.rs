//! Orchestration layer for IO-bound build services.
//!
//! Modules here talk to the document index, object storage, the archive table
//! and the local filesystem. Pure transforms (fingerprints, queries, row
//! encoding) live in `crate::pipeline`.

pub mod archives;
pub mod builder;
pub mod bundle;
pub mod catalog;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod downloader;
pub mod events;
pub mod index;
pub mod notify;
pub mod object_store;
pub mod requests;
pub mod resolver;
pub mod retry;
pub mod upload;

#[cfg(test)]
pub(crate) mod test_support;

pub use archives::{
    ArchiveStore, InsertOutcome, MemoryArchiveStore, PgArchiveStore, RowVersion, StoreError,
};
pub use builder::{BuildLauncher, PipelineLauncher, run_build};
pub use bundle::{BundleError, BundleFiles, BundleLayout, SealedBundle, WorkingBundle};
pub use catalog::CatalogService;
pub use context::{BuildContext, BuildError, BuildOptions, BuildResult, build_context};
pub use coordinator::{
    AllCorpusCoordinator, CoordinatorError, CoordinatorHandle, CoordinatorOptions,
    CoordinatorPhase, CoordinatorStatus,
};
pub use dispatcher::{DispatchError, SetQueryDispatcher, SetQueryHandle};
pub use downloader::{BlobRateLimiter, DownloadError, RecordDownloader, blob_rate_limiter};
pub use events::{Event, EventPublisher, EventSource, EventStream, IntervalEventSource, QueueEventSource};
pub use index::{CorpusStats, DocumentIndex, ElasticIndex, IndexError, RecordStream, SavedSet};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use object_store::{
    ByteStream, DurableWrite, FsObjectStore, HttpObjectStore, ObjectMeta, ObjectStore,
    ObjectStoreError, PutResult, namespaced_key,
};
pub use requests::{BuildPlan, BuildRequest, BuildRequestFactory, QueryFields, RequestError};
pub use resolver::{ArchiveResolver, Resolution, ResolveError};
pub use retry::RetryPolicy;
pub use upload::{archive_object_key, upload_sealed};
