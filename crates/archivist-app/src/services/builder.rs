//! Build pipeline: scroll, fetch, fold into a bundle, seal, upload, record.

use std::sync::Arc;

use archivist_server::{Archive, ArchiveStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::services::archives::RowVersion;
use crate::services::bundle::{BundleFiles, WorkingBundle};
use crate::services::context::{BuildContext, BuildError, BuildResult};
use crate::services::object_store::PutResult;
use crate::services::requests::{BuildPlan, BuildRequest, BuildRequestFactory, RequestError};
use crate::services::upload::upload_sealed;

/// Seam between the coordinators and the pipeline.
#[async_trait]
pub trait BuildLauncher: Send + Sync + 'static {
    async fn prepare_all(&self, cutoff: DateTime<Utc>) -> Result<BuildPlan, RequestError>;

    async fn prepare_set(&self, set_id: &str) -> Result<BuildPlan, RequestError>;

    /// Run the pipeline to a terminal archive. Never fails: errors become
    /// `FAILED`, cancellation becomes `CANCELLED`.
    async fn run(&self, request: BuildRequest, cancel: CancellationToken) -> Archive;
}

pub struct PipelineLauncher {
    ctx: Arc<BuildContext>,
    factory: BuildRequestFactory,
}

impl PipelineLauncher {
    pub fn new(ctx: Arc<BuildContext>) -> Self {
        let factory = ctx.request_factory();
        Self { ctx, factory }
    }
}

#[async_trait]
impl BuildLauncher for PipelineLauncher {
    async fn prepare_all(&self, cutoff: DateTime<Utc>) -> Result<BuildPlan, RequestError> {
        self.factory.for_cutoff(cutoff).await
    }

    async fn prepare_set(&self, set_id: &str) -> Result<BuildPlan, RequestError> {
        self.factory.for_set(set_id).await
    }

    async fn run(&self, request: BuildRequest, cancel: CancellationToken) -> Archive {
        run_build(&self.ctx, request, cancel).await
    }
}

struct Completed {
    stored: PutResult,
    rows: u64,
}

/// Execute `request` and persist exactly one terminal state for its archive.
///
/// The terminal write only lands while the row still holds the generation
/// this run started from. A run whose row was restarted or already finished
/// by another run leaves the row and the notifier alone.
pub async fn run_build(
    ctx: &BuildContext,
    request: BuildRequest,
    cancel: CancellationToken,
) -> Archive {
    let archive = request.archive.clone();
    let generation = RowVersion::of(&archive);
    let run_id = Uuid::new_v4();
    info!(
        archive_id = %archive.id,
        run_id = %run_id,
        archive_type = %archive.archive_type,
        hash_info = %archive.hash_info,
        trigger = %request.trigger_instant,
        "build started"
    );

    let outcome = execute(ctx, &request, run_id, &cancel).await;
    match BundleFiles::for_run(&ctx.paths, archive.id, run_id) {
        Ok(files) => files.remove().await,
        Err(err) => warn!(archive_id = %archive.id, error = %err, "could not resolve bundle paths for cleanup"),
    }

    let finished = match outcome {
        Ok(done) => {
            info!(
                archive_id = %archive.id,
                rows = done.rows,
                object_id = %done.stored.object_id,
                size_bytes = done.stored.size_bytes,
                checksum = %done.stored.checksum,
                "build complete"
            );
            Archive {
                status: ArchiveStatus::Complete,
                object_id: Some(done.stored.object_id),
                ..archive
            }
        }
        Err(BuildError::Cancelled) => {
            info!(archive_id = %archive.id, "build cancelled");
            Archive {
                status: ArchiveStatus::Cancelled,
                object_id: None,
                ..archive
            }
        }
        Err(err) => {
            warn!(
                archive_id = %archive.id,
                transient = err.is_transient(),
                error = %err,
                "build failed"
            );
            Archive {
                status: ArchiveStatus::Failed,
                object_id: None,
                ..archive
            }
        }
    };

    match ctx.store.update(&finished, generation).await {
        Ok(true) => ctx.notifier.notify(&finished).await,
        Ok(false) => warn!(
            archive_id = %finished.id,
            run_id = %run_id,
            status = %finished.status,
            "archive row moved on during the build; terminal status dropped"
        ),
        Err(err) => {
            error!(
                archive_id = %finished.id,
                status = %finished.status,
                error = %err,
                "failed to record terminal archive status"
            );
            ctx.notifier.notify(&finished).await;
        }
    }
    finished
}

async fn execute(
    ctx: &BuildContext,
    request: &BuildRequest,
    run_id: Uuid,
    cancel: &CancellationToken,
) -> BuildResult<Completed> {
    if cancel.is_cancelled() {
        return Err(BuildError::Cancelled);
    }
    let archive = &request.archive;
    let mut bundle = WorkingBundle::open(
        &ctx.paths,
        archive.id,
        run_id,
        ctx.encoder.clone(),
        ctx.options.layout.clone(),
    )
    .await?;

    if let Err(err) = fill(ctx, request, &mut bundle, cancel).await {
        bundle.discard().await;
        return Err(err);
    }

    let sealed = bundle.seal().await?;
    if cancel.is_cancelled() {
        return Err(BuildError::Cancelled);
    }

    let stored = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(BuildError::Cancelled),
        stored = upload_sealed(
            ctx.objects.clone(),
            &ctx.options.archive_prefix,
            archive,
            sealed.path(),
            ctx.options.retry,
        ) => stored?,
    };
    sealed.files.remove_sealed().await;

    Ok(Completed {
        stored,
        rows: sealed.rows,
    })
}

async fn fill(
    ctx: &BuildContext,
    request: &BuildRequest,
    bundle: &mut WorkingBundle,
    cancel: &CancellationToken,
) -> BuildResult<()> {
    let records = ctx.index.scroll(request.query.clone());
    let mut fetched = ctx.downloader().fetch_all(records);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            next = fetched.next() => next,
        };
        let Some(item) = next else {
            break;
        };
        let (record, bytes) = item?;
        bundle.append(&record, &bytes).await?;
    }
    Ok(())
}
