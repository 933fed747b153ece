//! Set-query intake: the factory runs inline so rejections reach the caller,
//! accepted requests queue for a fixed pool of pipeline workers.

use std::sync::Arc;

use archivist_server::SetQuerySubmission;
use flume::{Receiver, Sender};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::services::builder::BuildLauncher;
use crate::services::requests::{BuildPlan, BuildRequest, RequestError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("set-query dispatcher is shut down")]
    Closed,
}

#[derive(Clone)]
pub struct SetQueryHandle {
    launcher: Arc<dyn BuildLauncher>,
    tx: Sender<BuildRequest>,
    cancel: CancellationToken,
}

impl SetQueryHandle {
    pub async fn submit(&self, set_id: &str) -> Result<SetQuerySubmission, DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        let request = match self.launcher.prepare_set(set_id).await? {
            BuildPlan::Reuse(archive) => {
                debug!(set_id, archive_id = %archive.id, "set-query snapshot already archived");
                return Ok(SetQuerySubmission::Reused(archive));
            }
            BuildPlan::Build(request) => request,
        };

        let archive = request.archive.clone();
        if let Err(flume::SendError(request)) = self.tx.send_async(request).await {
            // Nobody will run it; close the row out.
            let token = CancellationToken::new();
            token.cancel();
            self.launcher.run(request, token).await;
            return Err(DispatchError::Closed);
        }
        info!(set_id, archive_id = %archive.id, "set-query build queued");
        Ok(SetQuerySubmission::Accepted(archive))
    }
}

pub struct SetQueryDispatcher {
    handle: SetQueryHandle,
    workers: Vec<JoinHandle<()>>,
}

impl SetQueryDispatcher {
    pub fn spawn(launcher: Arc<dyn BuildLauncher>, workers: usize, capacity: usize) -> Self {
        debug_assert!(workers > 0);
        let (tx, rx) = flume::bounded::<BuildRequest>(capacity.max(1));
        let cancel = CancellationToken::new();
        let workers = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    launcher.clone(),
                    rx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        Self {
            handle: SetQueryHandle {
                launcher,
                tx,
                cancel,
            },
            workers,
        }
    }

    pub fn handle(&self) -> SetQueryHandle {
        self.handle.clone()
    }

    /// Cancel in-flight and queued builds, then join every worker.
    pub async fn shutdown(self) {
        self.handle.cancel.cancel();
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!(error = %err, "set-query worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    launcher: Arc<dyn BuildLauncher>,
    rx: Receiver<BuildRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv_async() => match next {
                Ok(request) => request,
                Err(_) => return,
            },
        };
        supervise(worker, &launcher, request, cancel.child_token()).await;
    }

    while let Ok(request) = rx.try_recv() {
        supervise(worker, &launcher, request, cancel.child_token()).await;
    }
    debug!(worker, "set-query worker stopped");
}

async fn supervise(
    worker: usize,
    launcher: &Arc<dyn BuildLauncher>,
    request: BuildRequest,
    cancel: CancellationToken,
) {
    let launcher = launcher.clone();
    let archive_id = request.archive.id;
    match tokio::spawn(async move { launcher.run(request, cancel).await }).await {
        Ok(archive) => debug!(worker, archive_id = %archive.id, status = %archive.status, "set-query build finished"),
        Err(err) => error!(worker, archive_id = %archive_id, error = %err, "set-query build task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{ARCHIVED_SET, FakeLauncher, MISSING_SET};
    use archivist_server::ArchiveStatus;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn accepted_sets_run_on_workers() {
        let launcher = Arc::new(FakeLauncher::default().with_run_time(Duration::from_secs(5)));
        let dispatcher = SetQueryDispatcher::spawn(launcher.clone(), 2, 8);
        let handle = dispatcher.handle();

        for set in ["s1", "s2", "s3"] {
            let submission = handle.submit(set).await.unwrap();
            assert!(matches!(submission, SetQuerySubmission::Accepted(_)));
        }
        sleep(Duration::from_secs(6)).await;
        assert_eq!(launcher.finished().len(), 2);
        sleep(Duration::from_secs(5)).await;
        let finished = launcher.finished();
        assert_eq!(finished.len(), 3);
        assert!(finished.iter().all(|a| a.status == ArchiveStatus::Complete));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn rejections_and_reuse_surface_to_the_caller() {
        let launcher = Arc::new(FakeLauncher::default());
        let dispatcher = SetQueryDispatcher::spawn(launcher.clone(), 1, 1);
        let handle = dispatcher.handle();

        let err = handle.submit(MISSING_SET).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Request(RequestError::SetNotFound { .. })
        ));
        let reused = handle.submit(ARCHIVED_SET).await.unwrap();
        assert!(matches!(reused, SetQuerySubmission::Reused(ref a) if a.status == ArchiveStatus::Complete));
        dispatcher.shutdown().await;
        assert!(launcher.finished().is_empty());
        assert_eq!(launcher.sets(), vec![MISSING_SET, ARCHIVED_SET]);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_survives_a_panicking_build() {
        let launcher = Arc::new(FakeLauncher::default().panicking_run());
        let dispatcher = SetQueryDispatcher::spawn(launcher.clone(), 1, 4);
        let handle = dispatcher.handle();

        handle.submit("boom").await.unwrap();
        handle.submit("fine").await.unwrap();
        sleep(Duration::from_secs(1)).await;

        let finished = launcher.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].hash_info, "set-fine");
        assert_eq!(finished[0].status, ArchiveStatus::Complete);
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_running_and_queued_builds() {
        let launcher = Arc::new(FakeLauncher::default().with_run_time(Duration::from_secs(600)));
        let dispatcher = SetQueryDispatcher::spawn(launcher.clone(), 1, 4);
        let handle = dispatcher.handle();
        handle.submit("a").await.unwrap();
        handle.submit("b").await.unwrap();
        sleep(Duration::from_secs(1)).await;

        dispatcher.shutdown().await;
        let finished = launcher.finished();
        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|a| a.status == ArchiveStatus::Cancelled));
        assert!(matches!(handle.submit("c").await, Err(DispatchError::Closed)));
    }
}
