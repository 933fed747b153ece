use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use archivist_server::{Archive, ArchiveStatus, ArchiveType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::pipeline::IndexQuery;
use crate::services::builder::BuildLauncher;
use crate::services::index::IndexError;
use crate::services::requests::{BuildPlan, BuildRequest, RequestError};

pub const MISSING_SET: &str = "missing-set";
pub const ARCHIVED_SET: &str = "archived-set";

/// Launcher that records calls and simulates timing without any IO.
#[derive(Default)]
pub struct FakeLauncher {
    prepare_time: Duration,
    run_time: Duration,
    fail_prepare: bool,
    panic_prepare: AtomicBool,
    panic_run: AtomicBool,
    prepared: Mutex<Vec<DateTime<Utc>>>,
    sets: Mutex<Vec<String>>,
    finished: Mutex<Vec<Archive>>,
}

impl FakeLauncher {
    pub fn with_prepare_time(mut self, time: Duration) -> Self {
        self.prepare_time = time;
        self
    }

    pub fn with_run_time(mut self, time: Duration) -> Self {
        self.run_time = time;
        self
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    /// The next `prepare_*` call panics; later calls behave normally.
    pub fn panicking_prepare(self) -> Self {
        self.panic_prepare.store(true, Ordering::SeqCst);
        self
    }

    /// The next `run` panics before recording anything.
    pub fn panicking_run(self) -> Self {
        self.panic_run.store(true, Ordering::SeqCst);
        self
    }

    pub fn prepared(&self) -> Vec<DateTime<Utc>> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn sets(&self) -> Vec<String> {
        self.sets.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<Archive> {
        self.finished.lock().unwrap().clone()
    }

    fn request(archive_type: ArchiveType, hash: String, instant: DateTime<Utc>) -> BuildPlan {
        BuildPlan::Build(BuildRequest {
            archive: Archive::building(archive_type, hash, 1),
            query: IndexQuery::match_all(),
            trigger_instant: instant,
        })
    }
}

#[async_trait]
impl BuildLauncher for FakeLauncher {
    async fn prepare_all(&self, cutoff: DateTime<Utc>) -> Result<BuildPlan, RequestError> {
        self.prepared.lock().unwrap().push(cutoff);
        sleep(self.prepare_time).await;
        if self.panic_prepare.swap(false, Ordering::SeqCst) {
            panic!("preparation blew up");
        }
        if self.fail_prepare {
            return Err(RequestError::Index(IndexError::Malformed {
                stage: "aggregate",
                reason: "index unavailable".to_string(),
            }));
        }
        Ok(Self::request(
            ArchiveType::All,
            format!("all-{}", cutoff.timestamp()),
            cutoff,
        ))
    }

    async fn prepare_set(&self, set_id: &str) -> Result<BuildPlan, RequestError> {
        self.sets.lock().unwrap().push(set_id.to_string());
        sleep(self.prepare_time).await;
        if self.panic_prepare.swap(false, Ordering::SeqCst) {
            panic!("preparation blew up");
        }
        match set_id {
            MISSING_SET => Err(RequestError::SetNotFound {
                set_id: set_id.to_string(),
            }),
            ARCHIVED_SET => {
                let mut archive = Archive::building(ArchiveType::SetQuery, "done", 1);
                archive.status = ArchiveStatus::Complete;
                Ok(BuildPlan::Reuse(archive))
            }
            _ => Ok(Self::request(
                ArchiveType::SetQuery,
                format!("set-{set_id}"),
                Utc::now(),
            )),
        }
    }

    async fn run(&self, request: BuildRequest, cancel: CancellationToken) -> Archive {
        if self.panic_run.swap(false, Ordering::SeqCst) {
            panic!("build blew up");
        }
        let status = if cancel.is_cancelled() {
            ArchiveStatus::Cancelled
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => ArchiveStatus::Cancelled,
                _ = sleep(self.run_time) => ArchiveStatus::Complete,
            }
        };
        let archive = Archive {
            status,
            ..request.archive
        };
        self.finished.lock().unwrap().push(archive.clone());
        archive
    }
}
