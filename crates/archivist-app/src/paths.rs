//! Filesystem path helpers (XDG-aware) for working bundles and local objects.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;
use uuid::Uuid;

use crate::constants::SEALED_SUFFIX;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid object key `{key}`; keys must be relative and free of `..`")]
    InvalidObjectKey { key: String },
}

/// Container providing filesystem paths for the application. In production this is
/// rooted at `$XDG_DATA_HOME/archivist`; tests may construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/archivist`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs = ProjectDirs::from("dev", "archivist", "archivist")
            .ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// Parent of every working bundle (`.../bundles`).
    pub fn bundles_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["bundles"])
    }

    /// Working directory of one build run (`.../bundles/{id}-{run}`). Not created.
    pub fn bundle_work_dir(&self, archive_id: Uuid, run_id: Uuid) -> Result<PathBuf, PathError> {
        Ok(self.bundles_dir()?.join(format!("{archive_id}-{run_id}")))
    }

    /// Sealed archive location (`.../bundles/{id}-{run}.tar.gz`). Not created.
    pub fn sealed_bundle_path(&self, archive_id: Uuid, run_id: Uuid) -> Result<PathBuf, PathError> {
        Ok(self
            .bundles_dir()?
            .join(format!("{archive_id}-{run_id}{SEALED_SUFFIX}")))
    }

    /// Root for the filesystem object store (`.../objects`).
    pub fn objects_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["objects"])
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

/// Resolve an object key below `root`, rejecting absolute and parent-relative keys.
pub fn object_path(root: &Path, key: &str) -> Result<PathBuf, PathError> {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty()
        || trimmed
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(PathError::InvalidObjectKey {
            key: key.to_owned(),
        });
    }
    let mut path = root.to_path_buf();
    for segment in trimmed.split('/') {
        path.push(segment);
    }
    Ok(path)
}

pub(crate) fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path) {
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(PathError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            });
        }
    }
    Ok(path.to_path_buf())
}
