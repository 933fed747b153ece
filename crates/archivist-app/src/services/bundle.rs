//! Working bundle: a private directory holding the payload and metadata files
//! of one build run, sealed into a single `.tar.gz`. Paths are keyed by archive
//! id and run id, so two runs of one archive never share files.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::Header;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::{ARCHIVE_ENTRY_MODE, ARCHIVE_ROOT_PREFIX, WORK_DIR_MODE};
use crate::paths::{AppPaths, PathError};
use crate::pipeline::{PayloadSegment, Record, RowEncoder};

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("payload offset overflowed")]
    Overflow,
    #[error("sealing task failed: {0}")]
    Join(String),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> BundleError + '_ {
    move |source| BundleError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File names inside the bundle directory and the sealed archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    pub payload_file_name: String,
    pub metadata_file_name: String,
}

impl Default for BundleLayout {
    fn default() -> Self {
        Self {
            payload_file_name: "payload.bin".to_string(),
            metadata_file_name: "metadata.tsv".to_string(),
        }
    }
}

/// Filesystem locations owned by one build run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFiles {
    pub work_dir: PathBuf,
    pub sealed_path: PathBuf,
}

impl BundleFiles {
    pub fn for_run(paths: &AppPaths, archive_id: Uuid, run_id: Uuid) -> Result<Self, BundleError> {
        Ok(Self {
            work_dir: paths.bundle_work_dir(archive_id, run_id)?,
            sealed_path: paths.sealed_bundle_path(archive_id, run_id)?,
        })
    }

    /// Remove the working directory and sealed file. Missing entries are fine.
    pub async fn remove(&self) {
        match fs::remove_dir_all(&self.work_dir).await {
            Ok(()) => debug!(path = %self.work_dir.display(), "working bundle removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.work_dir.display(), error = %err, "failed to remove working bundle"),
        }
        self.remove_sealed().await;
    }

    pub async fn remove_sealed(&self) {
        match fs::remove_file(&self.sealed_path).await {
            Ok(()) => debug!(path = %self.sealed_path.display(), "sealed bundle removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.sealed_path.display(), error = %err, "failed to remove sealed bundle"),
        }
    }
}

/// A sealed archive waiting for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBundle {
    pub files: BundleFiles,
    pub rows: u64,
    pub payload_bytes: u64,
}

impl SealedBundle {
    pub fn path(&self) -> &Path {
        &self.files.sealed_path
    }
}

pub struct WorkingBundle {
    archive_id: Uuid,
    files: BundleFiles,
    layout: BundleLayout,
    encoder: Arc<dyn RowEncoder>,
    payload: BufWriter<fs::File>,
    metadata: BufWriter<fs::File>,
    offset: u64,
    rows: u64,
}

impl WorkingBundle {
    /// Create the run's private working directory and write the header row.
    pub async fn open(
        paths: &AppPaths,
        archive_id: Uuid,
        run_id: Uuid,
        encoder: Arc<dyn RowEncoder>,
        layout: BundleLayout,
    ) -> Result<Self, BundleError> {
        let files = BundleFiles::for_run(paths, archive_id, run_id)?;
        create_private_dir(&files.work_dir).await?;

        let payload_path = files.work_dir.join(&layout.payload_file_name);
        let metadata_path = files.work_dir.join(&layout.metadata_file_name);
        let payload = fs::File::create(&payload_path)
            .await
            .map_err(io_at(&payload_path))?;
        let metadata = fs::File::create(&metadata_path)
            .await
            .map_err(io_at(&metadata_path))?;

        let mut bundle = Self {
            archive_id,
            files,
            layout,
            encoder,
            payload: BufWriter::new(payload),
            metadata: BufWriter::new(metadata),
            offset: 0,
            rows: 0,
        };
        let header = bundle.encoder.header();
        bundle
            .metadata
            .write_all(header.as_bytes())
            .await
            .map_err(io_at(&metadata_path))?;
        debug!(archive_id = %archive_id, dir = %bundle.files.work_dir.display(), "working bundle opened");
        Ok(bundle)
    }

    /// Append `bytes` to the payload and the matching row to the metadata file.
    pub async fn append(
        &mut self,
        record: &Record,
        bytes: &[u8],
    ) -> Result<PayloadSegment, BundleError> {
        let segment = PayloadSegment {
            offset: self.offset,
            length: bytes.len() as u64,
        };
        let next_offset = self
            .offset
            .checked_add(segment.length)
            .ok_or(BundleError::Overflow)?;

        let payload_path = self.files.work_dir.join(&self.layout.payload_file_name);
        self.payload
            .write_all(bytes)
            .await
            .map_err(io_at(&payload_path))?;
        let row = self.encoder.encode(record, segment);
        let metadata_path = self.files.work_dir.join(&self.layout.metadata_file_name);
        self.metadata
            .write_all(row.as_bytes())
            .await
            .map_err(io_at(&metadata_path))?;

        self.offset = next_offset;
        self.rows += 1;
        Ok(segment)
    }

    /// Flush both files, tar+gzip them under `archive-<id>/`, then delete the
    /// working directory. On failure everything is removed.
    pub async fn seal(mut self) -> Result<SealedBundle, BundleError> {
        let files = self.files.clone();
        match self.seal_inner().await {
            Ok(sealed) => {
                if let Err(err) = fs::remove_dir_all(&files.work_dir).await {
                    if err.kind() != io::ErrorKind::NotFound {
                        files.remove_sealed().await;
                        return Err(io_at(&files.work_dir)(err));
                    }
                }
                Ok(sealed)
            }
            Err(err) => {
                files.remove().await;
                Err(err)
            }
        }
    }

    async fn seal_inner(&mut self) -> Result<SealedBundle, BundleError> {
        let work_dir = self.files.work_dir.clone();
        self.payload.flush().await.map_err(io_at(&work_dir))?;
        self.payload.get_mut().sync_all().await.map_err(io_at(&work_dir))?;
        self.metadata.flush().await.map_err(io_at(&work_dir))?;
        self.metadata.get_mut().sync_all().await.map_err(io_at(&work_dir))?;

        let entries = vec![
            self.layout.metadata_file_name.clone(),
            self.layout.payload_file_name.clone(),
        ];
        let root = format!("{ARCHIVE_ROOT_PREFIX}{}", self.archive_id);
        let sealed_path = self.files.sealed_path.clone();
        let target = sealed_path.clone();
        tokio::task::spawn_blocking(move || write_tar_gz(&work_dir, &root, &entries, &target))
            .await
            .map_err(|err| BundleError::Join(err.to_string()))??;

        debug!(
            archive_id = %self.archive_id,
            rows = self.rows,
            payload_bytes = self.offset,
            path = %sealed_path.display(),
            "bundle sealed"
        );
        Ok(SealedBundle {
            files: self.files.clone(),
            rows: self.rows,
            payload_bytes: self.offset,
        })
    }

    /// Drop open handles and remove every file this bundle created.
    pub async fn discard(self) {
        let files = self.files.clone();
        drop(self);
        files.remove().await;
    }
}

async fn create_private_dir(path: &Path) -> Result<(), BundleError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(WORK_DIR_MODE);
    builder.create(path).await.map_err(io_at(path))
}

fn write_tar_gz(
    work_dir: &Path,
    root: &str,
    entries: &[String],
    target: &Path,
) -> Result<(), BundleError> {
    let out = File::create(target).map_err(io_at(target))?;
    let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
    let mtime = u64::try_from(Utc::now().timestamp()).unwrap_or(0);

    for name in entries {
        let source_path = work_dir.join(name);
        let file = File::open(&source_path).map_err(io_at(&source_path))?;
        let len = file.metadata().map_err(io_at(&source_path))?.len();
        let mut header = Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(ARCHIVE_ENTRY_MODE);
        header.set_mtime(mtime);
        header.set_size(len);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{root}/{name}"), file)
            .map_err(io_at(target))?;
    }

    let encoder = builder.into_inner().map_err(io_at(target))?;
    let out = encoder.finish().map_err(io_at(target))?;
    out.sync_all().map_err(io_at(target))
}
