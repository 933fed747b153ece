//! Application-level error type shared by the binary and its subcommands.

use thiserror::Error;
use uuid::Uuid;

use crate::config;
use crate::paths::PathError;
use crate::services::{BuildError, RequestError, StoreError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Server(#[from] archivist_server::ServerError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid timestamp `{value}`: {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("archive {id} not found")]
    ArchiveNotFound { id: Uuid },
    #[error("build of archive {id} ended {status}")]
    BuildUnsuccessful { id: Uuid, status: String },
}
