//! Configuration loading and XDG path helpers.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use archivist_server::ServerConfig;
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const LOCAL_CONFIG_FILE: &str = "config/settings";
const SETTINGS_FILE_NAME: &str = "settings.toml";
const APP_DIR_NAME: &str = "archivist";
const ENV_PREFIX: &str = "ARCHIVIST";
const ETC_DIR_VAR: &str = "ARCHIVIST_ETC_CONFIG_DIR";
const CONFIG_FILE_VAR: &str = "ARCHIVIST_CONFIG_FILE";
const DEFAULT_ETC_DIR: &str = "/etc";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectBackend {
    #[default]
    Fs,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Data directory holding working bundles and, for `fs`, the object root.
    pub path: PathBuf,
    #[serde(default)]
    pub backend: ObjectBackend,
    /// Object root for the `fs` backend; defaults to `<path>/objects`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Base URL for the `http` backend.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "StorageConfig::default_blob_prefix")]
    pub blob_prefix: String,
    #[serde(default = "StorageConfig::default_archive_prefix")]
    pub archive_prefix: String,
}

impl StorageConfig {
    fn default_blob_prefix() -> String {
        "blobs".to_string()
    }

    fn default_archive_prefix() -> String {
        "archives".to_string()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL, or `memory` for the in-process store.
    pub url: String,
    pub max_connections: u32,
    pub bootstrap_schema: bool,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.trim().eq_ignore_ascii_case("memory")
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "memory".to_string(),
            max_connections: 5,
            bootstrap_schema: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub url: String,
    pub index: String,
    pub sets_index: String,
    pub id_field: String,
    pub updated_field: String,
    pub blob_key_field: String,
    pub page_size: usize,
    pub scroll_keep_alive: String,
    pub timeout_secs: u64,
}

impl IndexConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9200".to_string(),
            index: "records".to_string(),
            sets_index: "sets".to_string(),
            id_field: "id".to_string(),
            updated_field: "lastUpdated".to_string(),
            blob_key_field: "objectKey".to_string(),
            page_size: 500,
            scroll_keep_alive: "1m".to_string(),
            timeout_secs: 30,
        }
    }
}

/// One metadata column: header text and the dotted record path it reads.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ColumnConfig {
    pub header: String,
    pub field: String,
}

impl ColumnConfig {
    pub fn new(header: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            field: field.into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BuildConfig {
    pub final_event_check_secs: u64,
    pub bundle_building_check_secs: u64,
    pub max_building_secs: u64,
    pub fetch_concurrency: usize,
    pub fetch_rate_per_sec: Option<u32>,
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
    pub set_query_workers: usize,
    pub set_query_queue_capacity: usize,
    pub columns: Vec<ColumnConfig>,
    pub payload_file_name: String,
    pub metadata_file_name: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            final_event_check_secs: 30,
            bundle_building_check_secs: 10,
            max_building_secs: 3_600,
            fetch_concurrency: 8,
            fetch_rate_per_sec: None,
            retry_attempts: 3,
            retry_delay_ms: 500,
            set_query_workers: 2,
            set_query_queue_capacity: 64,
            columns: vec![
                ColumnConfig::new("id", "id"),
                ColumnConfig::new("last_updated", "lastUpdated"),
                ColumnConfig::new("object_key", "objectKey"),
            ],
            payload_file_name: "payload.bin".to_string(),
            metadata_file_name: "metadata.tsv".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventsKind {
    #[default]
    Queue,
    Interval,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EventsConfig {
    pub kind: EventsKind,
    pub interval_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            kind: EventsKind::Queue,
            interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    #[default]
    Log,
    Webhook,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NotifyConfig {
    pub kind: NotifyKind,
    pub webhook_url: Option<String>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), AppConfigError> {
        let build = &self.build;
        if build.fetch_concurrency == 0 {
            return Err(invalid("build.fetch_concurrency", "must be at least 1"));
        }
        if build.set_query_workers == 0 {
            return Err(invalid("build.set_query_workers", "must be at least 1"));
        }
        if build.set_query_queue_capacity == 0 {
            return Err(invalid("build.set_query_queue_capacity", "must be at least 1"));
        }
        if build.fetch_rate_per_sec == Some(0) {
            return Err(invalid("build.fetch_rate_per_sec", "must be positive when set"));
        }
        if build.bundle_building_check_secs == 0 {
            return Err(invalid("build.bundle_building_check_secs", "must be positive"));
        }
        if build.columns.is_empty() {
            return Err(invalid("build.columns", "at least one column is required"));
        }
        if self.index.page_size == 0 {
            return Err(invalid("index.page_size", "must be at least 1"));
        }
        if self.storage.backend == ObjectBackend::Http && self.storage.base_url.is_none() {
            return Err(invalid(
                "storage.base_url",
                "required when storage.backend = \"http\"",
            ));
        }
        if self.notify.kind == NotifyKind::Webhook && self.notify.webhook_url.is_none() {
            return Err(invalid(
                "notify.webhook_url",
                "required when notify.kind = \"webhook\"",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> AppConfigError {
    AppConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Load configuration, lowest precedence first: defaults, `/etc`, XDG config,
/// `./config/settings.toml`, `$ARCHIVIST_CONFIG_FILE`, `ARCHIVIST__*` env vars.
pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let etc_dir = env::var_os(ETC_DIR_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ETC_DIR));
    let etc_file = etc_dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME);
    let xdg_file = project_dirs()?.config_dir().join(SETTINGS_FILE_NAME);

    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .add_source(File::from(etc_file).required(false))
        .add_source(File::from(xdg_file).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_FILE).required(false));

    if let Some(path) = env::var_os(CONFIG_FILE_VAR) {
        builder = builder.add_source(File::from(PathBuf::from(path)).required(true));
    }

    let cfg: AppConfig = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", APP_DIR_NAME, APP_DIR_NAME).ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig::default(),
            storage: StorageConfig {
                path: PathBuf::from("/tmp/archivist"),
                backend: ObjectBackend::Fs,
                root: None,
                base_url: None,
                blob_prefix: StorageConfig::default_blob_prefix(),
                archive_prefix: StorageConfig::default_archive_prefix(),
            },
            database: DatabaseConfig::default(),
            index: IndexConfig::default(),
            build: BuildConfig::default(),
            events: EventsConfig::default(),
            notify: NotifyConfig::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        let cfg = base_config();
        cfg.validate().expect("defaults are valid");
        assert!(cfg.database.is_memory());
        assert_eq!(cfg.build.columns.len(), 3);
    }

    #[test]
    fn http_backend_requires_base_url() {
        let mut cfg = base_config();
        cfg.storage.backend = ObjectBackend::Http;
        let err = cfg.validate().expect_err("missing base url");
        assert!(matches!(
            err,
            AppConfigError::Invalid {
                field: "storage.base_url",
                ..
            }
        ));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut cfg = base_config();
        cfg.build.set_query_workers = 0;
        assert!(cfg.validate().is_err());
        let mut cfg = base_config();
        cfg.build.fetch_rate_per_sec = Some(0);
        assert!(cfg.validate().is_err());
    }
}
