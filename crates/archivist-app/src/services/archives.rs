//! Archive metadata persistence.
//!
//! `(type, hash_info)` is unique; inserts that collide report
//! [`InsertOutcome::Conflict`] instead of failing so the resolver can decide.

use std::cmp::Ordering;
use std::collections::HashMap;

use archivist_server::{
    Archive, ArchiveStatus, ArchiveType, ListParams, Page, SortDirection, SortField,
};
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::DatabaseConfig;

const ARCHIVE_COLUMNS: &str = "a.id, a.status, a.type, a.hash_info, a.object_id, a.created_at, \
     a.num_of_samples, COALESCE(m.num_of_downloads, 0) AS num_of_downloads";
const ARCHIVE_FROM: &str = "archive a LEFT JOIN archive_meta m ON m.archive_id = a.id";

const SCHEMA_STATEMENTS: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS archive (
        id UUID PRIMARY KEY,
        status TEXT NOT NULL,
        type TEXT NOT NULL,
        hash_info TEXT NOT NULL,
        object_id TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        num_of_samples BIGINT NOT NULL DEFAULT 0,
        CONSTRAINT archive_type_hash_info_key UNIQUE (type, hash_info)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS archive_meta (
        archive_id UUID PRIMARY KEY REFERENCES archive (id),
        num_of_downloads BIGINT NOT NULL DEFAULT 0,
        num_of_samples BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS archive_type_status_created_idx \
     ON archive (type, status, created_at DESC)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("archive {id} not found")]
    NotFound { id: Uuid },
    #[error("stored archive row is invalid: {reason}")]
    Corrupt { reason: String },
}

/// Result of attempting to insert a new archive row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Archive),
    /// A row with the same `(type, hash_info)` already exists.
    Conflict,
}

/// The `(status, created_at)` generation a conditional update expects to
/// find. A restart bumps `created_at`, so runs of an older generation lose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowVersion {
    pub status: ArchiveStatus,
    pub created_at: DateTime<Utc>,
}

impl RowVersion {
    pub fn of(archive: &Archive) -> Self {
        Self {
            status: archive.status,
            created_at: archive.created_at,
        }
    }
}

/// Postgres keeps microseconds; compare and store at that precision.
fn db_instant(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(6)
}

#[async_trait::async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn insert(&self, archive: &Archive) -> Result<InsertOutcome, StoreError>;

    async fn find_by_hash(
        &self,
        archive_type: ArchiveType,
        hash_info: &str,
    ) -> Result<Option<Archive>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Archive>, StoreError>;

    /// Overwrite status, object id, creation time and sample count, but only
    /// while the row still matches `expected`. Returns `false` when another
    /// writer got there first or the row is gone.
    async fn update(&self, archive: &Archive, expected: RowVersion) -> Result<bool, StoreError>;

    async fn list(&self, params: &ListParams) -> Result<Page<Archive>, StoreError>;

    /// Newest `COMPLETE` archive of `archive_type`.
    async fn latest_complete(
        &self,
        archive_type: ArchiveType,
    ) -> Result<Option<Archive>, StoreError>;

    async fn record_download(&self, id: Uuid) -> Result<(), StoreError>;
}

/// PostgreSQL implementation of [`ArchiveStore`].
#[derive(Debug, Clone)]
pub struct PgArchiveStore {
    pool: Pool<Postgres>,
}

impl PgArchiveStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.url)
            .await?;
        let store = Self::new(pool);
        if cfg.bootstrap_schema {
            store.ensure_schema().await?;
        }
        Ok(store)
    }

    /// Idempotent `CREATE ... IF NOT EXISTS` bootstrap.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("archive schema ensured");
        Ok(())
    }

    fn order_clause(params: &ListParams) -> String {
        let column = match params.sort_field {
            SortField::CreatedAt => "a.created_at",
            SortField::NumOfSamples => "a.num_of_samples",
            SortField::NumOfDownloads => "num_of_downloads",
            SortField::Status => "a.status",
        };
        let direction = match params.sort_dir {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        format!("ORDER BY {column} {direction}, a.id ASC")
    }
}

fn archive_from_row(row: &PgRow) -> Result<Archive, StoreError> {
    let status: String = row.try_get("status")?;
    let archive_type: String = row.try_get("type")?;
    Ok(Archive {
        id: row.try_get("id")?,
        status: status.parse().map_err(|_| StoreError::Corrupt {
            reason: format!("unknown status `{status}`"),
        })?,
        archive_type: archive_type.parse().map_err(|_| StoreError::Corrupt {
            reason: format!("unknown type `{archive_type}`"),
        })?,
        hash_info: row.try_get("hash_info")?,
        object_id: row.try_get("object_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        num_of_samples: row.try_get("num_of_samples")?,
        num_of_downloads: row.try_get("num_of_downloads")?,
    })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl ArchiveStore for PgArchiveStore {
    async fn insert(&self, archive: &Archive) -> Result<InsertOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO archive (id, status, type, hash_info, object_id, created_at, num_of_samples)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(archive.id)
        .bind(archive.status.as_ref())
        .bind(archive.archive_type.as_ref())
        .bind(&archive.hash_info)
        .bind(&archive.object_id)
        .bind(db_instant(archive.created_at))
        .bind(archive.num_of_samples)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::debug!(hash_info = %archive.hash_info, "archive insert hit unique constraint");
                return Ok(InsertOutcome::Conflict);
            }
            Err(other) => return Err(StoreError::Database(other)),
        }

        sqlx::query(
            r#"
            INSERT INTO archive_meta (archive_id, num_of_downloads, num_of_samples)
            VALUES ($1, 0, $2)
            ON CONFLICT (archive_id) DO NOTHING
            "#,
        )
        .bind(archive.id)
        .bind(archive.num_of_samples)
        .execute(&self.pool)
        .await?;

        Ok(InsertOutcome::Inserted(Archive {
            created_at: db_instant(archive.created_at),
            ..archive.clone()
        }))
    }

    async fn find_by_hash(
        &self,
        archive_type: ArchiveType,
        hash_info: &str,
    ) -> Result<Option<Archive>, StoreError> {
        let sql = format!(
            "SELECT {ARCHIVE_COLUMNS} FROM {ARCHIVE_FROM} WHERE a.type = $1 AND a.hash_info = $2"
        );
        let row = sqlx::query(&sql)
            .bind(archive_type.as_ref())
            .bind(hash_info)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(archive_from_row).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Archive>, StoreError> {
        let sql = format!("SELECT {ARCHIVE_COLUMNS} FROM {ARCHIVE_FROM} WHERE a.id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(archive_from_row).transpose()
    }

    async fn update(&self, archive: &Archive, expected: RowVersion) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE archive
            SET status = $2, object_id = $3, created_at = $4, num_of_samples = $5
            WHERE id = $1 AND status = $6 AND created_at = $7
            "#,
        )
        .bind(archive.id)
        .bind(archive.status.as_ref())
        .bind(&archive.object_id)
        .bind(db_instant(archive.created_at))
        .bind(archive.num_of_samples)
        .bind(expected.status.as_ref())
        .bind(db_instant(expected.created_at))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE archive_meta SET num_of_samples = $2 WHERE archive_id = $1")
            .bind(archive.id)
            .bind(archive.num_of_samples)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn list(&self, params: &ListParams) -> Result<Page<Archive>, StoreError> {
        debug_assert!(params.size > 0);
        let filter = "WHERE a.type = $1 \
             AND ($2::text IS NULL OR a.status = $2) \
             AND ($3::uuid IS NULL OR a.id = $3)";
        let status = params.status.map(|status| status.as_ref().to_string());

        let count_sql = format!("SELECT COUNT(*) AS total FROM {ARCHIVE_FROM} {filter}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(params.archive_type.as_ref())
            .bind(&status)
            .bind(params.id)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let page_sql = format!(
            "SELECT {ARCHIVE_COLUMNS} FROM {ARCHIVE_FROM} {filter} {} LIMIT $4 OFFSET $5",
            Self::order_clause(params)
        );
        let rows = sqlx::query(&page_sql)
            .bind(params.archive_type.as_ref())
            .bind(&status)
            .bind(params.id)
            .bind(to_i64(params.size))
            .bind(to_i64(params.offset))
            .fetch_all(&self.pool)
            .await?;

        let content = rows
            .iter()
            .map(archive_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            content,
            offset: params.offset,
            size: params.size,
            total: u64::try_from(total).unwrap_or(0),
        })
    }

    async fn latest_complete(
        &self,
        archive_type: ArchiveType,
    ) -> Result<Option<Archive>, StoreError> {
        let sql = format!(
            "SELECT {ARCHIVE_COLUMNS} FROM {ARCHIVE_FROM} \
             WHERE a.type = $1 AND a.status = $2 \
             ORDER BY a.created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(archive_type.as_ref())
            .bind(ArchiveStatus::Complete.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(archive_from_row).transpose()
    }

    async fn record_download(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO archive_meta (archive_id, num_of_downloads, num_of_samples)
            SELECT id, 1, num_of_samples FROM archive WHERE id = $1
            ON CONFLICT (archive_id)
            DO UPDATE SET num_of_downloads = archive_meta.num_of_downloads + 1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }
}

/// In-process store selected by `database.url = "memory"`.
#[derive(Debug, Default)]
pub struct MemoryArchiveStore {
    inner: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<Uuid, Archive>,
    by_hash: HashMap<(ArchiveType, String), Uuid>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row, newest first.
    pub async fn snapshot(&self) -> Vec<Archive> {
        let state = self.inner.read().await;
        let mut rows: Vec<Archive> = state.rows.values().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }
}

fn compare(a: &Archive, b: &Archive, field: SortField) -> Ordering {
    match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::NumOfSamples => a.num_of_samples.cmp(&b.num_of_samples),
        SortField::NumOfDownloads => a.num_of_downloads.cmp(&b.num_of_downloads),
        SortField::Status => a.status.as_ref().cmp(b.status.as_ref()),
    }
}

#[async_trait::async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn insert(&self, archive: &Archive) -> Result<InsertOutcome, StoreError> {
        let mut state = self.inner.write().await;
        let key = (archive.archive_type, archive.hash_info.clone());
        if state.by_hash.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }
        state.by_hash.insert(key, archive.id);
        state.rows.insert(archive.id, archive.clone());
        Ok(InsertOutcome::Inserted(archive.clone()))
    }

    async fn find_by_hash(
        &self,
        archive_type: ArchiveType,
        hash_info: &str,
    ) -> Result<Option<Archive>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .by_hash
            .get(&(archive_type, hash_info.to_string()))
            .and_then(|id| state.rows.get(id))
            .cloned())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Archive>, StoreError> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn update(&self, archive: &Archive, expected: RowVersion) -> Result<bool, StoreError> {
        let mut state = self.inner.write().await;
        let Some(row) = state.rows.get_mut(&archive.id) else {
            return Ok(false);
        };
        if RowVersion::of(row) != expected {
            return Ok(false);
        }
        row.status = archive.status;
        row.object_id = archive.object_id.clone();
        row.created_at = archive.created_at;
        row.num_of_samples = archive.num_of_samples;
        Ok(true)
    }

    async fn list(&self, params: &ListParams) -> Result<Page<Archive>, StoreError> {
        let state = self.inner.read().await;
        let mut matching: Vec<Archive> = state
            .rows
            .values()
            .filter(|a| a.archive_type == params.archive_type)
            .filter(|a| params.status.is_none_or(|status| a.status == status))
            .filter(|a| params.id.is_none_or(|id| a.id == id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            let ordering = compare(a, b, params.sort_field);
            let ordering = match params.sort_dir {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            ordering.then_with(|| a.id.cmp(&b.id))
        });
        let total = matching.len() as u64;
        let content = matching
            .into_iter()
            .skip(params.offset)
            .take(params.size)
            .collect();
        Ok(Page {
            content,
            offset: params.offset,
            size: params.size,
            total,
        })
    }

    async fn latest_complete(
        &self,
        archive_type: ArchiveType,
    ) -> Result<Option<Archive>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .rows
            .values()
            .filter(|a| a.archive_type == archive_type && a.status == ArchiveStatus::Complete)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn record_download(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        let row = state.rows.get_mut(&id).ok_or(StoreError::NotFound { id })?;
        row.num_of_downloads += 1;
        Ok(())
    }
}
