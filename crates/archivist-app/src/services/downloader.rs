use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use futures_util::StreamExt;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::pipeline::Record;
use crate::services::index::{IndexError, RecordStream};
use crate::services::object_store::{ObjectStore, ObjectStoreError, namespaced_key};
use crate::services::retry::RetryPolicy;

pub type BlobRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Records paired with their blob bytes, in completion order.
pub type FetchedStream = Pin<Box<dyn Stream<Item = Result<(Record, Bytes), DownloadError>> + Send>>;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("failed to fetch blob `{key}` for record {record_id}: {source}")]
    Blob {
        record_id: String,
        key: String,
        #[source]
        source: ObjectStoreError,
    },
}

/// Direct limiter allowing `per_second` blob fetches, or `None` when unset.
pub fn blob_rate_limiter(per_second: Option<u32>) -> Option<Arc<BlobRateLimiter>> {
    let per_second = NonZeroU32::new(per_second?)?;
    Some(Arc::new(RateLimiter::direct(Quota::per_second(per_second))))
}

/// Fetches each record's blob with bounded concurrency.
#[derive(Clone, bon::Builder)]
pub struct RecordDownloader {
    objects: Arc<dyn ObjectStore>,
    #[builder(into)]
    blob_prefix: String,
    #[builder(default = 8)]
    concurrency: usize,
    #[builder(default)]
    retry: RetryPolicy,
    limiter: Option<Arc<BlobRateLimiter>>,
}

impl RecordDownloader {
    pub fn fetch_all(&self, records: RecordStream) -> FetchedStream {
        debug_assert!(self.concurrency > 0);
        let this = self.clone();
        let fetched = records
            .map(move |item| {
                let this = this.clone();
                async move {
                    let record = item?;
                    let bytes = this.fetch_blob(&record).await?;
                    Ok((record, bytes))
                }
            })
            .buffer_unordered(self.concurrency.max(1));
        Box::pin(fetched)
    }

    async fn fetch_blob(&self, record: &Record) -> Result<Bytes, DownloadError> {
        let key = namespaced_key(&self.blob_prefix, &record.blob_key);
        let attempt = {
            let objects = self.objects.clone();
            let limiter = self.limiter.clone();
            let key = key.clone();
            move || {
                let objects = objects.clone();
                let limiter = limiter.clone();
                let key = key.clone();
                async move {
                    if let Some(limiter) = limiter {
                        limiter.until_ready().await;
                    }
                    let mut stream = objects.get(&key).await?;
                    let mut buf = BytesMut::new();
                    while let Some(chunk) = stream.next().await {
                        buf.extend_from_slice(&chunk?);
                    }
                    Ok::<_, ObjectStoreError>(buf.freeze())
                }
            }
        };

        attempt
            .retry(self.retry.backoff())
            .sleep(sleep)
            .when(ObjectStoreError::is_transient)
            .notify(|err: &ObjectStoreError, delay: Duration| {
                warn!(
                    stage = "fetch_blob",
                    record_id = %record.id,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying blob fetch"
                );
            })
            .await
            .map_err(|source| DownloadError::Blob {
                record_id: record.id.clone(),
                key,
                source,
            })
    }
}
