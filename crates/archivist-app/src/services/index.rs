use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use backon::Retryable;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::Stream;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value, json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::pipeline::{IndexQuery, Record};
use crate::services::retry::RetryPolicy;

const MAX_ERROR_BODY_CHARS: usize = 512;
const AGG_MAX_UPDATED: &str = "max_updated";
const AGG_RECORD_COUNT: &str = "record_count";

/// Aggregate view of the records matching a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorpusStats {
    pub count: u64,
    pub max_updated: Option<DateTime<Utc>>,
}

/// User-saved subset of record ids.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSet {
    pub id: String,
    pub ids: Vec<String>,
    pub sqon: Value,
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
}

pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Record, IndexError>> + Send>>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index request failed during {stage}: {source}")]
    Request {
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("index responded with HTTP {status} during {stage}: {body}")]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[error("failed to decode {stage} response: {source}")]
    Decode {
        stage: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected {stage} response: {reason}")]
    Malformed { stage: &'static str, reason: String },
    #[error("record `{id}` has no `{field}` field")]
    MissingField { id: String, field: String },
    #[error("invalid index url `{url}`")]
    InvalidUrl { url: String },
}

impl IndexError {
    /// Transport failures, 5xx and 429 are retried; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Request { source, .. } => !source.is_builder() && !source.is_decode(),
            IndexError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Read access to the document index.
#[async_trait::async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Count and newest `lastUpdated` over records matching `query`.
    async fn aggregate(&self, query: &IndexQuery) -> Result<CorpusStats, IndexError>;

    /// Page through every record matching `query`.
    fn scroll(&self, query: IndexQuery) -> RecordStream;

    /// Saved set document by id, `None` when absent.
    async fn fetch_set(&self, set_id: &str) -> Result<Option<SavedSet>, IndexError>;
}

/// Elasticsearch-compatible index client.
#[derive(Debug, Clone, bon::Builder)]
pub struct ElasticIndex {
    client: Client,
    base_url: Url,
    #[builder(into)]
    index: String,
    #[builder(into)]
    sets_index: String,
    #[builder(into, default = "id".to_string())]
    id_field: String,
    #[builder(into, default = "lastUpdated".to_string())]
    updated_field: String,
    #[builder(into, default = "objectKey".to_string())]
    blob_key_field: String,
    /// Extra `_source` fields needed by the metadata rows.
    #[builder(default)]
    source_fields: Vec<String>,
    #[builder(default = 500)]
    page_size: usize,
    #[builder(into, default = "1m".to_string())]
    scroll_keep_alive: String,
    #[builder(default)]
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: JsonMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct DocResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<SetSource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetSource {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    sqon: Value,
    size: Option<u64>,
    created_at: Option<DateTime<Utc>>,
}

impl ElasticIndex {
    fn endpoint(&self, path: &str) -> Result<Url, IndexError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path).map_err(|_| IndexError::InvalidUrl {
            url: format!("{}{path}", self.base_url),
        })
    }

    fn projected_fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.id_field.clone(),
            self.blob_key_field.clone(),
            self.updated_field.clone(),
        ];
        for field in &self.source_fields {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }
        fields
    }

    /// Send one JSON request with retries; `Ok(None)` on 404.
    async fn execute(
        &self,
        stage: &'static str,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Option<Value>, IndexError> {
        let attempt = {
            let client = self.client.clone();
            move || {
                let client = client.clone();
                let method = method.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    let mut request = client.request(method, url);
                    if let Some(body) = body.as_ref() {
                        request = request.json(body);
                    }
                    let response = request
                        .send()
                        .await
                        .map_err(|source| IndexError::Request { stage, source })?;
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if !status.is_success() {
                        let mut text = response.text().await.unwrap_or_default();
                        text.truncate(MAX_ERROR_BODY_CHARS);
                        return Err(IndexError::Status {
                            stage,
                            status: status.as_u16(),
                            body: text,
                        });
                    }
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|source| IndexError::Request { stage, source })?;
                    serde_json::from_slice::<Value>(&bytes)
                        .map(Some)
                        .map_err(|source| IndexError::Decode { stage, source })
                }
            }
        };

        attempt
            .retry(self.retry.backoff())
            .sleep(sleep)
            .when(IndexError::is_transient)
            .notify(|err: &IndexError, delay: Duration| {
                warn!(
                    stage,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying index request"
                );
            })
            .await
    }

    async fn execute_required(
        &self,
        stage: &'static str,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Value, IndexError> {
        self.execute(stage, method, url, body)
            .await?
            .ok_or(IndexError::Status {
                stage,
                status: StatusCode::NOT_FOUND.as_u16(),
                body: String::new(),
            })
    }

    fn to_record(&self, hit: Hit) -> Result<Record, IndexError> {
        let id = match hit.source.get(&self.id_field) {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => hit.id,
        };
        let blob_key = match hit.source.get(&self.blob_key_field) {
            Some(Value::String(key)) if !key.is_empty() => key.clone(),
            _ => {
                return Err(IndexError::MissingField {
                    id,
                    field: self.blob_key_field.clone(),
                });
            }
        };
        Ok(Record {
            id,
            blob_key,
            source: hit.source,
        })
    }

    async fn clear_scroll(&self, scroll_id: String) {
        let url = match self.endpoint("_search/scroll") {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "cannot build clear-scroll url");
                return;
            }
        };
        let body = json!({ "scroll_id": [scroll_id] });
        if let Err(err) = self
            .execute("clear_scroll", Method::DELETE, url, Some(body))
            .await
        {
            warn!(error = %err, "failed to clear index scroll context");
        }
    }
}

/// Clears a scroll context that was abandoned mid-iteration.
struct ScrollGuard {
    index: ElasticIndex,
    scroll_id: Option<String>,
}

impl ScrollGuard {
    async fn finish(mut self) {
        if let Some(id) = self.scroll_id.take() {
            self.index.clear_scroll(id).await;
        }
    }
}

impl Drop for ScrollGuard {
    fn drop(&mut self) {
        let Some(id) = self.scroll_id.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let index = self.index.clone();
            handle.spawn(async move { index.clear_scroll(id).await });
        }
    }
}

#[async_trait::async_trait]
impl DocumentIndex for ElasticIndex {
    async fn aggregate(&self, query: &IndexQuery) -> Result<CorpusStats, IndexError> {
        let stage = "aggregate";
        let url = self.endpoint(&format!("{}/_search", self.index))?;
        let body = json!({
            "size": 0,
            "query": query,
            "aggs": {
                AGG_MAX_UPDATED: { "max": { "field": self.updated_field } },
                AGG_RECORD_COUNT: { "value_count": { "field": self.id_field } },
            }
        });
        let response = self
            .execute_required(stage, Method::POST, url, Some(body))
            .await?;
        let aggs = response
            .get("aggregations")
            .ok_or_else(|| IndexError::Malformed {
                stage,
                reason: "missing `aggregations`".to_string(),
            })?;

        let count = aggs
            .pointer(&format!("/{AGG_RECORD_COUNT}/value"))
            .and_then(Value::as_f64)
            .map(|value| value.max(0.0) as u64)
            .unwrap_or(0);
        let max_updated = aggs
            .pointer(&format!("/{AGG_MAX_UPDATED}/value"))
            .and_then(Value::as_f64)
            .and_then(|millis| Utc.timestamp_millis_opt(millis as i64).single());

        debug!(count, ?max_updated, "index aggregation complete");
        Ok(CorpusStats { count, max_updated })
    }

    fn scroll(&self, query: IndexQuery) -> RecordStream {
        let this = self.clone();
        Box::pin(try_stream! {
            let stage = "scroll";
            let first_url = this.endpoint(&format!(
                "{}/_search?scroll={}",
                this.index, this.scroll_keep_alive
            ))?;
            let scroll_url = this.endpoint("_search/scroll")?;
            let mut body = Some(json!({
                "size": this.page_size,
                "query": query,
                "_source": this.projected_fields(),
                "sort": ["_doc"],
            }));
            let mut guard = ScrollGuard { index: this.clone(), scroll_id: None };
            let mut pages = 0usize;

            loop {
                let raw = match body.take() {
                    Some(initial) => {
                        this.execute_required(stage, Method::POST, first_url.clone(), Some(initial))
                            .await?
                    }
                    None => {
                        let scroll_id = guard.scroll_id.clone().ok_or_else(|| IndexError::Malformed {
                            stage,
                            reason: "missing `_scroll_id`".to_string(),
                        })?;
                        let next = json!({
                            "scroll": this.scroll_keep_alive,
                            "scroll_id": scroll_id,
                        });
                        this.execute_required(stage, Method::POST, scroll_url.clone(), Some(next))
                            .await?
                    }
                };
                let page: SearchResponse = serde_json::from_value(raw)
                    .map_err(|source| IndexError::Decode { stage, source })?;
                if let Some(id) = page.scroll_id {
                    guard.scroll_id = Some(id);
                }
                if page.hits.hits.is_empty() {
                    break;
                }
                pages += 1;
                for hit in page.hits.hits {
                    yield this.to_record(hit)?;
                }
            }

            debug!(pages, "index scroll exhausted");
            guard.finish().await;
        })
    }

    async fn fetch_set(&self, set_id: &str) -> Result<Option<SavedSet>, IndexError> {
        let stage = "fetch_set";
        let url = self.endpoint(&format!("{}/_doc/{set_id}", self.sets_index))?;
        let Some(raw) = self.execute(stage, Method::GET, url, None).await? else {
            return Ok(None);
        };
        let doc: DocResponse =
            serde_json::from_value(raw).map_err(|source| IndexError::Decode { stage, source })?;
        if !doc.found {
            return Ok(None);
        }
        let Some(source) = doc.source else {
            return Err(IndexError::Malformed {
                stage,
                reason: format!("set `{set_id}` has no `_source`"),
            });
        };
        let size = source.size.unwrap_or(source.ids.len() as u64);
        Ok(Some(SavedSet {
            id: set_id.to_string(),
            ids: source.ids,
            sqon: source.sqon,
            size,
            created_at: source.created_at,
        }))
    }
}
