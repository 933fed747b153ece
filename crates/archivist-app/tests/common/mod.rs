#![allow(dead_code)]

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use archivist_app::config::ColumnConfig;
use archivist_app::paths::AppPaths;
use archivist_app::pipeline::TsvRowEncoder;
use archivist_app::services::{
    BuildContext, BuildOptions, ElasticIndex, FsObjectStore, LogNotifier, MemoryArchiveStore,
    PipelineLauncher, RetryPolicy,
};
use flate2::read::GzDecoder;
use reqwest::{Client, Url};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub struct Harness {
    pub _tmp: TempDir,
    pub data_dir: PathBuf,
    pub objects_dir: PathBuf,
    pub store: Arc<MemoryArchiveStore>,
    pub objects: Arc<FsObjectStore>,
    pub launcher: Arc<PipelineLauncher>,
}

pub fn hit(id: &str, key: &str, updated: &str) -> Value {
    json!({
        "_id": format!("doc-{id}"),
        "_source": { "id": id, "objectKey": key, "lastUpdated": updated }
    })
}

pub async fn mount_corpus(server: &MockServer, hits: Vec<Value>) {
    mount_paced_corpus(server, hits, Duration::ZERO).await;
}

/// Like [`mount_corpus`], but every scroll continuation answers after `delay`,
/// so a build stalls once the first page is consumed.
pub async fn mount_paced_corpus(server: &MockServer, hits: Vec<Value>, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/records/_search"))
        .and(body_partial_json(json!({ "size": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": { "hits": [] },
            "aggregations": {
                "record_count": { "value": hits.len() as f64 },
                "max_updated": { "value": 1_700_000_000_000.0 }
            }
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/records/_search"))
        .and(query_param("scroll", "1m"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_scroll_id": "scroll-1",
            "hits": { "hits": hits }
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "_scroll_id": "scroll-1",
                    "hits": { "hits": [] }
                }))
                .set_delay(delay),
        )
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true })))
        .mount(server)
        .await;
}

pub async fn mount_set(server: &MockServer, set_id: &str, ids: &[&str]) {
    Mock::given(method("GET"))
        .and(path(format!("/sets/_doc/{set_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": set_id,
            "found": true,
            "_source": {
                "ids": ids,
                "sqon": { "op": "in", "content": { "field": "id", "value": ids } },
                "size": ids.len(),
            }
        })))
        .mount(server)
        .await;
}

pub fn harness(server: &MockServer) -> Harness {
    let tmp = TempDir::new().unwrap();
    let data_dir = tmp.path().join("data");
    let objects_dir = tmp.path().join("objects");
    fs::create_dir_all(objects_dir.join("blobs")).unwrap();

    let options = BuildOptions {
        retry: RetryPolicy::none(),
        ..BuildOptions::default()
    };
    let index = ElasticIndex::builder()
        .client(Client::new())
        .base_url(Url::parse(&server.uri()).unwrap())
        .index("records")
        .sets_index("sets")
        .retry(options.retry)
        .build();
    let store = Arc::new(MemoryArchiveStore::new());
    let objects = Arc::new(FsObjectStore::builder().root(objects_dir.clone()).build());
    let columns = vec![
        ColumnConfig::new("id", "id"),
        ColumnConfig::new("object_key", "objectKey"),
    ];
    let ctx = BuildContext {
        index: Arc::new(index),
        objects: objects.clone(),
        store: store.clone(),
        notifier: Arc::new(LogNotifier),
        encoder: Arc::new(TsvRowEncoder::new(&columns)),
        paths: AppPaths::new(&data_dir).unwrap(),
        limiter: None,
        options,
    };
    Harness {
        _tmp: tmp,
        data_dir,
        objects_dir,
        store,
        objects,
        launcher: Arc::new(PipelineLauncher::new(Arc::new(ctx))),
    }
}

pub fn write_blob(objects_dir: &Path, key: &str, bytes: &[u8]) {
    fs::write(objects_dir.join("blobs").join(key), bytes).unwrap();
}

pub fn unpack(path: &Path) -> Vec<(String, Vec<u8>)> {
    let file = fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            (name, bytes)
        })
        .collect()
}

pub fn bundles_left(data_dir: &Path) -> usize {
    fs::read_dir(data_dir.join("bundles"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

