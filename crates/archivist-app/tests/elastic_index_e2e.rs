use archivist_app::pipeline::IndexQuery;
use archivist_app::services::{DocumentIndex, ElasticIndex, IndexError, RetryPolicy};
use futures_util::TryStreamExt;
use reqwest::{Client, Url};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn index(server: &MockServer, retry: RetryPolicy) -> ElasticIndex {
    ElasticIndex::builder()
        .client(Client::new())
        .base_url(Url::parse(&server.uri()).unwrap())
        .index("records")
        .sets_index("sets")
        .page_size(2)
        .retry(retry)
        .build()
}

fn page(scroll_id: &str, ids: &[&str]) -> serde_json::Value {
    let hits: Vec<_> = ids
        .iter()
        .map(|id| json!({ "_id": id, "_source": { "objectKey": format!("{id}.bin") } }))
        .collect();
    json!({ "_scroll_id": scroll_id, "hits": { "hits": hits } })
}

#[tokio::test]
async fn scroll_walks_every_page_and_clears_context() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records/_search"))
        .and(query_param("scroll", "1m"))
        .and(body_partial_json(json!({ "size": 2, "sort": ["_doc"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(page("s-1", &["a", "b"])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .and(body_partial_json(json!({ "scroll_id": "s-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(page("s-2", &["c"])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_search/scroll"))
        .and(body_partial_json(json!({ "scroll_id": "s-2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(page("s-2", &[])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/_search/scroll"))
        .and(body_partial_json(json!({ "scroll_id": ["s-2"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true })))
        .expect(1)
        .mount(&server)
        .await;

    let records: Vec<_> = index(&server, RetryPolicy::none())
        .scroll(IndexQuery::match_all())
        .try_collect()
        .await
        .unwrap();

    let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c"]);
    assert_eq!(records[2].blob_key, "c.bin");
}

#[tokio::test]
async fn aggregate_reads_count_and_newest_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records/_search"))
        .and(body_partial_json(json!({ "size": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "aggregations": {
                "record_count": { "value": 42.0 },
                "max_updated": { "value": 1_700_000_000_000.0 }
            }
        })))
        .mount(&server)
        .await;

    let stats = index(&server, RetryPolicy::none())
        .aggregate(&IndexQuery::match_all())
        .await
        .unwrap();
    assert_eq!(stats.count, 42);
    assert_eq!(
        stats.max_updated.map(|at| at.timestamp_millis()),
        Some(1_700_000_000_000)
    );
}

#[tokio::test]
async fn aggregate_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/records/_search"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = index(&server, RetryPolicy::new(2, Duration::from_millis(1)))
        .aggregate(&IndexQuery::match_all())
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Status { status: 503, .. }));
}

#[tokio::test]
async fn fetch_set_distinguishes_missing_from_present() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sets/_doc/s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "found": true,
            "_source": { "ids": ["a", "b", "c"], "sqon": { "op": "and" } }
        })))
        .mount(&server)
        .await;

    let index = index(&server, RetryPolicy::none());
    let set = index.fetch_set("s1").await.unwrap().unwrap();
    assert_eq!(set.size, 3);
    assert_eq!(set.sqon, json!({ "op": "and" }));
    assert!(index.fetch_set("s2").await.unwrap().is_none());
}
