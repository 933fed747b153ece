mod common;

use std::sync::Arc;
use std::time::Duration;

use archivist_app::services::{
    ArchiveStore, BuildLauncher, CatalogService, SetQueryDispatcher,
};
use archivist_server::{Archive, ArchiveStatus, build_api_router};
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    response::Response,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::MockServer;

use common::{
    Harness, harness, hit, mount_corpus, mount_paced_corpus, mount_set, unpack, write_blob,
};

async fn call(app: &Router, method: Method, uri: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("request builder should not fail"),
        )
        .await
        .expect("router should respond")
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body must be readable")
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("body must be JSON")
}

async fn wait_for_terminal(h: &Harness, id: Uuid) -> Archive {
    for _ in 0..250 {
        if let Some(archive) = h.store.get(id).await.unwrap() {
            if archive.status != ArchiveStatus::Building {
                return archive;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("archive {id} never left BUILDING");
}

#[tokio::test]
async fn set_query_is_built_listed_and_downloaded() {
    let server = MockServer::start().await;
    mount_set(&server, "s1", &["r1", "r2"]).await;
    mount_corpus(
        &server,
        vec![
            hit("r1", "a.bin", "2023-11-14T22:13:20Z"),
            hit("r2", "b.bin", "2023-11-14T22:13:20Z"),
        ],
    )
    .await;
    let h = harness(&server);
    write_blob(&h.objects_dir, "a.bin", b"alpha");
    write_blob(&h.objects_dir, "b.bin", b"bravo");

    let launcher: Arc<dyn BuildLauncher> = h.launcher.clone();
    let dispatcher = SetQueryDispatcher::spawn(launcher, 1, 4);
    let api = Arc::new(
        CatalogService::builder()
            .store(h.store.clone())
            .objects(h.objects.clone())
            .set_queries(dispatcher.handle())
            .build(),
    );
    let app = build_api_router(api);

    let accepted = call(&app, Method::POST, "/v1/archives/set-query/s1").await;
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let accepted = body_json(accepted).await;
    assert_eq!(accepted["type"], "SET_QUERY");
    assert_eq!(accepted["numOfSamples"], 2);
    let id: Uuid = accepted["id"].as_str().unwrap().parse().unwrap();

    let archive = wait_for_terminal(&h, id).await;
    assert_eq!(archive.status, ArchiveStatus::Complete);

    let fetched = call(&app, Method::GET, &format!("/v1/archives/set-query/{id}")).await;
    assert_eq!(fetched.status(), StatusCode::OK);
    assert_eq!(body_json(fetched).await["status"], "COMPLETE");

    let wrong_type = call(&app, Method::GET, &format!("/v1/archives/all/{id}")).await;
    assert_eq!(wrong_type.status(), StatusCode::NOT_FOUND);

    let download = call(&app, Method::GET, &format!("/v1/files/{id}")).await;
    assert_eq!(download.status(), StatusCode::OK);
    assert_eq!(download.headers()[header::CONTENT_TYPE], "application/gzip");
    let disposition = download.headers()[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains(&format!("{id}.tar.gz")));
    let bytes = body_bytes(download).await;
    let copy = h.objects_dir.join("downloaded.tar.gz");
    std::fs::write(&copy, &bytes).unwrap();
    let entries = unpack(&copy);
    assert_eq!(entries.len(), 2);

    let reused = call(&app, Method::POST, "/v1/archives/set-query/s1").await;
    assert_eq!(reused.status(), StatusCode::OK);
    assert_eq!(body_json(reused).await["id"], id.to_string());

    let listed = call(&app, Method::GET, "/v1/archives/set-query?size=10").await;
    assert_eq!(listed.status(), StatusCode::OK);
    let listed = body_json(listed).await;
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["content"][0]["numOfDownloads"], 1);

    let all = body_json(call(&app, Method::GET, "/v1/archives/all").await).await;
    assert_eq!(all["total"], 0);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn resubmitting_a_set_while_it_builds_conflicts() {
    let server = MockServer::start().await;
    mount_set(&server, "s1", &["r1", "r2"]).await;
    mount_paced_corpus(
        &server,
        vec![
            hit("r1", "a.bin", "2023-11-14T22:13:20Z"),
            hit("r2", "b.bin", "2023-11-14T22:13:20Z"),
        ],
        Duration::from_secs(30),
    )
    .await;
    let h = harness(&server);
    write_blob(&h.objects_dir, "a.bin", b"alpha");
    write_blob(&h.objects_dir, "b.bin", b"bravo");

    let launcher: Arc<dyn BuildLauncher> = h.launcher.clone();
    let dispatcher = SetQueryDispatcher::spawn(launcher, 1, 4);
    let api = Arc::new(
        CatalogService::builder()
            .store(h.store.clone())
            .objects(h.objects.clone())
            .set_queries(dispatcher.handle())
            .build(),
    );
    let app = build_api_router(api);

    let accepted = call(&app, Method::POST, "/v1/archives/set-query/s1").await;
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let again = call(&app, Method::POST, "/v1/archives/set-query/s1").await;
    assert_eq!(again.status(), StatusCode::CONFLICT);

    let rows = h.store.snapshot().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ArchiveStatus::Building);

    dispatcher.shutdown().await;
    let rows = h.store.snapshot().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ArchiveStatus::Cancelled);
}

#[tokio::test]
async fn unknown_set_is_not_found() {
    let server = MockServer::start().await;
    let h = harness(&server);
    let launcher: Arc<dyn BuildLauncher> = h.launcher.clone();
    let dispatcher = SetQueryDispatcher::spawn(launcher, 1, 4);
    let api = Arc::new(
        CatalogService::builder()
            .store(h.store.clone())
            .objects(h.objects.clone())
            .set_queries(dispatcher.handle())
            .build(),
    );
    let app = build_api_router(api);

    let response = call(&app, Method::POST, "/v1/archives/set-query/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(h.store.snapshot().await.is_empty());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn download_of_unfinished_archive_is_unavailable() {
    let server = MockServer::start().await;
    let h = harness(&server);
    let building = Archive::building(archivist_server::ArchiveType::All, "pending", 0);
    h.store.insert(&building).await.unwrap();
    let api = Arc::new(
        CatalogService::builder()
            .store(h.store.clone())
            .objects(h.objects.clone())
            .build(),
    );
    let app = build_api_router(api);

    let response = call(&app, Method::GET, &format!("/v1/files/{}", building.id)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let latest = call(&app, Method::GET, "/v1/files").await;
    assert_eq!(latest.status(), StatusCode::SERVICE_UNAVAILABLE);
}
