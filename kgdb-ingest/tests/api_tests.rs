//! HTTP API integration tests

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use helpers::*;
use http_body_util::BodyExt;
use kgdb_ingest::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

struct TestApp {
    _dir: tempfile::TempDir,
    _upstream: MockUpstream,
    router: Router,
}

async fn create_test_app() -> TestApp {
    let (dir, pool) = create_test_db().await;
    let upstream = MockUpstream::start().await;
    upstream.set_pages(
        "/lit",
        vec![json!({
            "results": [
                {"gene": "PKD1", "pmid": "1"},
                {"gene": "PKD2", "pmid": "2"},
                {"gene": "NOVEL1", "pmid": "3"}
            ],
            "total_pages": 1
        })],
    );
    let config = test_config(vec![("lit", count_source(upstream.url("/lit")))]);
    let authority = Arc::new(StaticAuthority::new(&[
        ("PKD1", "HGNC:9008", &[]),
        ("PKD2", "HGNC:9009", &[]),
    ]));
    let services = test_services(&pool, config, authority);
    let router = kgdb_ingest::build_router(AppState::new(services));

    TestApp {
        _dir: dir,
        _upstream: upstream,
        router,
    }
}

async fn call(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn run_job(app: &TestApp, job: Value) -> Value {
    let (status, body) = call(app, "POST", "/jobs", Some(job)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    for _ in 0..500 {
        let (status, info) = call(app, "GET", &format!("/jobs/{}", job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(info["status"].as_str(), Some("done" | "failed" | "cancelled")) {
            return info;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not finish", job_id);
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app().await;
    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "kgdb-ingest");
    assert!(body.get("last_error").is_none());
}

#[tokio::test]
async fn test_ingest_job_then_read_scores_and_progress() {
    let app = create_test_app().await;

    let info = run_job(&app, json!({"job": "ingest:lit"})).await;
    assert_eq!(info["status"], "done");
    assert_eq!(info["result"]["sources"]["lit"]["added"], 2);
    assert_eq!(info["result"]["scoring"]["genes_scored"], 2);

    let (status, scores) = call(&app, "GET", "/scores?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scores.as_array().unwrap().len(), 2);

    let (status, score) = call(&app, "GET", "/scores/pkd1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(score["hgnc_id"], "HGNC:9008");

    let gene_id = score["gene_id"].as_str().unwrap();
    let (status, by_id) = call(&app, "GET", &format!("/scores/{}", gene_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_id["symbol"], "PKD1");

    let (status, evidence) = call(&app, "GET", &format!("/genes/{}/evidence", gene_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(evidence[0]["source_name"], "lit");

    let (status, progress) = call(&app, "GET", "/progress/lit", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["status"], "completed");

    let (status, all) = call(&app, "GET", "/progress", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 1);

    let (status, reset) = call(&app, "POST", "/progress/lit/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["status"], "idle");
}

#[tokio::test]
async fn test_review_flow_over_http() {
    let app = create_test_app().await;
    run_job(&app, json!({"job": "ingest", "source_name": "lit"})).await;

    let (status, pending) = call(&app, "GET", "/staging", None).await;
    assert_eq!(status, StatusCode::OK);
    let pending = pending.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["cleaned_text"], "NOVEL1");
    let id = pending[0]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        "POST",
        &format!("/staging/{}/approve", id),
        Some(json!({"symbol": "NOVEL1", "hgnc_id": "HGNC:99999", "reviewer": " "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, gene) = call(
        &app,
        "POST",
        &format!("/staging/{}/approve", id),
        Some(json!({"symbol": "NOVEL1", "hgnc_id": "HGNC:99999", "reviewer": "curator"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gene["hgnc_id"], "HGNC:99999");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/staging/{}/reject", id),
        Some(json!({"reviewer": "curator"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    let (status, stats) = call(&app, "GET", "/staging/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["approved"], 1);
    assert_eq!(stats["pending"], 0);
}

#[tokio::test]
async fn test_error_statuses() {
    let app = create_test_app().await;

    let (status, body) = call(&app, "GET", "/scores/NOSUCHGENE", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _) = call(&app, "POST", "/jobs", Some(json!({"job": "reindex"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "POST", "/jobs", Some(json!({"job": "ingest:missing"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let random = uuid::Uuid::new_v4();
    let (status, _) = call(&app, "POST", &format!("/jobs/{}/cancel", random), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "GET", &format!("/staging/{}", random), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
