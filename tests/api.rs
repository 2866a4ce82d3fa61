//! API endpoint integration tests

use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use switchboard_gateway::Gateway;
use switchboard_gateway::api;
use tower::ServiceExt;

mod common;
use common::{echo_gateway, live_config};

async fn send(gateway: &Gateway, request: Request<Body>) -> (StatusCode, Value) {
    let response = api::router(gateway.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (gateway, _, _) = echo_gateway(Duration::ZERO).await;
    let (status, json) = send(&gateway, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_without_bridge() {
    let (gateway, _, _) = echo_gateway(Duration::ZERO).await;
    let (status, json) = send(&gateway, get("/ready")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["checks"]["bridge"]["status"], "unavailable");
    assert_eq!(json["checks"]["cron"]["status"], "unavailable");
}

#[tokio::test]
async fn test_ready_waits_for_host() {
    let gateway = Gateway::new(live_config()).await.unwrap();
    let (status, json) = send(&gateway, get("/ready")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["checks"]["bridge"]["status"], "waiting");
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_list_lanes() {
    let (gateway, _, _) = echo_gateway(Duration::ZERO).await;
    let (status, json) = send(&gateway, get("/api/lanes")).await;

    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["lane"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["cron", "main", "subagent"]);
}

#[tokio::test]
async fn test_set_lane_concurrency() {
    let (gateway, _, _) = echo_gateway(Duration::ZERO).await;

    let (status, json) = send(
        &gateway,
        with_json("PUT", "/api/lanes/main", &json!({"maxConcurrent": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["lane"], "main");
    assert_eq!(json["maxConcurrent"], 2);
    assert_eq!(gateway.lanes().concurrency("main"), 2);
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    let (gateway, _, _) = echo_gateway(Duration::ZERO).await;

    let (status, json) = send(
        &gateway,
        with_json("PUT", "/api/lanes/main", &json!({"maxConcurrent": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "invalid_concurrency");
    assert_eq!(gateway.lanes().concurrency("main"), 4);
}

#[tokio::test]
async fn test_bridge_clients_when_disabled() {
    let (gateway, _, _) = echo_gateway(Duration::ZERO).await;
    let (status, json) = send(&gateway, get("/api/bridge/clients")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_cron_job_lifecycle() {
    let (gateway, _, outbox) = echo_gateway(Duration::ZERO).await;

    let (status, job) = send(
        &gateway,
        with_json(
            "POST",
            "/api/cron/jobs",
            &json!({
                "name": "digest",
                "schedule": {"kind": "cron", "expr": "0 9 * * *"},
                "payload": {"channel": "telegram", "chatId": "99", "text": "daily digest"},
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["name"], "digest");
    assert!(job["state"]["nextRunAtMs"].is_u64());
    let id = job["id"].as_str().unwrap().to_string();

    let (status, jobs) = send(&gateway, get("/api/cron/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().unwrap().len(), 1);

    let run = Request::builder()
        .method("POST")
        .uri(format!("/api/cron/jobs/{id}/run"))
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&gateway, run).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(
        outbox.sent(),
        vec![("99".to_string(), "echo: daily digest".to_string())]
    );

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/api/cron/jobs/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&gateway, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let missing = Request::builder()
        .method("DELETE")
        .uri(format!("/api/cron/jobs/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, json) = send(&gateway, missing).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_invalid_cron_expression() {
    let (gateway, _, _) = echo_gateway(Duration::ZERO).await;

    let (status, json) = send(
        &gateway,
        with_json(
            "POST",
            "/api/cron/jobs",
            &json!({"name": "bad", "schedule": {"kind": "cron", "expr": "not a cron"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "cron_error");
}

#[tokio::test]
async fn test_interval_out_of_range() {
    let (gateway, _, _) = echo_gateway(Duration::ZERO).await;

    let (status, json) = send(
        &gateway,
        with_json(
            "POST",
            "/api/cron/jobs",
            &json!({"name": "forever", "schedule": {"kind": "every", "everyMs": u64::MAX}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "cron_error");
    assert!(gateway.cron().list().is_empty());
}
