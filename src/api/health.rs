//! Health check endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::gateway::Gateway;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

/// Individual readiness checks
#[derive(Serialize)]
pub struct ReadinessChecks {
    pub bridge: CheckResult,
    pub cron: CheckResult,
}

/// Result of a single health check
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn waiting(message: impl Into<String>) -> Self {
        Self {
            status: "waiting",
            message: Some(message.into()),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: "unavailable",
            message: Some(message.into()),
        }
    }
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - is a host attached and cron running?
///
/// A disabled bridge or cron counts as ready; an enabled bridge with no
/// host connected does not.
async fn ready(State(gateway): State<Gateway>) -> (StatusCode, Json<ReadinessResponse>) {
    let bridge = check_bridge(&gateway);
    let cron = check_cron(&gateway);

    let all_ok = bridge.status != "waiting" && cron.status != "waiting";
    let (status, http_status) = if all_ok {
        ("ok", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        http_status,
        Json(ReadinessResponse {
            status,
            checks: ReadinessChecks { bridge, cron },
        }),
    )
}

fn check_bridge(gateway: &Gateway) -> CheckResult {
    let bridge = gateway.bridge();
    if !bridge.is_enabled() {
        return CheckResult::unavailable("bridge disabled");
    }
    if bridge.list_connected().is_empty() {
        CheckResult::waiting("no host connected")
    } else {
        CheckResult::ok()
    }
}

fn check_cron(gateway: &Gateway) -> CheckResult {
    if !gateway.config().cron.enabled {
        CheckResult::unavailable("cron disabled")
    } else if gateway.cron().is_running() {
        CheckResult::ok()
    } else {
        CheckResult::waiting("cron not started")
    }
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Build readiness router
pub fn ready_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .with_state(gateway)
}
