//! Cron job endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use super::ApiError;
use crate::cron::{CronJob, CronJobCreate, RunStatus};
use crate::gateway::Gateway;

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub status: RunStatus,
}

async fn list_jobs(State(gateway): State<Gateway>) -> Json<Vec<CronJob>> {
    Json(gateway.cron().list())
}

async fn create_job(
    State(gateway): State<Gateway>,
    Json(req): Json<CronJobCreate>,
) -> Result<(StatusCode, Json<CronJob>), ApiError> {
    let job = gateway.cron().add(req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn delete_job(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    gateway.cron().remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run a job now and wait for it to finish
async fn run_job(
    State(gateway): State<Gateway>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let status = gateway.cron().run_now(&id).await?;
    Ok(Json(RunResponse { status }))
}

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", delete(delete_job))
        .route("/jobs/{id}/run", post(run_job))
        .with_state(gateway)
}
