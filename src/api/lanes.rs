//! Lane inspection and runtime reconfiguration

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;

use super::ApiError;
use crate::gateway::Gateway;
use crate::lanes::LaneSnapshot;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConcurrencyRequest {
    pub max_concurrent: usize,
}

async fn list_lanes(State(gateway): State<Gateway>) -> Json<Vec<LaneSnapshot>> {
    Json(gateway.lane_snapshots())
}

/// Set a lane's ceiling; zero is rejected with 400
async fn set_concurrency(
    State(gateway): State<Gateway>,
    Path(lane): Path<String>,
    Json(req): Json<SetConcurrencyRequest>,
) -> Result<Json<LaneSnapshot>, ApiError> {
    let snapshot = gateway.set_lane_concurrency(&lane, req.max_concurrent)?;
    Ok(Json(snapshot))
}

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/", get(list_lanes))
        .route("/{lane}", put(set_concurrency))
        .with_state(gateway)
}
