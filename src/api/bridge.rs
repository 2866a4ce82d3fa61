//! Bridge connection listing

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::bridge::ClientSummary;
use crate::gateway::Gateway;

async fn list_clients(State(gateway): State<Gateway>) -> Json<Vec<ClientSummary>> {
    Json(gateway.bridge().list_connected())
}

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/clients", get(list_clients))
        .with_state(gateway)
}
