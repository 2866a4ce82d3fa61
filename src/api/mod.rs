//! Admin HTTP API for the switchboard gateway

pub mod bridge;
pub mod cron;
pub mod health;
pub mod lanes;

use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;
use crate::{Error, Result};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// Gateway error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::InvalidConcurrency { .. } => (StatusCode::BAD_REQUEST, "invalid_concurrency"),
            Error::Cron(_) => (StatusCode::BAD_REQUEST, "cron_error"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Bridge(_) => (StatusCode::BAD_GATEWAY, "bridge_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = ErrorResponse {
            error: ErrorDetail {
                code,
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Build the router with all routes
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .nest("/api/lanes", lanes::router(gateway.clone()))
        .nest("/api/bridge", bridge::router(gateway.clone()))
        .nest("/api/cron", cron::router(gateway.clone()))
        .merge(health::router())
        .merge(health::ready_router(gateway))
        .layer(TraceLayer::new_for_http())
}

/// Admin API server, bound and ready to serve
pub struct ApiServer {
    gateway: Gateway,
    listener: TcpListener,
}

impl ApiServer {
    /// Bind the admin API on localhost
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn bind(gateway: Gateway, port: u16) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind admin API on {addr}: {e}")))?;
        Ok(Self { gateway, listener })
    }

    /// Address the server is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(addr = %addr, "admin API listening");
        }
        axum::serve(self.listener, router(self.gateway))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::Config(format!("admin API error: {e}")))
    }
}
