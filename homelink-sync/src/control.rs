//! HTTP control API.
//!
//! | route               | body                       | success                     |
//! |---------------------|----------------------------|-----------------------------|
//! | `POST /api/control` | `{type, index?, state}`    | `{success, path, value}`    |
//! | `GET  /api/status`  |                            | full state document         |
//! | `GET  /api/health`  |                            | hub counters + connections  |
//!
//! Hub and store failures answer 500 with `{"error", "kind"}`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use homelink_core::MutationRequest;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::connection::ConnectionInfo;
use crate::error::BridgeError;
use crate::hub::{Hub, HubStats};

/// Build the control router around a hub.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/control", post(control_handler))
        .route("/api/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

/// Serve the control API until the listener fails.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>) -> Result<(), BridgeError> {
    log::info!("Control API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(hub)).await?;
    Ok(())
}

/// Serve the control API until `shutdown` resolves.
pub async fn serve_with_shutdown(
    listener: TcpListener,
    hub: Arc<Hub>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), BridgeError> {
    log::info!("Control API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Body of a successful `POST /api/control`.
#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub path: String,
    pub value: Value,
    pub revision: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub store_available: bool,
    pub stats: HubStats,
    pub connections: Vec<ConnectionInfo>,
}

/// A hub error rendered as a 500 response.
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

async fn status_handler(State(hub): State<Arc<Hub>>) -> Result<Json<Value>, ApiError> {
    let snapshot = hub.snapshot().await.map_err(|e| {
        log::error!("Status read failed: {e}");
        e
    })?;
    Ok(Json((*snapshot).clone()))
}

async fn control_handler(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<MutationRequest>,
) -> Result<Json<ControlResponse>, ApiError> {
    let ack = hub.accept_mutation(&req).await?;
    Ok(Json(ControlResponse {
        success: true,
        path: ack.path.to_string(),
        value: ack.value,
        revision: ack.revision,
    }))
}

async fn health_handler(State(hub): State<Arc<Hub>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        store_available: hub.store().is_available(),
        stats: hub.stats().await,
        connections: hub.connections().await,
    })
}
