//! HTTP trigger for ingestion runs.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pulse_core::IngestionResult;
use pulse_sync::IngestionOrchestrator;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "pulse-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<IngestionOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<IngestionOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Body of `POST /ingest`. Missing fields are treated like blank ones.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub site_property: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    service: &'static str,
    collection_path: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/healthz", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "ingestion trigger listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

async fn ingest_handler(State(state): State<Arc<AppState>>, Json(req): Json<IngestRequest>) -> Response {
    let result = state
        .orchestrator
        .run(
            req.site_property.as_deref().unwrap_or_default(),
            req.start_date.as_deref().unwrap_or_default(),
            req.end_date.as_deref().unwrap_or_default(),
        )
        .await;
    ingest_response(result)
}

fn ingest_response(result: IngestionResult) -> Response {
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result)).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        service: CRATE_NAME,
        collection_path: state.orchestrator.collection_path().to_string(),
    })
}
