use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

use crate::db::Ledger;
use crate::queue::QueueHandle;
use crate::recovery::RecoveryScanner;

#[derive(Clone)]
pub struct ApiState {
    pub queue: QueueHandle,
    pub ledger: Arc<dyn Ledger>,
    pub scanner: Arc<RecoveryScanner>,
}

#[derive(Debug, Serialize)]
pub struct Pong {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub queued: usize,
    pub failed_attempts: usize,
    pub last_block: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Rescan {
    pub enqueued: usize,
}

type ApiError = (StatusCode, String);

fn internal<E: std::fmt::Debug>(e: E) -> ApiError {
    error!("API request failed: {:?}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/status", get(status))
        .route("/rescan", post(rescan))
        .with_state(state)
}

pub async fn serve(port: u16, state: ApiState) -> eyre::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state).into_make_service()).await?;

    Ok(())
}

async fn ping() -> Json<Pong> {
    Json(Pong { message: "pong" })
}

async fn status(State(state): State<ApiState>) -> Result<Json<Status>, ApiError> {
    let failed_attempts = state.ledger.all_failed_attempts().await.map_err(internal)?.len();
    let last_block = state.ledger.latest_persisted_block().await.map_err(internal)?;
    Ok(Json(Status { queued: state.queue.depth(), failed_attempts, last_block }))
}

async fn rescan(State(state): State<ApiState>) -> Result<Json<Rescan>, ApiError> {
    let report = state.scanner.run().await.map_err(internal)?;
    info!("Manual rescan up to block {} queued {} deposits", report.head, report.enqueued);
    Ok(Json(Rescan { enqueued: report.enqueued }))
}
