use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::batch::StatusCounts;
use crate::dispatcher::{AgentSnapshot, BatchReport, UnitReport};

/// Read-only view of a running dispatcher, plus its cancel switch.
#[derive(Clone)]
pub struct DashboardState {
    pub report: watch::Receiver<BatchReport>,
    pub agents: watch::Receiver<Vec<AgentSnapshot>>,
    /// Cancelling this token makes the dispatcher drain and stop.
    pub cancel: CancellationToken,
}

#[derive(Serialize)]
struct StatusResponse {
    total: usize,
    finished: usize,
    unfinished: usize,
    counts: StatusCounts,
    cancelled: bool,
    units: Vec<UnitReport>,
}

#[derive(Serialize)]
struct CancelResponse {
    success: bool,
    already_cancelled: bool,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/agents", get(agents_handler))
        .route("/api/cancel", post(cancel_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let report = state.report.borrow().clone();
    Json(StatusResponse {
        total: report.total(),
        finished: report.finished,
        unfinished: report.unfinished,
        counts: report.counts,
        cancelled: state.cancel.is_cancelled(),
        units: report.units,
    })
}

async fn agents_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let agents = state.agents.borrow().clone();
    Json(agents)
}

async fn cancel_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let already_cancelled = state.cancel.is_cancelled();
    if !already_cancelled {
        tracing::info!("Cancellation requested through status server");
        state.cancel.cancel();
    }
    (
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            success: true,
            already_cancelled,
        }),
    )
}
