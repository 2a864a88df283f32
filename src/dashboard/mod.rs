use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::{preview, BrokerHandle, Job};
use crate::endpoint::Endpoint;
use crate::rpc::{Call, Envelope, Reply, Request};

/// Identity attached to jobs submitted through the dashboard
pub const DASHBOARD_IDENTITY: &str = "dashboard";

#[derive(Clone)]
pub struct DashboardState {
    pub broker: BrokerHandle,
    /// The broker's mailbox; submissions go through it like any other call
    pub inbound: mpsc::Sender<Envelope>,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub payload: String,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct AssignmentView {
    pub worker: Endpoint,
    pub job: String,
}

#[derive(Serialize, Deserialize)]
pub struct JobsResponse {
    /// Pending payload previews in dispatch order
    pub pending: Vec<String>,
    pub assignments: Vec<AssignmentView>,
}

/// Status and submission routes, to be merged into the broker's server.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .layer(cors)
        .with_state(state)
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.broker.metrics().await {
        Some(metrics) => Json(metrics).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "broker stopped").into_response(),
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let Some(snapshot) = state.broker.snapshot().await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "broker stopped").into_response();
    };

    Json(JobsResponse {
        pending: snapshot.pending.iter().map(|p| preview(p)).collect(),
        assignments: snapshot
            .assignments
            .iter()
            .map(|(worker, job)| AssignmentView {
                worker: worker.clone(),
                job: preview(job),
            })
            .collect(),
    })
    .into_response()
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(body): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    if body.payload.is_empty() {
        return rejected(StatusCode::BAD_REQUEST, "payload is empty");
    }

    let request = Request::new(
        Endpoint::new(DASHBOARD_IDENTITY),
        Call::Assign {
            job: Job::new(body.payload.into_bytes()),
        },
    );
    let (envelope, reply_rx) = Envelope::new(request);
    if state.inbound.send(envelope).await.is_err() {
        return rejected(StatusCode::SERVICE_UNAVAILABLE, "broker stopped");
    }

    match reply_rx.await {
        Ok(Reply::Ack) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                accepted: true,
                error: None,
            }),
        ),
        Ok(Reply::Rejected { reason }) => rejected(StatusCode::SERVICE_UNAVAILABLE, &reason),
        Err(_) => rejected(StatusCode::INTERNAL_SERVER_ERROR, "broker dropped the request"),
    }
}

fn rejected(status: StatusCode, reason: &str) -> (StatusCode, Json<SubmitJobResponse>) {
    (
        status,
        Json(SubmitJobResponse {
            accepted: false,
            error: Some(reason.to_string()),
        }),
    )
}
