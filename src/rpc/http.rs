use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::endpoint::Endpoint;
use crate::error::{HiveError, Result};
use crate::rpc::{Envelope, Reply, Request, Rpc};

pub const RPC_PATH: &str = "/rpc";

/// Largest request body the RPC route accepts unless configured otherwise.
/// Payload and result bytes travel base64-encoded, so the usable size is
/// about three quarters of this.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// JSON-over-HTTP transport: `POST http://<endpoint>/rpc`.
#[derive(Debug, Clone, Default)]
pub struct HttpRpc {
    client: reqwest::Client,
}

impl HttpRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Rpc for HttpRpc {
    async fn call(
        &self,
        endpoint: &Endpoint,
        request: Request,
        timeout: Duration,
    ) -> Result<Reply> {
        let method = request.call.method();
        let url = format!("{}{}", endpoint.base_url(), RPC_PATH);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(endpoint, method, e))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(HiveError::Refused {
                endpoint: endpoint.clone(),
                method,
                reason: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(HiveError::Transport {
                endpoint: endpoint.clone(),
                method,
                reason: format!("HTTP {status}"),
            });
        }

        response
            .json::<Reply>()
            .await
            .map_err(|e| classify(endpoint, method, e))
    }
}

fn classify(endpoint: &Endpoint, method: &'static str, err: reqwest::Error) -> HiveError {
    if err.is_timeout() {
        HiveError::Timeout {
            endpoint: endpoint.clone(),
            method,
        }
    } else {
        HiveError::Transport {
            endpoint: endpoint.clone(),
            method,
            reason: err.to_string(),
        }
    }
}

/// Route exposing a mailbox at [`RPC_PATH`], accepting bodies of up to
/// `max_message_bytes`.
pub fn router(inbound: mpsc::Sender<Envelope>, max_message_bytes: usize) -> Router {
    Router::new()
        .route(RPC_PATH, post(rpc_handler))
        .layer(DefaultBodyLimit::max(max_message_bytes))
        .with_state(inbound)
}

async fn rpc_handler(
    State(inbound): State<mpsc::Sender<Envelope>>,
    Json(request): Json<Request>,
) -> Response {
    let method = request.call.method();
    let (envelope, reply_rx) = Envelope::new(request);

    if inbound.send(envelope).await.is_err() {
        tracing::warn!(method, "Mailbox closed, refusing inbound call");
        return (StatusCode::SERVICE_UNAVAILABLE, "mailbox closed").into_response();
    }

    match reply_rx.await {
        Ok(reply) => Json(reply).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "handler dropped the call").into_response(),
    }
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting HTTP RPC server");

    axum::serve(listener, app.layer(TraceLayer::new_for_http()))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!(addr = %addr, "HTTP RPC server stopped");
    Ok(())
}
