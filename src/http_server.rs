use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, info};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::limit::RequestBodyLimitLayer;

use crate::{
    error::{Result, TransferError},
    models::{
        BeginResponse, ChunkAck, Completion, MessageResponse, RelayStatus, ReplyStatus,
    },
    Config, SessionManager,
};

/// HTTP front of a [`SessionManager`]: `/begin`, `/chunk`, `/end`, `/cancel`
/// and `/status`.
#[derive(Clone)]
pub struct RelayServer {
    relay: SessionManager,
    max_chunk_body: usize,
}

impl RelayServer {
    pub fn new(relay: SessionManager, config: &Config) -> Self {
        Self {
            relay,
            max_chunk_body: config.max_chunk_body,
        }
    }

    pub fn relay(&self) -> &SessionManager {
        &self.relay
    }

    /// Serves until `stop_rx` fires. Open sessions are canceled before the
    /// server drains, which releases any `/chunk` or `/end` still blocked on
    /// a receiver.
    pub async fn start_http_server(
        &self,
        listener: TcpListener,
        mut stop_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("HTTP relay listening on {}", listener.local_addr()?);

        let relay = self.relay.clone();
        axum::serve(listener, self.create_router())
            .with_graceful_shutdown(async move {
                let _ = stop_rx.recv().await;
                info!("shutting down http relay");
                relay.cancel_all().await;
            })
            .await?;

        // sessions begun while the server drained
        self.relay.cancel_all().await;
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/begin", post(handle_begin))
            .route("/chunk", post(handle_chunk))
            .route("/end", post(handle_end))
            .route("/cancel", post(handle_cancel))
            .route("/status", get(handle_status))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(self.max_chunk_body))
            .with_state(self.relay.clone())
    }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let message = match &self {
            TransferError::Validation(m)
            | TransferError::Conservation(m)
            | TransferError::Rejected(m) => m.clone(),
            TransferError::UnknownSession(_) => "Invalid session".to_string(),
            other => other.to_string(),
        };
        debug!("relay request failed: {self}");
        (self.status_code(), Json(MessageResponse::error(message))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct BeginParams {
    host: Option<String>,
    port: Option<String>,
    filename: Option<String>,
    filesize: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    id: Option<String>,
}

impl SessionParams {
    fn id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransferError::Validation("Missing session id".into()))
    }
}

async fn handle_begin(
    State(relay): State<SessionManager>,
    Query(params): Query<BeginParams>,
) -> Result<Json<BeginResponse>> {
    let host = params.host.unwrap_or_default();
    let port: u16 = params
        .port
        .as_deref()
        .and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| TransferError::Validation("Invalid port".into()))?;
    let filename = params
        .filename
        .filter(|f| !f.is_empty())
        .ok_or_else(|| TransferError::Validation("Missing file name".into()))?;
    let filesize: u64 = params
        .filesize
        .as_deref()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| TransferError::Validation("Missing or invalid file size".into()))?;

    let begun = relay.begin(&host, port, &filename, filesize).await?;
    Ok(Json(begun))
}

async fn handle_chunk(
    State(relay): State<SessionManager>,
    Query(params): Query<SessionParams>,
    body: Bytes,
) -> Result<Json<ChunkAck>> {
    let ack = relay.chunk(params.id()?, &body).await?;
    Ok(Json(ack))
}

async fn handle_end(
    State(relay): State<SessionManager>,
    Query(params): Query<SessionParams>,
) -> Result<(StatusCode, Json<Completion>)> {
    let completion = relay.end(params.id()?).await?;
    let code = if completion.is_done() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((code, Json(completion)))
}

async fn handle_cancel(
    State(relay): State<SessionManager>,
    Query(params): Query<SessionParams>,
) -> Result<Json<MessageResponse>> {
    let message = if relay.cancel(params.id()?).await {
        "Canceled"
    } else {
        "No session"
    };
    Ok(Json(MessageResponse::ok(message)))
}

async fn handle_status(State(relay): State<SessionManager>) -> Json<RelayStatus> {
    let sessions = relay.snapshot().await;
    Json(RelayStatus {
        status: ReplyStatus::Ok,
        active_sessions: sessions.len(),
        sessions,
    })
}
