//! HTTP surface: the alert webhook, the live event stream and state queries.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::events::Broadcaster;
use crate::models::Alert;
use crate::relay::{RelayError, SignalRelay};

/// Errors returned to webhook callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({ "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::InvalidSignal(_) => Self::BadRequest("Missing signal type".to_string()),
            RelayError::Persistence(e) => {
                error!(error = %format!("{e:#}"), "Failed to process webhook");
                Self::Internal
            }
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<SignalRelay>,
    pub broadcaster: Broadcaster,
}

pub struct WebhookServer {
    state: AppState,
}

impl WebhookServer {
    pub fn new(relay: Arc<SignalRelay>, broadcaster: Broadcaster) -> Self {
        Self {
            state: AppState { relay, broadcaster },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/webhook", post(webhook))
            .route("/stream-signals", get(stream_signals))
            .route("/state", get(current_state))
            .route("/health", get(health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until Ctrl+C.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on http://{}/webhook", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

/// Parse a webhook body into an alert.
///
/// The body is read leniently: callers frequently omit the content type.
fn parse_alert(body: &[u8]) -> Result<Alert, ApiError> {
    let empty = || ApiError::BadRequest("Empty payload received".to_string());

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(empty());
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON payload: {e}")))?;

    let mut fields = match value {
        Value::Object(fields) if !fields.is_empty() => fields,
        _ => return Err(empty()),
    };

    // Scalar values are accepted as text
    for key in ["signal", "pair"] {
        if let Some(v) = fields.get_mut(key) {
            if matches!(v, Value::Number(_) | Value::Bool(_)) {
                *v = Value::String(v.to_string());
            }
        }
    }

    serde_json::from_value(Value::Object(fields))
        .map_err(|e| ApiError::BadRequest(format!("Invalid alert: {e}")))
}

async fn webhook(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let alert = parse_alert(&body)?;
    let outcome = state.relay.handle(&alert).await?;

    Ok(Json(json!({
        "message": "Webhook processed",
        "info": outcome.info,
        "mode": outcome.mode,
        "executed": outcome.execution.is_some(),
    })))
}

async fn stream_signals(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.broadcaster.subscribe();
    info!(clients = state.broadcaster.subscriber_count(), "Stream client connected");

    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = event.to_json().to_string();
                    return Some((Ok(SseEvent::default().data(data)), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Stream client lagging, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct StateQuery {
    pair: Option<String>,
}

async fn current_state(
    State(state): State<AppState>,
    Query(query): Query<StateQuery>,
) -> Result<Json<Value>, ApiError> {
    let pair = query
        .pair
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_uppercase)
        .unwrap_or_else(|| state.relay.default_symbol().to_string());

    let cycle = state.relay.current_state(&pair).await?;
    Ok(Json(json!({ "pair": pair, "state": cycle })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "dryRun": state.relay.is_dry_run(),
    }))
}
