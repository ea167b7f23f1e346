use crate::broadcast::SubscriberStream;
use crate::error::ReceiverError;
use crate::receiver::{
    challenge_secret, handshake_challenge, signature_header, AppState, HOOK_SECRET_HEADER,
};
use crate::types::{EventFilter, EventQuery, WebhookSummary};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use tokio::net::TcpListener;
use tracing::{info, warn};

const DEFAULT_PAGE_SIZE: usize = 50;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/webhook", post(handle_webhook))
        .route("/events", get(handle_events))
        .route("/api/info", get(handle_info))
        .route("/api/events/history", get(handle_history))
        .route("/api/events/clear", post(handle_clear))
        .route("/api/events/database", get(handle_database_events))
        .route("/api/webhooks", get(handle_webhooks))
        .route("/api/database/stats", get(handle_database_stats))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(value) = handshake_challenge(&headers) {
        let Some(challenge) = challenge_secret(value) else {
            warn!("handshake with an empty or non-ASCII challenge rejected");
            return StatusCode::BAD_REQUEST.into_response();
        };
        // Echo first; the rest of the handshake is in-memory or queued.
        state.handle_handshake(challenge, &body);
        let mut response = StatusCode::OK.into_response();
        response.headers_mut().insert(HOOK_SECRET_HEADER, value.clone());
        return response;
    }

    match state.ingest_batch(signature_header(&headers), &body) {
        Ok(outcome) => Json(json!({
            "received": true,
            "processed": outcome.processed,
            "verification": outcome.check.label(),
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_events(State(state): State<AppState>) -> Result<Sse<SubscriberStream>, StatusCode> {
    state
        .broadcaster
        .subscribe_stream(state.config.subscriber_buffer)
        .map(Sse::new)
        .map_err(|e| {
            warn!(error = %e, "stream subscription failed");
            StatusCode::SERVICE_UNAVAILABLE
        })
}

async fn handle_history(State(state): State<AppState>) -> Json<serde_json::Value> {
    let events = state.history.snapshot();
    let count = events.len();
    Json(json!({ "success": true, "events": events, "count": count }))
}

async fn handle_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cleared = state.clear_history();
    Json(json!({ "success": true, "message": format!("Cleared {cleared} events") }))
}

async fn handle_root(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base = &state.config.public_url;
    Json(json!({
        "status": "running",
        "message": "Asana Webhook Receiver is active",
        "webhook_url": state.config.webhook_url(),
        "info": format!("GET {base}/api/info"),
    }))
}

async fn handle_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base = &state.config.public_url;
    Json(json!({
        "status": "running",
        "message": "Asana Webhook Receiver is active",
        "connectedClients": state.broadcaster.client_count(),
        "eventsInHistory": state.history.len(),
        "historyCapacity": state.history.capacity(),
        "secretBound": state.secret.is_bound(),
        "persistenceFailures": state.persistence.failures(),
        "persistenceDropped": state.persistence.dropped(),
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
        "urls": {
            "public_url": base,
            "webhook_endpoint": state.config.webhook_url(),
            "sse_stream": format!("{base}/events"),
        },
    }))
}

async fn handle_webhooks(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ReceiverError> {
    let webhooks: Vec<WebhookSummary> = state
        .store
        .list_webhooks()
        .await?
        .into_iter()
        .map(WebhookSummary::from)
        .collect();
    let count = webhooks.len();
    Ok(Json(json!({ "success": true, "webhooks": webhooks, "count": count })))
}

#[derive(Debug, Default, Deserialize)]
struct DatabaseEventsParams {
    limit: Option<usize>,
    offset: Option<usize>,
    resource_type: Option<String>,
    action: Option<String>,
    resource_gid: Option<String>,
}

impl DatabaseEventsParams {
    fn into_query(self) -> EventQuery {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        EventQuery {
            filter: EventFilter {
                resource_type: non_empty(self.resource_type),
                action: non_empty(self.action),
                resource_gid: non_empty(self.resource_gid),
            },
            limit: self.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_PAGE_SIZE),
            offset: self.offset.unwrap_or(0),
        }
    }
}

async fn handle_database_events(
    State(state): State<AppState>,
    Query(params): Query<DatabaseEventsParams>,
) -> Result<Json<serde_json::Value>, ReceiverError> {
    let query = params.into_query();
    let events = state.store.recent_events(&query).await?;
    let total = state.store.count_events(&query.filter).await?;
    let count = events.len();
    Ok(Json(json!({
        "success": true,
        "events": events,
        "count": count,
        "total": total,
        "limit": query.limit,
        "offset": query.offset,
        "hasMore": query.offset + count < total,
    })))
}

async fn handle_database_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ReceiverError> {
    let stats = state.store.stats().await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}
