//! HTTP routes for the advisor relay.

use crate::relay::{ChatRelay, ChatRequest, RelayEvent};
use advisor_common::logging::RequestContext;
use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;

const SERVICE_NAME: &str = "advisor-relay";

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub relay: ChatRelay,
}

impl AppState {
    pub fn new(relay: ChatRelay) -> Self {
        Self { relay }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Liveness response. Says nothing about upstream reachability.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ============================================================================
// Chat
// ============================================================================

impl From<RelayEvent> for Event {
    fn from(event: RelayEvent) -> Self {
        let frame = Event::default().data(event.payload().to_string());
        match event.name() {
            Some(name) => frame.event(name),
            None => frame,
        }
    }
}

/// `POST /api/chat`: relay one user turn as an event stream.
async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let ctx = RequestContext::from_headers(&headers, SERVICE_NAME);
    tracing::debug!(
        trace_id = %ctx.trace_id,
        service = %ctx.service,
        session_id = %request.session_id(),
        "Chat request received"
    );

    let events = state
        .relay
        .handle(request, &ctx.trace_id)
        .map(|event| Ok(Event::from(event)));

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Build all API routes.
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_shape() {
        let body = serde_json::to_value(HealthResponse { status: "ok" }).unwrap();
        assert_eq!(body, serde_json::json!({"status": "ok"}));
    }
}
