//! Advisor Relay - streaming chat bridge to Google Gemini.
//!
//! Accepts a user message from the mortgage advisor frontend, forwards it to
//! Gemini inside a per-session conversation, and re-frames the streamed reply
//! as Server-Sent Events:
//! ```text
//! Browser → POST /api/chat → session registry → Gemini (alt=sse)
//!                ↑                                   │
//!                └──────── data: {"chunk": …} ───────┘
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod provider;
pub mod relay;
pub mod routes;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use provider::{GeminiProvider, Provider, ProviderError};
pub use relay::{ChatRelay, ChatRequest, RelayEvent};
pub use routes::AppState;
pub use session::SessionRegistry;

use advisor_common::config::Config;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the relay router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::build_routes(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Assemble application state from configuration and a provider.
pub fn build_state(config: &Config, provider: Arc<dyn Provider>) -> AppState {
    let registry = Arc::new(SessionRegistry::new(&config.sessions));
    AppState::new(ChatRelay::new(registry, provider))
}

/// Start the relay server.
///
/// Fails before binding when no API credential is configured.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let api_key = config.require_api_key()?;
    let provider = Arc::new(GeminiProvider::new(api_key, config.llm.clone()));

    tracing::info!(
        model = %provider.model(),
        max_sessions = config.sessions.max_sessions,
        idle_ttl_secs = config.sessions.idle_ttl_secs,
        "Gemini provider configured"
    );

    let router = build_router(build_state(config, provider));

    let addr = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Starting Advisor Relay on {}", addr);
    tracing::info!("  POST /api/chat   - streaming chat");
    tracing::info!("  GET  /api/health - health check");

    axum::serve(listener, router).await?;

    Ok(())
}
