//! DIAL-compatible HTTP front end for the relay coordinator.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /openai/deployments/{deployment}/chat/completions` - Answer one turn,
//!   as a single `chat.completion` body or as an SSE stream of
//!   `chat.completion.chunk` frames when `"stream": true`
//!
//! # Architecture
//!
//! ```text
//! Client (chat UI)
//!    │  messages + custom_content.state
//!    ▼
//! ┌─────────────────┐
//! │   API Gateway   │ ◄── This crate
//! │     (Axum)      │
//! └────────┬────────┘
//!          │ Turn + OutputSink
//!          ▼
//! ┌─────────────────┐
//! │   Coordinator   │ ──► routing LLM, UMS agent, general-purpose agent
//! └─────────────────┘
//! ```

pub mod auth;
pub mod routes;
pub mod sink;
pub mod state;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use sink::{ChunkFrame, ChunkSink, CollectingSink, StageRecord};
pub use state::{AppState, DEFAULT_DEPLOYMENT};

fn cors_layer(origins: Option<Vec<String>>) -> CorsLayer {
    let origin = match origins {
        Some(origins) if !origins.iter().any(|o| o == "*") => {
            let parsed: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match HeaderValue::from_str(o) {
                    Ok(v) => Some(v),
                    Err(_) => {
                        warn!(origin = %o, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(parsed)
        }
        _ => AllowOrigin::from(Any),
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Create the API router with all routes configured.
///
/// `cors_origins` restricts cross-origin access; `None` or `"*"` allows any.
pub fn create_router(state: Arc<AppState>, cors_origins: Option<Vec<String>>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/openai/deployments/{deployment}/chat/completions",
            post(routes::chat_completions),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Start the API server on the given address.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    cors_origins: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let deployment = state.deployment.clone();
    let router = create_router(state, cors_origins);

    info!(%addr, deployment = %deployment, "Starting relay API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
