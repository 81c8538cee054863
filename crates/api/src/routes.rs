//! HTTP route handlers for the API.

use crate::auth::{caller_credential, request_headers};
use crate::sink::{unix_now, ChunkFrame, ChunkSink, CollectingSink};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use relay_common::{Message, RelayError, Turn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, Instrument};

const DONE_MARKER: &str = "[DONE]";

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub deployment: String,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        deployment: state.deployment.clone(),
    })
}

/// Chat-completion request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
}

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip)]
    pub status: StatusCode,
}

impl From<RelayError> for ErrorResponse {
    fn from(err: RelayError) -> Self {
        let status = match err {
            RelayError::InvalidTurn(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            error: err.to_string(),
            code: err.code(),
            status,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// `POST /openai/deployments/{deployment}/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Path(deployment): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ErrorResponse> {
    if deployment != state.deployment {
        return Err(ErrorResponse {
            error: format!("Unknown deployment '{deployment}'"),
            code: "DEPLOYMENT_NOT_FOUND",
            status: StatusCode::NOT_FOUND,
        });
    }

    info!(
        messages = request.messages.len(),
        stream = request.stream,
        caller_key = ?caller_credential(&headers).map(|c| c.preview()),
        "Received chat completion"
    );

    let turn = Turn::new(request.messages, request_headers(&headers))?;

    if request.stream {
        Ok(stream_turn(state, turn).into_response())
    } else {
        complete_turn(state, turn).await.map(IntoResponse::into_response)
    }
}

/// Run the turn in the background and relay its output as SSE.
///
/// A failed turn ends with an error frame and no `[DONE]` marker.
fn stream_turn(state: Arc<AppState>, turn: Turn) -> impl IntoResponse {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = ChunkSink::new(ChunkFrame::new(state.deployment.clone()), tx);
    let coordinator = state.coordinator.clone();
    let span = tracing::info_span!("turn", id = %sink.frame().id());

    tokio::spawn(
        async move {
            // A closed channel only means the client went away.
            let _ = sink.send(sink.frame().role());

            match coordinator.handle_turn(&turn, &sink).await {
                Ok(message) => {
                    if let Some(custom) = message.custom_content.as_ref().filter(|c| !c.is_empty()) {
                        let _ = sink.send(sink.frame().custom_content(custom));
                    }
                    let _ = sink.send(sink.frame().finish());
                    let _ = sink.send(DONE_MARKER.to_string());
                    debug!(len = message.content.len(), "Streamed turn finished");
                }
                Err(e) => {
                    error!(error = %e, code = e.code(), "Streamed turn failed");
                    let _ = sink.send(ChunkFrame::error(&e.to_string(), e.code()));
                }
            }
        }
        .instrument(span),
    );

    let events = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, Infallible>(Event::default().data(data)));

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Run the turn to completion and answer with one `chat.completion` body.
async fn complete_turn(state: Arc<AppState>, turn: Turn) -> Result<Json<Value>, ErrorResponse> {
    let sink = CollectingSink::new();
    let message = state
        .coordinator
        .handle_turn(&turn, &sink)
        .await
        .map_err(|e| {
            error!(error = %e, code = e.code(), "Turn failed");
            ErrorResponse::from(e)
        })?;

    let mut body = serde_json::to_value(&message).map_err(RelayError::from)?;
    let stages = sink.into_stages();
    if !stages.is_empty() {
        body["custom_content"]["stages"] = serde_json::to_value(stages).map_err(RelayError::from)?;
    }

    Ok(Json(json!({
        "id": ChunkFrame::new(state.deployment.clone()).id(),
        "object": "chat.completion",
        "created": unix_now(),
        "model": state.deployment,
        "choices": [{
            "index": 0,
            "message": body,
            "finish_reason": "stop",
        }]
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.1.0",
            uptime_seconds: 100,
            deployment: "mas-coordinator".into(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("mas-coordinator"));
    }

    #[test]
    fn test_chat_request_defaults_to_non_streaming() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(!request.stream);
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn test_chat_request_with_state() {
        let request: ChatRequest = serde_json::from_value(json!({
            "stream": true,
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello", "custom_content": {"state": {"ums_conversation_id": "c"}}},
                {"role": "user", "content": "again"}
            ]
        }))
        .unwrap();
        assert!(request.stream);
        assert!(request.messages[1].state().is_some());
    }

    #[test]
    fn test_error_status_mapping() {
        let err = ErrorResponse::from(RelayError::InvalidTurn("empty".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "INVALID_TURN");

        let err = ErrorResponse::from(RelayError::BackendUnreachable("ums".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!serde_json::to_string(&err).unwrap().contains("status"));
    }
}
