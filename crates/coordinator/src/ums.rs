//! Gateway to the Users Management Service agent.
//!
//! The UMS agent keeps its own conversation history server-side. This gateway
//! only carries the conversation id between turns.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use relay_common::{CustomContent, Message, Output, RelayError, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::UmsConfig;
use crate::continuity;
use crate::gateway::{BackendGateway, Dispatch};
use crate::routing::AgentKind;
use crate::stream::stream_error_message;

const DONE_MARKER: &str = "[DONE]";

#[derive(Deserialize)]
struct CreatedConversation {
    id: String,
}

#[derive(Deserialize)]
struct UmsFrame {
    #[serde(default)]
    conversation_id: Option<Value>,
    #[serde(default)]
    choices: Vec<UmsChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct UmsChoice {
    #[serde(default)]
    delta: Option<UmsDelta>,
}

#[derive(Deserialize)]
struct UmsDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the content delta from one UMS stream frame.
///
/// Frames announcing the conversation id carry no content and yield `None`.
/// An error frame fails with [`RelayError::BackendUnreachable`].
pub fn decode_ums_frame(data: &str) -> Result<Option<String>> {
    let frame: UmsFrame = serde_json::from_str(data).map_err(|e| {
        RelayError::MalformedStreamEvent(format!(
            "{e}; frame: {}",
            data.chars().take(200).collect::<String>()
        ))
    })?;

    if let Some(message) = frame.error.as_ref().and_then(stream_error_message) {
        return Err(RelayError::BackendUnreachable(format!(
            "UMS stream error: {message}"
        )));
    }

    if frame.conversation_id.is_some() {
        return Ok(None);
    }

    Ok(frame
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|c| !c.is_empty()))
}

pub struct UmsGateway {
    endpoint: String,
    create_timeout: Duration,
    chat_timeout: Duration,
    http_client: reqwest::Client,
}

impl UmsGateway {
    pub fn new(config: &UmsConfig, http_client: reqwest::Client) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            create_timeout: Duration::from_millis(config.create_timeout_ms),
            chat_timeout: Duration::from_millis(config.chat_timeout_ms),
            http_client,
        }
    }

    /// Create a backend conversation.
    ///
    /// A non-2xx answer or an unusable body does not fail the turn: a local
    /// pseudo-id is returned instead and server-side history is lost for
    /// this chain. Transport failures are fatal.
    pub async fn create_conversation(&self) -> Result<String> {
        let url = format!("{}/conversations", self.endpoint);

        let response = self
            .http_client
            .post(&url)
            .timeout(self.create_timeout)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| RelayError::BackendUnreachable(format!("UMS {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "UMS conversation creation failed");
            return Ok(pseudo_conversation_id());
        }

        match response.json::<CreatedConversation>().await {
            Ok(created) => {
                info!(conversation_id = %created.id, "Created UMS conversation");
                Ok(created.id)
            }
            Err(e) => {
                warn!(error = %e, "UMS conversation creation returned no id");
                Ok(pseudo_conversation_id())
            }
        }
    }

    /// Send one user message and relay the streamed answer.
    async fn chat(&self, conversation_id: &str, content: &str, output: Output<'_>) -> Result<String> {
        let url = format!("{}/conversations/{conversation_id}/chat", self.endpoint);

        let response = self
            .http_client
            .post(&url)
            .timeout(self.chat_timeout)
            .json(&json!({
                "message": {"role": "user", "content": content},
                "stream": true
            }))
            .send()
            .await
            .map_err(|e| RelayError::BackendUnreachable(format!("UMS {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::BackendUnreachable(format!(
                "UMS chat returned {status}: {body}"
            )));
        }

        let mut events = response.bytes_stream().eventsource();
        let mut answer = String::new();
        let mut chunks = 0usize;

        while let Some(event) = events.next().await {
            let event = event.map_err(|e| {
                RelayError::BackendUnreachable(format!("UMS stream interrupted: {e}"))
            })?;
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == DONE_MARKER {
                break;
            }

            match decode_ums_frame(data) {
                Ok(Some(delta)) => {
                    output.append(&delta);
                    answer.push_str(&delta);
                    chunks += 1;
                }
                Ok(None) => {}
                Err(e) if e.is_recoverable() => debug!(error = %e, "Skipping UMS frame"),
                Err(e) => return Err(e),
            }
        }

        info!(
            conversation_id,
            chunks,
            len = answer.len(),
            preview = %answer.chars().take(200).collect::<String>(),
            "UMS response collected"
        );

        Ok(answer)
    }
}

fn pseudo_conversation_id() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    warn!(conversation_id = %id, "Using temporary UMS conversation id");
    id
}

#[async_trait]
impl BackendGateway for UmsGateway {
    fn kind(&self) -> AgentKind {
        AgentKind::Ums
    }

    async fn respond(&self, dispatch: Dispatch<'_>, output: Output<'_>) -> Result<Message> {
        let conversation_id = match continuity::find_ums_conversation_id(dispatch.turn.messages()) {
            Some(id) => {
                debug!(conversation_id = %id, "Resuming UMS conversation");
                id
            }
            None => self.create_conversation().await?,
        };

        let content = self
            .chat(&conversation_id, &dispatch.augmented_content(), output)
            .await?;

        Ok(Message::assistant(content).with_custom_content(CustomContent::with_state(
            continuity::ums_state(&conversation_id),
        )))
    }
}
