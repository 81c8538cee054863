use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{future, StreamExt};
use relay_common::{Credential, Message, RelayError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::client::{ChunkStream, LlmClient, LlmRequest, LlmResponse, ResponseFormat, TokenUsage};

pub const DEFAULT_API_VERSION: &str = "2025-01-01-preview";

const API_KEY_HEADER: &str = "Api-Key";
const DONE_MARKER: &str = "[DONE]";

#[derive(Serialize)]
struct DialRequest<'a> {
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a ResponseFormat>,
}

#[derive(Deserialize)]
struct DialResponse {
    choices: Vec<DialChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<DialUsage>,
}

#[derive(Deserialize)]
struct DialChoice {
    message: DialMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DialMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct DialUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Client for one deployment behind a DIAL-compatible chat-completions API.
pub struct DialClient {
    base_url: String,
    deployment: String,
    api_version: String,
    http_client: reqwest::Client,
}

impl DialClient {
    pub fn new(base_url: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self::with_http_client(base_url, deployment, reqwest::Client::new())
    }

    pub fn with_http_client(
        base_url: impl Into<String>,
        deployment: impl Into<String>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            deployment: deployment.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            http_client,
        }
    }

    pub fn api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.base_url, self.deployment, self.api_version
        )
    }

    fn build_body<'a>(request: &'a LlmRequest, stream: bool) -> DialRequest<'a> {
        DialRequest {
            messages: &request.messages,
            stream,
            response_format: request.response_format.as_ref(),
        }
    }

    async fn send(
        &self,
        request: &LlmRequest,
        credential: &Credential,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let mut http_req = self
            .http_client
            .post(self.url())
            .header(API_KEY_HEADER, credential.expose())
            .json(&Self::build_body(request, stream));
        for (name, value) in &request.extra_headers {
            http_req = http_req.header(name.as_str(), value.as_str());
        }

        debug!(
            deployment = %self.deployment,
            messages = request.messages.len(),
            stream,
            credential = %credential.preview(),
            "Calling chat completions"
        );

        let response = http_req
            .send()
            .await
            .map_err(|e| RelayError::Llm(format!("{} request failed: {e}", self.deployment)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RelayError::Llm(format!(
                "{} API error {status}: {body_text}",
                self.deployment
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmClient for DialClient {
    async fn complete(&self, request: LlmRequest, credential: &Credential) -> Result<LlmResponse> {
        let response = self.send(&request, credential, false).await?;

        let dial_response: DialResponse = response.json().await.map_err(|e| {
            RelayError::Llm(format!("Failed to parse {} response: {e}", self.deployment))
        })?;

        let choice = dial_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RelayError::Llm(format!("No choices in {} response", self.deployment)))?;

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            model: dial_response.model,
            usage: dial_response.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream(&self, request: LlmRequest, credential: &Credential) -> Result<ChunkStream> {
        let response = self.send(&request, credential, true).await?;
        let deployment = self.deployment.clone();

        let frames = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                future::ready(!matches!(event, Ok(e) if e.data.trim() == DONE_MARKER))
            })
            .filter_map(move |event| {
                let frame = match event {
                    Ok(e) if e.data.trim().is_empty() => None,
                    Ok(e) => {
                        trace!(data = %e.data, "SSE frame");
                        Some(Ok(e.data))
                    }
                    Err(e) => Some(Err(RelayError::Llm(format!(
                        "{deployment} stream interrupted: {e}"
                    )))),
                };
                future::ready(frame)
            });

        Ok(Box::pin(frames))
    }

    fn deployment(&self) -> &str {
        &self.deployment
    }
}
