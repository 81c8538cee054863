use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use relay_common::{Credential, Message, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured-output constraint for a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    pub json_schema: JsonSchemaFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchemaFormat {
    pub name: String,
    pub schema: Value,
    pub strict: bool,
}

impl ResponseFormat {
    pub fn json_schema(name: impl Into<String>, schema: Value) -> Self {
        Self {
            format_type: "json_schema".to_string(),
            json_schema: JsonSchemaFormat {
                name: name.into(),
                schema,
                strict: true,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub response_format: Option<ResponseFormat>,
    /// Extra headers forwarded verbatim on the outbound call.
    pub extra_headers: Vec<(String, String)>,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

/// Raw `data:` payloads of a streamed completion, in arrival order, with
/// the terminating `[DONE]` marker already consumed.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Chat-completion client. The credential is resolved by the caller and
/// passed on every call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest, credential: &Credential) -> Result<LlmResponse>;

    async fn stream(&self, request: LlmRequest, credential: &Credential) -> Result<ChunkStream>;

    fn deployment(&self) -> &str;
}
