//! LLM-driven routing of a turn to one backend agent.

use std::sync::Arc;

use relay_common::{Credential, Message, Output, Result, Role, Turn};
use relay_llm::{LlmClient, LlmRequest, ResponseFormat};
use tracing::{debug, info};

use crate::routing::RoutingDecision;

/// Name of the output section shown while the turn is being routed.
pub const COORDINATION_STAGE: &str = "Coordination Request";

/// System prompt for the routing call.
pub const COORDINATION_REQUEST_SYSTEM_PROMPT: &str = r#"You are a Multi Agent System (MAS) coordination assistant. Your role is to analyze user requests and determine which specialized agent should handle each request.

## Available Agents:

1. **GPA (General-purpose Agent)**:
   - Handles general tasks and answers user questions
   - Provides WEB search capabilities
   - Performs RAG search through documents (supports PDF, TXT, CSV files)
   - Retrieves content from documents
   - Performs calculations with a Python code interpreter
   - Use this agent for general questions, web searches, document analysis, calculations, and non-user-management tasks

2. **UMS (Users Management Service Agent)**:
   - Manages users within the Users Management Service
   - Handles user-related queries (checking if users exist, adding users, updating user information, etc.)
   - Use this agent for any requests related to user management, user data, or user operations

## Your Task:

Analyze the user's request and determine:
1. Which agent (GPA or UMS) should handle this request
2. Any additional instructions that should be provided to the selected agent to better fulfill the request

## Instructions:

- Identify the primary intent and domain of the request
- If the request involves user management, user data, or user operations, route to UMS
- For all other requests (general questions, searches, document analysis, calculations), route to GPA
- Provide clear, concise additional instructions only if they help the agent fulfill the request; otherwise use null
- Return your decision in the specified JSON format
"#;

/// Name given to the structured-output schema on the wire.
const RESPONSE_SCHEMA_NAME: &str = "response";

/// Classifies turns with one structured-output completion.
///
/// Always calls the LLM with the internal credential, never with whatever
/// the caller supplied.
pub struct Router {
    llm: Arc<dyn LlmClient>,
    credential: Credential,
}

impl Router {
    pub fn new(llm: Arc<dyn LlmClient>, credential: Credential) -> Self {
        Self { llm, credential }
    }

    /// System prompt followed by the turn's messages. User messages are sent
    /// without their side channel.
    pub fn build_messages(turn: &Turn) -> Vec<Message> {
        let mut messages = Vec::with_capacity(turn.messages().len() + 1);
        messages.push(Message::system(COORDINATION_REQUEST_SYSTEM_PROMPT));
        messages.extend(turn.messages().iter().map(|m| match m.role {
            Role::User => m.content_only(),
            _ => m.clone(),
        }));
        messages
    }

    /// Decide which agent answers this turn.
    ///
    /// The coordination section is open for the duration of the call and is
    /// closed before this returns, on success and on failure.
    pub async fn classify(&self, turn: &Turn, output: Output<'_>) -> Result<RoutingDecision> {
        let stage = output.stage(COORDINATION_STAGE);

        let request = LlmRequest::new(Self::build_messages(turn)).with_response_format(
            ResponseFormat::json_schema(RESPONSE_SCHEMA_NAME, RoutingDecision::schema()),
        );

        debug!(
            deployment = %self.llm.deployment(),
            messages = request.messages.len(),
            "Requesting routing decision"
        );

        let response = self.llm.complete(request, &self.credential).await;
        stage.close();

        let decision = RoutingDecision::parse(&response?.content)?;

        info!(
            agent = %decision.agent_kind,
            has_instructions = decision.instructions().is_some(),
            "Routing decision"
        );

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::AgentKind;
    use async_trait::async_trait;
    use relay_common::output::testing::{RecordingSink, SinkCall};
    use relay_common::{CustomContent, RelayError, StateMap, StageId};
    use relay_llm::{ChunkStream, LlmResponse};
    use std::sync::Mutex;

    struct FixedLlm {
        reply: std::result::Result<String, String>,
        seen: Mutex<Vec<(LlmRequest, String)>>,
    }

    impl FixedLlm {
        fn replying(content: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(content.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(message.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn complete(&self, request: LlmRequest, credential: &Credential) -> Result<LlmResponse> {
            self.seen
                .lock()
                .unwrap()
                .push((request, credential.expose().to_string()));
            match &self.reply {
                Ok(content) => Ok(LlmResponse {
                    content: content.clone(),
                    model: None,
                    usage: None,
                    finish_reason: Some("stop".into()),
                }),
                Err(message) => Err(RelayError::Llm(message.clone())),
            }
        }

        async fn stream(&self, _request: LlmRequest, _credential: &Credential) -> Result<ChunkStream> {
            Err(RelayError::Llm("not used".into()))
        }

        fn deployment(&self) -> &str {
            "router-test"
        }
    }

    fn turn() -> Turn {
        let mut state = StateMap::new();
        state.insert("secret".into(), "x".into());
        Turn::new(
            vec![
                Message::user("hi").with_custom_content(CustomContent::with_state(state)),
                Message::assistant("hello"),
                Message::user("add user Bob"),
            ],
            [("Api-Key", "caller-key")],
        )
        .unwrap()
    }

    #[test]
    fn messages_start_with_system_prompt_and_strip_user_side_channel() {
        let messages = Router::build_messages(&turn());
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("UMS"));
        assert!(messages[1].custom_content.is_none());
        assert_eq!(messages[3].content, "add user Bob");
    }

    #[tokio::test]
    async fn classify_uses_internal_credential_and_schema() {
        let llm = FixedLlm::replying(r#"{"agentKind":"UMS","additionalInstructions":null}"#);
        let router = Router::new(llm.clone(), Credential::new("internal"));
        let sink = RecordingSink::new();

        let decision = router.classify(&turn(), Output::new(&sink)).await.unwrap();

        assert_eq!(decision.agent_kind, AgentKind::Ums);
        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0].1, "internal");
        let format = seen[0].0.response_format.as_ref().unwrap();
        assert_eq!(format.json_schema.name, "response");
        assert!(format.json_schema.strict);
    }

    #[tokio::test]
    async fn coordination_stage_is_closed_once() {
        let llm = FixedLlm::replying(r#"{"agentKind":"GPA"}"#);
        let router = Router::new(llm, Credential::new("internal"));
        let sink = RecordingSink::new();

        router.classify(&turn(), Output::new(&sink)).await.unwrap();

        assert_eq!(sink.stage_names(), vec![COORDINATION_STAGE.to_string()]);
        assert_eq!(sink.close_count(StageId(0)), 1);
        assert_eq!(sink.open_stages(), 0);
    }

    #[tokio::test]
    async fn malformed_decision_is_invalid_and_stage_still_closes() {
        let llm = FixedLlm::replying(r#"{"agent":"GPA"}"#);
        let router = Router::new(llm, Credential::new("internal"));
        let sink = RecordingSink::new();

        let err = router.classify(&turn(), Output::new(&sink)).await.unwrap_err();

        assert!(matches!(err, RelayError::RoutingDecisionInvalid(_)));
        assert_eq!(sink.open_stages(), 0);
    }

    #[tokio::test]
    async fn llm_failure_propagates_and_stage_closes() {
        let llm = FixedLlm::failing("connection refused");
        let router = Router::new(llm, Credential::new("internal"));
        let sink = RecordingSink::new();

        let err = router.classify(&turn(), Output::new(&sink)).await.unwrap_err();

        assert!(matches!(err, RelayError::Llm(_)));
        assert!(sink
            .calls()
            .iter()
            .any(|c| matches!(c, SinkCall::CloseStage(StageId(0)))));
    }
}
