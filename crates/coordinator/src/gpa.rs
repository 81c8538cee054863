//! Gateway to the general-purpose agent.
//!
//! The agent is stateless on our side of the wire: every turn replays the
//! history it produced earlier, rebuilt from the snapshots carried in the
//! caller's assistant messages.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use relay_common::{Credential, CustomContent, Message, Output, RelayError, Result, Role, Turn};
use relay_llm::{LlmClient, LlmRequest};
use tracing::{debug, info};

use crate::continuity;
use crate::gateway::{augment_with_instructions, BackendGateway, Dispatch};
use crate::routing::AgentKind;
use crate::stream::{StreamEvent, StreamMerger};

pub const API_KEY_HEADER: &str = "Api-Key";
pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

/// Credential for the agent call: the explicit one, else the request's
/// `Api-Key` header.
pub fn resolve_credential(explicit: Option<&Credential>, turn: &Turn) -> Result<Credential> {
    if let Some(credential) = explicit.filter(|c| !c.is_empty()) {
        return Ok(credential.clone());
    }
    turn.header(API_KEY_HEADER)
        .filter(|k| !k.trim().is_empty())
        .map(Credential::from)
        .ok_or_else(|| {
            RelayError::CredentialMissing(
                "general-purpose agent needs an API key: pass one explicitly or send an Api-Key header"
                    .to_string(),
            )
        })
}

/// Rebuild the message sequence the agent saw on earlier turns.
///
/// Every assistant reply tagged by this gateway is replayed together with
/// the user message right before it, with the reply's state replaced by the
/// agent's own snapshot. A tagged reply without a snapshot replays only its
/// user message. The new user message goes last, augmented with
/// `instructions`.
pub fn reconstruct_history(turn: &Turn, instructions: Option<&str>) -> Vec<Message> {
    let history = turn.history();
    let mut messages = Vec::new();

    for (i, message) in history.iter().enumerate() {
        if !continuity::is_gpa_reply(message) {
            continue;
        }
        if let Some(prompt) = i.checked_sub(1).map(|p| &history[p]) {
            if prompt.role == Role::User {
                messages.push(prompt.clone());
            }
        }

        let Some(snapshot) = message.state().and_then(continuity::gpa_snapshot) else {
            debug!(index = i, "GPA marker without snapshot, replaying prompt only");
            continue;
        };

        let attachments = message
            .custom_content
            .as_ref()
            .map(|c| c.attachments.clone())
            .unwrap_or_default();
        messages.push(Message::assistant(message.content.clone()).with_custom_content(
            CustomContent {
                attachments,
                state: Some(snapshot.clone()),
            },
        ));
    }

    let latest = turn.latest();
    let mut last = latest.clone();
    last.content = augment_with_instructions(&latest.content, instructions);
    messages.push(last);

    messages
}

pub struct GpaGateway {
    llm: Arc<dyn LlmClient>,
}

impl GpaGateway {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl BackendGateway for GpaGateway {
    fn kind(&self) -> AgentKind {
        AgentKind::Gpa
    }

    async fn respond(&self, dispatch: Dispatch<'_>, output: Output<'_>) -> Result<Message> {
        let credential = resolve_credential(dispatch.credential, dispatch.turn)?;

        let mut request = LlmRequest::new(reconstruct_history(dispatch.turn, dispatch.instructions));
        if let Some(conversation_id) = dispatch.turn.header(CONVERSATION_ID_HEADER) {
            request = request.with_header(CONVERSATION_ID_HEADER, conversation_id);
        }

        debug!(
            deployment = %self.llm.deployment(),
            messages = request.messages.len(),
            credential = %credential.preview(),
            "Calling general-purpose agent"
        );

        let mut chunks = self
            .llm
            .stream(request, &credential)
            .await
            .map_err(into_unreachable)?;

        let mut merger = StreamMerger::new();
        let mut frames = 0usize;
        let mut skipped = 0usize;

        while let Some(chunk) = chunks.next().await {
            let decoded = chunk
                .map_err(into_unreachable)
                .and_then(|chunk| StreamEvent::decode_chunk(&chunk));
            frames += 1;
            match decoded {
                Ok(events) => {
                    for event in events {
                        merger.apply(event, output);
                    }
                }
                Err(e) if e.is_recoverable() => {
                    skipped += 1;
                    debug!(error = %e, "Skipping GPA chunk");
                }
                Err(e) => {
                    // Sections the agent opened must not outlive the turn.
                    let _ = merger.finish(output);
                    return Err(e);
                }
            }
        }

        let message = merger.finish(output);

        info!(
            frames,
            skipped,
            len = message.content.len(),
            has_state = message.state().is_some(),
            preview = %message.content.chars().take(200).collect::<String>(),
            "GPA response collected"
        );

        Ok(message)
    }
}

fn into_unreachable(err: RelayError) -> RelayError {
    match err {
        RelayError::Llm(detail) => RelayError::BackendUnreachable(format!("GPA: {detail}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::output::testing::RecordingSink;
    use relay_common::{Attachment, StateMap};
    use relay_llm::{ChunkStream, LlmResponse};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Streams a fixed list of chunks and records what it was asked.
    struct ScriptedAgent {
        chunks: Vec<Result<String>>,
        seen: Mutex<Vec<(LlmRequest, String)>>,
    }

    impl ScriptedAgent {
        fn new(chunks: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn last_request(&self) -> (LlmRequest, String) {
            self.seen.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedAgent {
        async fn complete(&self, _request: LlmRequest, _credential: &Credential) -> Result<LlmResponse> {
            Err(RelayError::Llm("not used".into()))
        }

        async fn stream(&self, request: LlmRequest, credential: &Credential) -> Result<ChunkStream> {
            self.seen
                .lock()
                .unwrap()
                .push((request, credential.expose().to_string()));
            let chunks: Vec<Result<String>> = self
                .chunks
                .iter()
                .map(|c| match c {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(RelayError::Llm(e.to_string())),
                })
                .collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        fn deployment(&self) -> &str {
            "general-purpose-agent"
        }
    }

    fn delta(value: Value) -> Result<String> {
        Ok(json!({"choices": [{"delta": value}]}).to_string())
    }

    fn snapshot(value: Value) -> StateMap {
        value.as_object().cloned().unwrap()
    }

    fn gpa_reply(content: &str, state: StateMap) -> Message {
        Message::assistant(content)
            .with_custom_content(CustomContent::with_state(continuity::gpa_state(state)))
    }

    #[test]
    fn explicit_credential_wins() {
        let turn = Turn::new(vec![Message::user("q")], [("api-key", "from-header")]).unwrap();
        let explicit = Credential::new("explicit");
        assert_eq!(
            resolve_credential(Some(&explicit), &turn).unwrap().expose(),
            "explicit"
        );
        assert_eq!(resolve_credential(None, &turn).unwrap().expose(), "from-header");
    }

    #[test]
    fn missing_credential_is_fatal() {
        let turn = Turn::from_messages(vec![Message::user("q")]).unwrap();
        let err = resolve_credential(None, &turn).unwrap_err();
        assert!(matches!(err, RelayError::CredentialMissing(_)));
    }

    #[test]
    fn history_replays_tagged_pairs_with_snapshot() {
        let first_question = Message::user("What is in report.pdf?");
        let ums_reply = Message::assistant("User added").with_custom_content(
            CustomContent::with_state(continuity::ums_state("conv-1")),
        );
        let turn = Turn::from_messages(vec![
            first_question.clone(),
            gpa_reply("It covers Q3.", snapshot(json!({"tool_calls": ["rag"]}))),
            Message::user("Add user Bob"),
            ums_reply,
            Message::user("Summarise page 2"),
        ])
        .unwrap();

        let messages = reconstruct_history(&turn, Some("Use the same report"));

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], first_question);
        assert_eq!(messages[1].content, "It covers Q3.");
        assert_eq!(
            messages[1].state().unwrap(),
            &snapshot(json!({"tool_calls": ["rag"]}))
        );
        assert_eq!(
            messages[2].content,
            "Summarise page 2\n\nAdditional instructions: Use the same report"
        );
    }

    #[test]
    fn history_without_instructions_keeps_latest_verbatim() {
        let latest = Message::user("hello").with_custom_content(CustomContent {
            attachments: vec![Attachment::link("a", "files/a.csv")],
            state: None,
        });
        let turn = Turn::from_messages(vec![latest.clone()]).unwrap();
        assert_eq!(reconstruct_history(&turn, None), vec![latest]);
    }

    #[tokio::test]
    async fn respond_merges_stream_and_tags_state() {
        let agent = ScriptedAgent::new(vec![
            delta(json!({"content": "A"})),
            delta(json!({"custom_content": {"state": {"k": 1}}})),
            Ok("garbage".to_string()),
            delta(json!({"content": "B", "custom_content": {"state": {"k": 2}}})),
        ]);
        let gateway = GpaGateway::new(agent.clone());
        let turn = Turn::new(
            vec![Message::user("q")],
            [("Api-Key", "user-key"), ("X-Conversation-Id", "conv-42")],
        )
        .unwrap();
        let sink = RecordingSink::new();

        let message = gateway
            .respond(Dispatch::new(&turn), Output::new(&sink))
            .await
            .unwrap();

        assert_eq!(message.content, "AB");
        assert_eq!(sink.content(), "AB");
        let state = message.state().unwrap();
        assert_eq!(state[continuity::IS_GPA], true);
        assert_eq!(state[continuity::GPA_MESSAGES], json!({"k": 2}));

        let (request, key) = agent.last_request();
        assert_eq!(key, "user-key");
        assert_eq!(
            request.extra_headers,
            vec![("x-conversation-id".to_string(), "conv-42".to_string())]
        );
    }

    #[tokio::test]
    async fn interrupted_stream_is_unreachable() {
        let agent = ScriptedAgent::new(vec![
            delta(json!({"content": "partial"})),
            Err(RelayError::Llm("connection reset".into())),
        ]);
        let gateway = GpaGateway::new(agent);
        let turn = Turn::new(vec![Message::user("q")], [("Api-Key", "k")]).unwrap();
        let sink = RecordingSink::new();

        let err = gateway
            .respond(Dispatch::new(&turn), Output::new(&sink))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::BackendUnreachable(_)));
        assert_eq!(sink.content(), "partial");
    }

    #[tokio::test]
    async fn error_frame_fails_turn_and_closes_stages() {
        let agent = ScriptedAgent::new(vec![
            delta(json!({"content": "partial"})),
            delta(json!({"custom_content": {"stages": [{"index": 0, "name": "Search"}]}})),
            Ok(json!({"error": {"message": "upstream model overloaded"}}).to_string()),
            delta(json!({"content": " never"})),
        ]);
        let gateway = GpaGateway::new(agent);
        let turn = Turn::new(vec![Message::user("q")], [("Api-Key", "k")]).unwrap();
        let sink = RecordingSink::new();

        let err = gateway
            .respond(Dispatch::new(&turn), Output::new(&sink))
            .await
            .unwrap_err();

        assert!(matches!(&err, RelayError::BackendUnreachable(m) if m.contains("overloaded")));
        assert_eq!(sink.content(), "partial");
        assert_eq!(sink.stage_names(), vec!["Search".to_string()]);
        assert_eq!(sink.open_stages(), 0);
    }

    #[test]
    fn tagged_reply_without_snapshot_keeps_its_prompt() {
        let question = Message::user("Plot the CSV");
        let mut marker = StateMap::new();
        marker.insert(continuity::IS_GPA.to_string(), Value::Bool(true));
        let reply =
            Message::assistant("done").with_custom_content(CustomContent::with_state(marker));
        let turn = Turn::from_messages(vec![question.clone(), reply, Message::user("again")])
            .unwrap();

        let messages = reconstruct_history(&turn, None);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], question);
        assert_eq!(messages[1].content, "again");
    }

    #[tokio::test]
    async fn no_credential_means_no_call() {
        let agent = ScriptedAgent::new(vec![]);
        let gateway = GpaGateway::new(agent.clone());
        let turn = Turn::from_messages(vec![Message::user("q")]).unwrap();
        let sink = RecordingSink::new();

        let err = gateway
            .respond(Dispatch::new(&turn), Output::new(&sink))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::CredentialMissing(_)));
        assert!(agent.seen.lock().unwrap().is_empty());
    }
}
